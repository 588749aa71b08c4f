//! CLI for the bubblejail sandbox launcher.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod autocomplete;

use anyhow::{Context, Result};
use bubblejail::dbus::DbusLogMode;
use bubblejail::{desktop, profile, Error, InstanceStore, RunOptions, Runner};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser)]
#[command(
    name = "bubblejail",
    version,
    about = "Bubblewrap-based sandboxing utility for desktop applications"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new instance, optionally from a profile.
    Create {
        /// Profile to seed the services config from.
        #[arg(long)]
        profile: Option<String>,
        /// Do not generate a desktop entry.
        #[arg(long)]
        no_desktop_entry: bool,
        /// New instance name.
        name: String,
    },
    /// Run a command inside an instance's sandbox.
    Run(Box<RunArgs>),
    /// List instances, profiles, or services.
    List {
        /// What to list.
        #[arg(default_value = "instances")]
        list_what: ListWhat,
    },
    /// Open the instance's services config in $EDITOR.
    Edit {
        /// Instance name.
        name: String,
    },
    /// Generate or overwrite the instance's desktop entry.
    GenerateDesktopEntry {
        /// Take the desktop entry from this profile.
        #[arg(long, conflicts_with = "desktop_entry")]
        profile: Option<String>,
        /// Desktop entry name or path to rewrite.
        #[arg(long)]
        desktop_entry: Option<String>,
        /// Instance name.
        name: String,
    },
    /// Shell completion callback (used by the completion scripts).
    #[command(name = "auto-complete", hide = true)]
    AutoComplete {
        /// The COMP_LINE being completed.
        comp_line: String,
    },
    /// Generate shell completion scripts.
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ListWhat {
    /// Existing instances.
    Instances,
    /// Discoverable profiles.
    Profiles,
    /// Built-in services.
    Services,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Wait for the command and print its captured output.
    #[arg(long)]
    wait: bool,

    /// Start /bin/sh attached to the terminal instead of the command.
    #[arg(long)]
    debug_shell: bool,

    /// Print the expanded bwrap invocation and exit.
    #[arg(long)]
    dry_run: bool,

    /// Log D-Bus traffic (`raw` prints the proxy log verbatim).
    #[arg(long, value_name = "MODE", num_args = 0..=1, default_missing_value = "parse")]
    debug_log_dbus: Option<String>,

    /// Extra raw bwrap argument. Repeatable.
    #[arg(long = "debug-bwrap-args", value_name = "ARG")]
    debug_bwrap_args: Vec<String>,

    /// Summarize blocked D-Bus names after the run.
    #[arg(long)]
    wizard: bool,

    /// Instance name.
    name: String,

    /// Command and arguments to run (defaults to the instance's
    /// executable_name).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BUBBLEJAIL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let instance_name = cli.instance_name().map(str::to_owned);

    if let Err(e) = cli.dispatch().await {
        eprintln!("bubblejail: {e:#}");
        let code = e
            .downcast_ref::<Error>()
            .map(Error::exit_code)
            .unwrap_or(1);
        if code != 0 {
            notify_failure(instance_name.as_deref(), &format!("{e:#}"));
        }
        std::process::exit(code);
    }
}

impl Cli {
    /// Instance the command targets, for failure notifications.
    fn instance_name(&self) -> Option<&str> {
        match &self.command {
            Command::Run(args) => Some(&args.name),
            Command::Create { name, .. }
            | Command::Edit { name }
            | Command::GenerateDesktopEntry { name, .. } => Some(name),
            _ => None,
        }
    }

    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Create {
                profile,
                no_desktop_entry,
                name,
            } => create(profile.as_deref(), no_desktop_entry, &name),
            Command::Run(args) => args.run().await,
            Command::List { list_what } => list(list_what),
            Command::Edit { name } => {
                let instance = InstanceStore::open()?.get(&name)?;
                instance.edit_config().await.map_err(Into::into)
            }
            Command::GenerateDesktopEntry {
                profile,
                desktop_entry,
                name,
            } => generate_desktop_entry(profile.as_deref(), desktop_entry.as_deref(), &name),
            Command::AutoComplete { comp_line } => {
                for candidate in autocomplete::complete(&comp_line) {
                    println!("{candidate}");
                }
                Ok(())
            }
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "bubblejail",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

fn create(profile_name: Option<&str>, no_desktop_entry: bool, name: &str) -> Result<()> {
    let store = InstanceStore::open()?;

    let profile = profile_name.map(profile::find).transpose()?;
    let instance = store.create(name, profile.as_ref().map(|p| &p.services))?;

    if let Some(profile_name) = profile_name {
        instance.set_creation_profile_name(profile_name)?;
    }

    if !no_desktop_entry {
        let source = profile.as_ref().and_then(|p| p.find_desktop_entry());
        desktop::write_entry(&instance, source.as_deref())?;
    }

    if let Some(profile) = &profile {
        eprintln!("Import tips: {}", profile.import_tips);
    }
    Ok(())
}

fn list(what: ListWhat) -> Result<()> {
    match what {
        ListWhat::Instances => {
            for name in InstanceStore::open()?.list()? {
                println!("{name}");
            }
        }
        ListWhat::Profiles => {
            for name in profile::list_names() {
                println!("{name}");
            }
        }
        ListWhat::Services => {
            for service in bubblejail::SERVICES {
                println!("{}", service.name);
            }
        }
    }
    Ok(())
}

fn generate_desktop_entry(
    profile_name: Option<&str>,
    desktop_entry: Option<&str>,
    name: &str,
) -> Result<()> {
    let instance = InstanceStore::open()?.get(name)?;

    let source = if let Some(entry) = desktop_entry {
        Some(
            desktop::resolve_entry_arg(entry)
                .with_context(|| format!("desktop entry {entry:?} not found"))?,
        )
    } else {
        // Explicit profile, then the profile recorded at create time.
        let profile_name = profile_name
            .map(str::to_owned)
            .or_else(|| instance.creation_profile_name());
        match profile_name {
            Some(profile_name) => profile::find(&profile_name)?.find_desktop_entry(),
            None => None,
        }
    };

    desktop::write_entry(&instance, source.as_deref())?;
    Ok(())
}

impl RunArgs {
    async fn run(self) -> Result<()> {
        let instance = InstanceStore::open()?.get(&self.name)?;

        let log_dbus = match self.debug_log_dbus.as_deref() {
            _ if self.wizard => DbusLogMode::Parse,
            Some("raw") => DbusLogMode::Raw,
            Some(_) => DbusLogMode::Parse,
            None => DbusLogMode::None,
        };

        // Re-entry: forward the command into the running sandbox and
        // report `AlreadyRunning` (informational, exit 0) unless the
        // forwarded command itself failed.
        if instance.is_running() {
            if self.dry_run {
                eprintln!("Found helper socket.");
                eprintln!("Args would be sent: {:?}", self.args);
                return Ok(());
            }
            let result = bubblejail::send_run(&instance, self.args, self.wait).await?;
            if let Some((code, stdout, stderr)) = result {
                print!("{stdout}");
                eprint!("{stderr}");
                if code != 0 {
                    return Err(Error::SandboxExit(code).into());
                }
            }
            return Err(Error::AlreadyRunning.into());
        }

        let runner = Runner::prepare(
            instance,
            RunOptions {
                argv: self.args,
                dry_run: self.dry_run,
                debug_shell: self.debug_shell,
                log_dbus,
                extra_bwrap_args: self.debug_bwrap_args,
                wizard: self.wizard,
            },
        )?;
        let code = runner.launch().await?;
        if code != 0 {
            return Err(Error::SandboxExit(code).into());
        }
        Ok(())
    }
}

/// Posts a failure notification when stderr is not a terminal, so
/// desktop-launched instances still surface errors. notify-send is
/// optional.
fn notify_failure(instance_name: Option<&str>, detail: &str) {
    use std::io::IsTerminal;

    if std::io::stderr().is_terminal() {
        return;
    }
    let summary = match instance_name {
        Some(name) => format!("Failed to run instance: {name}"),
        None => "bubblejail failed".to_owned(),
    };
    let _ = std::process::Command::new("notify-send")
        .args(["--icon", "bubblejail-config", &summary, detail])
        .status();
}
