//! D-Bus filtering rules and the xdg-dbus-proxy supervisor.
//!
//! Rules translate bit-exact to xdg-dbus-proxy flags (`--talk=`, `--own=`,
//! `--call=`, `--broadcast=`, `--filter`). The proxy is started before
//! bwrap, signals readiness by closing its `--fd` pipe, and a non-zero
//! exit during startup is always fatal.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::paths;

/// One D-Bus filter rule. Session or system placement is decided by which
/// list the rule is added to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbusRule {
    /// Allow talking to a (possibly wildcarded) well-known name.
    Talk(String),
    /// Allow owning a (possibly wildcarded) well-known name.
    Own(String),
    /// Allow calls to one interface/path of a name.
    Call {
        /// Destination bus name.
        name: String,
        /// Interface (or member) filter, `*` for any.
        interface: String,
        /// Object path filter.
        object_path: String,
    },
    /// Allow receiving broadcasts matching the rule.
    Broadcast {
        /// Sender bus name.
        name: String,
        /// Interface (or member) filter.
        interface: String,
        /// Object path filter.
        object_path: String,
    },
    /// Raw xdg-dbus-proxy argument (debug service escape hatch).
    Raw(String),
}

impl DbusRule {
    /// Call rule for every interface at one object path.
    pub fn call_at(name: &str, object_path: &str) -> Self {
        Self::Call {
            name: name.into(),
            interface: "*".into(),
            object_path: object_path.into(),
        }
    }

    /// The xdg-dbus-proxy argument for this rule.
    pub fn to_arg(&self) -> String {
        match self {
            Self::Talk(name) => format!("--talk={name}"),
            Self::Own(name) => format!("--own={name}"),
            Self::Call {
                name,
                interface,
                object_path,
            } => format!("--call={name}={interface}@{object_path}"),
            Self::Broadcast {
                name,
                interface,
                object_path,
            } => format!("--broadcast={name}={interface}@{object_path}"),
            Self::Raw(arg) => arg.clone(),
        }
    }
}

/// What to do with the proxy's log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbusLogMode {
    /// No logging.
    #[default]
    None,
    /// Pass `--log`, let the proxy write to stderr.
    Raw,
    /// Pass `--log`, capture stdout and feed it to [`DbusLogParser`].
    Parse,
}

/// How long the proxy may take to signal readiness.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period between SIGTERM and SIGKILL at shutdown.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Supervisor for one xdg-dbus-proxy process serving both buses.
#[derive(Debug)]
pub struct DbusProxy {
    session_socket: PathBuf,
    system_socket: PathBuf,
    session_rules: Vec<DbusRule>,
    system_rules: Vec<DbusRule>,
    log_mode: DbusLogMode,
    child: Option<Child>,
}

impl DbusProxy {
    /// New supervisor writing proxy sockets at the given paths.
    pub fn new(session_socket: PathBuf, system_socket: PathBuf, log_mode: DbusLogMode) -> Self {
        Self {
            session_socket,
            system_socket,
            session_rules: Vec::new(),
            system_rules: Vec::new(),
            log_mode,
            child: None,
        }
    }

    /// Adds a session-bus rule.
    pub fn add_session_rule(&mut self, rule: DbusRule) {
        self.session_rules.push(rule);
    }

    /// Adds a system-bus rule.
    pub fn add_system_rule(&mut self, rule: DbusRule) {
        self.system_rules.push(rule);
    }

    /// True when at least one rule exists; without rules no proxy runs.
    pub fn has_rules(&self) -> bool {
        !self.session_rules.is_empty() || !self.system_rules.is_empty()
    }

    /// Host-side session proxy socket path.
    pub fn session_socket(&self) -> &Path {
        &self.session_socket
    }

    /// Host-side system proxy socket path.
    pub fn system_socket(&self) -> &Path {
        &self.system_socket
    }

    /// Full xdg-dbus-proxy argv (without the leading binary path).
    ///
    /// Deterministic for a given rule set; also used by `--dry-run`.
    pub fn proxy_args(&self, session_bus: &str, ready_fd: i32) -> Vec<String> {
        let mut args = vec![format!("--fd={ready_fd}")];

        // Session bus.
        args.push(session_bus.to_owned());
        args.push(self.session_socket.to_string_lossy().into_owned());
        args.extend(self.session_rules.iter().map(DbusRule::to_arg));
        args.push("--filter".into());
        if self.log_mode != DbusLogMode::None {
            args.push("--log".into());
        }

        // System bus.
        args.push("unix:path=/run/dbus/system_bus_socket".into());
        args.push(self.system_socket.to_string_lossy().into_owned());
        args.extend(self.system_rules.iter().map(DbusRule::to_arg));
        args.push("--filter".into());
        if self.log_mode != DbusLogMode::None {
            args.push("--log".into());
        }

        args
    }

    /// Spawns the proxy and waits until it is listening.
    ///
    /// Readiness is the proxy closing (or writing to) the write end of the
    /// `--fd` pipe. An early exit or a [`STARTUP_TIMEOUT`] miss is a
    /// [`Error::DBusProxyStartupFailed`]; there is deliberately no
    /// fallback to an unfiltered bus.
    pub async fn start(&mut self, parser: Option<&mut DbusLogParser>) -> Result<()> {
        let proxy_bin = paths::which("xdg-dbus-proxy")
            .ok_or_else(|| Error::DependencyMissing("xdg-dbus-proxy".into()))?;

        let session_bus = std::env::var("DBUS_SESSION_BUS_ADDRESS")
            .ok()
            .or_else(|| {
                paths::runtime_dir()
                    .ok()
                    .map(|d| format!("unix:path={}", d.join("bus").display()))
            })
            .ok_or_else(|| Error::DependencyMissing("DBUS_SESSION_BUS_ADDRESS".into()))?;

        let (ready_rx, ready_tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        // The child must inherit the write end across exec.
        fcntl(ready_tx.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;

        let args = self.proxy_args(&session_bus, ready_tx.as_raw_fd());
        debug!(?args, "starting xdg-dbus-proxy");

        let mut cmd = tokio::process::Command::new(proxy_bin);
        cmd.args(&args);
        if self.log_mode == DbusLogMode::Parse {
            cmd.stdout(Stdio::piped());
        }
        let mut child = cmd.spawn()?;
        drop(ready_tx);

        if self.log_mode == DbusLogMode::Parse {
            if let (Some(parser), Some(stdout)) = (parser, child.stdout.take()) {
                parser.attach(stdout);
            }
        }

        // Wait for the ready byte, racing early proxy death.
        let mut ready_pipe = tokio::net::unix::pipe::Receiver::from_owned_fd(ready_rx)?;
        let mut byte = [0u8; 1];
        tokio::select! {
            read = ready_pipe.read(&mut byte) => {
                read?;
            }
            status = child.wait() => {
                let status = status?;
                return Err(Error::DBusProxyStartupFailed(format!(
                    "xdg-dbus-proxy exited during startup: {status}"
                )));
            }
            _ = tokio::time::sleep(STARTUP_TIMEOUT) => {
                let _ = child.start_kill();
                return Err(Error::DBusProxyStartupFailed(
                    "xdg-dbus-proxy did not signal readiness in time".into(),
                ));
            }
        }

        // The pipe may also report readiness via exit; double-check.
        if let Some(status) = child.try_wait()? {
            return Err(Error::DBusProxyStartupFailed(format!(
                "xdg-dbus-proxy exited during startup: {status}"
            )));
        }

        info!(
            session = %self.session_socket.display(),
            system = %self.system_socket.display(),
            "xdg-dbus-proxy listening"
        );
        self.child = Some(child);
        Ok(())
    }

    /// Terminates the proxy (SIGTERM, grace, SIGKILL) and unlinks its
    /// sockets. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::SIGTERM,
                );
            }
            if tokio::time::timeout(STOP_TIMEOUT, child.wait()).await.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        let _ = std::fs::remove_file(&self.session_socket);
        let _ = std::fs::remove_file(&self.system_socket);
    }
}

// ---------------------------------------------------------------------------
// Log parsing (wizard / --debug-log-dbus)
// ---------------------------------------------------------------------------

/// Extracts blocked names from xdg-dbus-proxy `--log` output.
///
/// Used by `--wizard` to suggest `dbus_name` / talk rules after a run.
#[derive(Debug)]
pub struct DbusLogParser {
    filtering_re: regex::Regex,
    call_re: regex::Regex,
    results: std::sync::Arc<std::sync::Mutex<DbusLogSummary>>,
}

/// Names the sandboxed application tried to use but was blocked from.
#[derive(Debug, Default, Clone)]
pub struct DbusLogSummary {
    /// Names the application tried to own (`dbus_name` candidates).
    pub wants_own: Vec<String>,
    /// Names the application tried to talk to.
    pub wants_talk: Vec<String>,
}

impl Default for DbusLogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DbusLogParser {
    /// New parser with an empty summary.
    pub fn new() -> Self {
        Self {
            filtering_re: regex::Regex::new(
                r"^Filtering message due to arg0 (?P<name>[\w.]+), policy: \d+ \(required (?P<required>\d+)\)",
            )
            .expect("static regex"),
            call_re: regex::Regex::new(
                r"^C\d+: -> (?P<service>[\w.]+) call (?P<member>[\w.]+) at",
            )
            .expect("static regex"),
            results: Default::default(),
        }
    }

    /// Spawns a detached task consuming the proxy's log stream. It ends
    /// when the proxy closes its stdout.
    fn attach(&mut self, stream: tokio::process::ChildStdout) {
        let filtering_re = self.filtering_re.clone();
        let call_re = self.call_re.clone();
        let results = self.results.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            let mut lines = tokio::io::BufReader::new(stream).lines();
            let mut last_call: Option<(String, String)> = None;
            while let Ok(Some(line)) = lines.next_line().await {
                let previous = last_call.take();
                if let Some(caps) = filtering_re.captures(&line) {
                    let name = caps["name"].to_owned();
                    match previous {
                        Some((service, member))
                            if service == "org.freedesktop.DBus"
                                && member == "org.freedesktop.DBus.RequestName" =>
                        {
                            warn!(%name, "D-Bus: blocked from owning name");
                            push_unique(&mut results.lock().expect("parser lock").wants_own, name);
                        }
                        Some((service, _)) if service == "org.freedesktop.DBus" => {
                            warn!(%name, "D-Bus: blocked from inquiring about service");
                            push_unique(&mut results.lock().expect("parser lock").wants_talk, name);
                        }
                        _ => {}
                    }
                } else if let Some(caps) = call_re.captures(&line) {
                    last_call = Some((caps["service"].to_owned(), caps["member"].to_owned()));
                } else if line.starts_with("*HIDDEN*") {
                    if let Some((service, _)) = previous {
                        warn!(%service, "D-Bus: blocked from calling service");
                        push_unique(&mut results.lock().expect("parser lock").wants_talk, service);
                    }
                }
            }
        });
    }

    /// Snapshot of what was blocked so far.
    pub fn summary(&self) -> DbusLogSummary {
        self.results.lock().expect("parser lock").clone()
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_translate_to_proxy_flags() {
        assert_eq!(DbusRule::Talk("org.a.B".into()).to_arg(), "--talk=org.a.B");
        assert_eq!(DbusRule::Own("org.a.B".into()).to_arg(), "--own=org.a.B");
        assert_eq!(
            DbusRule::call_at("org.kde.StatusNotifierWatcher", "/StatusNotifierWatcher").to_arg(),
            "--call=org.kde.StatusNotifierWatcher=*@/StatusNotifierWatcher"
        );
        assert_eq!(
            DbusRule::Broadcast {
                name: "org.a.B".into(),
                interface: "org.a.B.Signal".into(),
                object_path: "/org/a".into(),
            }
            .to_arg(),
            "--broadcast=org.a.B=org.a.B.Signal@/org/a"
        );
        assert_eq!(DbusRule::Raw("--sloppy-names".into()).to_arg(), "--sloppy-names");
    }

    #[test]
    fn proxy_args_order_session_then_system() {
        let mut proxy = DbusProxy::new(
            "/run/user/1000/bubblejail/t/dbus_session_proxy".into(),
            "/run/user/1000/bubblejail/t/dbus_system_proxy".into(),
            DbusLogMode::None,
        );
        proxy.add_session_rule(DbusRule::Talk("org.freedesktop.Notifications".into()));
        proxy.add_system_rule(DbusRule::Raw("--sloppy-names".into()));

        let args = proxy.proxy_args("unix:path=/run/user/1000/bus", 5);
        assert_eq!(args[0], "--fd=5");
        assert_eq!(args[1], "unix:path=/run/user/1000/bus");
        let session_filter = args.iter().position(|a| a == "--filter").unwrap();
        assert!(args[..session_filter]
            .contains(&"--talk=org.freedesktop.Notifications".to_string()));
        // System bus section follows the session section.
        let system_bus = args
            .iter()
            .position(|a| a == "unix:path=/run/dbus/system_bus_socket")
            .unwrap();
        assert!(system_bus > session_filter);
        assert!(args[system_bus..].contains(&"--sloppy-names".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "--filter").count(), 2);
    }

    #[test]
    fn no_rules_means_no_proxy() {
        let proxy = DbusProxy::new("/a".into(), "/b".into(), DbusLogMode::None);
        assert!(!proxy.has_rules());
    }
}
