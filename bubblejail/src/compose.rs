//! Folds activated services into a single bwrap configuration.
//!
//! Application order is fixed: the default preamble, then `common`, then
//! the remaining services alphabetically, then `debug`. Equal inputs
//! always produce a byte-equal bwrap argv.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::bwrap::BindOp;
use crate::dbus::DbusRule;
use crate::error::{Error, Result};
use crate::seccomp::{self, SeccompFilter};
use crate::services::{self, Service, ServiceContext, StartupHook};

/// Host-side socket paths for one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    /// Per-instance runtime directory (mode 0700).
    pub runtime_dir: PathBuf,
    /// Helper control socket, bound by the runner, served by the helper.
    pub helper_socket: PathBuf,
    /// Session-bus proxy socket.
    pub dbus_session_socket: PathBuf,
    /// System-bus proxy socket.
    pub dbus_system_socket: PathBuf,
}

impl RunPaths {
    /// Paths under the per-instance runtime directory.
    pub fn new(runtime_dir: PathBuf) -> Self {
        Self {
            helper_socket: runtime_dir.join("helper.sock"),
            dbus_session_socket: runtime_dir.join("dbus_session_proxy"),
            dbus_system_socket: runtime_dir.join("dbus_system_proxy"),
            runtime_dir,
        }
    }
}

/// The merged product of all activated services.
#[derive(Debug)]
pub struct BwrapConfig {
    /// Filesystem ops in application order (env and FileWrite extracted).
    pub ops: Vec<BindOp>,
    /// Effective sandbox environment, last writer wins.
    pub env: BTreeMap<String, String>,
    /// Bytes to stage on inherited FDs, bound at the given paths.
    pub file_writes: Vec<(PathBuf, Vec<u8>)>,
    /// Session-bus proxy rules.
    pub session_rules: Vec<DbusRule>,
    /// System-bus proxy rules.
    pub system_rules: Vec<DbusRule>,
    /// Accumulated seccomp rules.
    pub seccomp: SeccompFilter,
    /// Keep the network namespace shared with the host.
    pub share_net: bool,
    /// Actions to run once the sandbox PID is known, in merger order.
    pub hooks: Vec<StartupHook>,
    /// Default argv for the sandboxed program.
    pub launch_argv: Vec<String>,
    /// Raw bwrap arguments from the debug service, applied last.
    pub raw_args: Vec<String>,
    /// `--debug-shell` run: keep the terminal, start a shell.
    pub debug_shell: bool,
    /// TERM/COLORTERM passthrough for the debug shell.
    terminal_env: Vec<(String, String)>,
}

/// Folds `services` (activation order) into a [`BwrapConfig`].
pub fn compose(
    services: &[Service],
    ctx: &ServiceContext,
    paths: &RunPaths,
) -> Result<BwrapConfig> {
    services::conflict_check(services)?;

    // Fixed application order: common, alphabetical middle, debug last.
    let mut ordered: Vec<&Service> = Vec::with_capacity(services.len());
    ordered.extend(services.iter().filter(|s| s.name() == "common"));
    let mut middle: Vec<&Service> = services
        .iter()
        .filter(|s| s.name() != "common" && s.name() != "debug")
        .collect();
    middle.sort_by_key(|s| s.name());
    ordered.extend(middle);
    ordered.extend(services.iter().filter(|s| s.name() == "debug"));

    let mut tagged_ops: Vec<(&'static str, BindOp)> = services::default_ops(ctx)?
        .into_iter()
        .map(|op| ("default", op))
        .collect();

    let mut session_rules = Vec::new();
    let mut system_rules = Vec::new();
    let mut seccomp = SeccompFilter::new();
    let mut launch_argv = Vec::new();
    let mut raw_args = Vec::new();

    if ctx.env.var("BUBBLEJAIL_DISABLE_SECCOMP_DEFAULTS").is_none() {
        for rule in seccomp::baseline_rules() {
            seccomp.add(&rule);
        }
    }

    let network_active = ordered.iter().any(|s| s.name() == "network");

    for service in &ordered {
        for op in service.bind_ops(ctx)? {
            tagged_ops.push((service.name(), op));
        }
        let (session, system) = service.dbus_rules();
        session_rules.extend(session);
        system_rules.extend(system);
        for rule in service.seccomp_rules() {
            seccomp.add(&rule);
        }
        launch_argv.extend(service.launch_args());
        raw_args.extend(service.raw_bwrap_args());
    }

    validate_sources(&tagged_ops)?;

    // The proxy socket binds join after source validation: the sockets
    // only exist once xdg-dbus-proxy is running.
    let has_dbus = !session_rules.is_empty() || !system_rules.is_empty();
    if has_dbus {
        let sandbox_bus = ctx.env.sandbox_runtime_dir().join("bus");
        tagged_ops.push((
            "dbus",
            BindOp::bind_at(&paths.dbus_session_socket, &sandbox_bus),
        ));
        tagged_ops.push((
            "dbus",
            BindOp::env(
                "DBUS_SESSION_BUS_ADDRESS",
                format!("unix:path={}", sandbox_bus.display()),
            ),
        ));
        // Both spellings of the system bus socket are in active use.
        tagged_ops.push((
            "dbus",
            BindOp::bind_at(&paths.dbus_system_socket, "/var/run/dbus/system_bus_socket"),
        ));
        tagged_ops.push((
            "dbus",
            BindOp::bind_at(&paths.dbus_system_socket, "/run/dbus/system_bus_socket"),
        ));
    }

    validate_collisions(&tagged_ops)?;

    // Fold env ops and extract FD-staged file content.
    let mut ops = Vec::new();
    let mut env = BTreeMap::new();
    let mut file_writes = Vec::new();
    let mut share_net = false;
    let mut seen = Vec::new();
    for (_, op) in tagged_ops {
        match op {
            BindOp::EnvSet { key, value } => {
                env.insert(key, value);
            }
            BindOp::EnvUnset { key } => {
                env.remove(&key);
            }
            BindOp::FileWrite { dst, bytes } => file_writes.push((dst, bytes)),
            BindOp::Share(kind) if kind == crate::namespaces::NsKind::Net => share_net = true,
            BindOp::Share(_) => {}
            other => {
                // Scanning services can emit the same bind twice.
                if !seen.contains(&other) {
                    seen.push(other.clone());
                    ops.push(other);
                }
            }
        }
    }

    let hooks = ordered
        .iter()
        .filter_map(|s| s.startup_hook(network_active))
        .collect();

    if ctx.debug_shell {
        launch_argv = vec!["/bin/sh".into()];
    }

    let terminal_env = ["TERM", "COLORTERM"]
        .iter()
        .filter_map(|&k| ctx.env.var(k).map(|v| (k.to_owned(), v.to_owned())))
        .collect();

    Ok(BwrapConfig {
        ops,
        env,
        file_writes,
        session_rules,
        system_rules,
        seccomp,
        share_net,
        hooks,
        launch_argv,
        raw_args,
        debug_shell: ctx.debug_shell,
        terminal_env,
    })
}

impl BwrapConfig {
    /// Whether a D-Bus proxy has to run for this config.
    pub fn has_dbus(&self) -> bool {
        !self.session_rules.is_empty() || !self.system_rules.is_empty()
    }

    /// The bwrap argv up to (not including) FD-carrying options.
    ///
    /// The runner appends `--ro-bind-data`, `--seccomp`, `--info-fd` and
    /// the helper invocation, all of which need live FD numbers.
    pub fn base_argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();

        argv.push("--unshare-all".into());
        argv.push("--die-with-parent".into());
        // The helper is our own reaper.
        argv.push("--as-pid-1".into());
        if !self.debug_shell {
            argv.push("--new-session".into());
        }
        if self.share_net {
            argv.push("--share-net".into());
        }
        argv.extend(["--proc".into(), "/proc".into()]);
        argv.extend(["--dev".into(), "/dev".into()]);
        argv.push("--clearenv".into());

        if self.debug_shell {
            for (key, value) in &self.terminal_env {
                argv.extend(["--setenv".into(), key.clone(), value.clone()]);
            }
        }

        for op in &self.ops {
            op.extend_argv(&mut argv);
        }

        for (key, value) in &self.env {
            argv.extend(["--setenv".into(), key.clone(), value.clone()]);
        }

        argv.extend(self.raw_args.iter().cloned());
        argv
    }
}

/// Every non-`try` bind source must exist on the host.
fn validate_sources(ops: &[(&'static str, BindOp)]) -> Result<()> {
    for (_, op) in ops {
        if op.is_try() {
            continue;
        }
        if let Some(src) = op.src() {
            if !src.exists() {
                return Err(Error::BindSourceMissing(src.to_path_buf()));
            }
        }
    }
    Ok(())
}

/// Exact destination collisions between binds are composition errors,
/// unless both sides are read-only or one side came from `root_share`
/// (which deliberately overlays service binds).
fn validate_collisions(ops: &[(&'static str, BindOp)]) -> Result<()> {
    let binds: Vec<(&'static str, &BindOp)> = ops
        .iter()
        .filter(|(_, op)| matches!(op, BindOp::Bind { .. } | BindOp::FileWrite { .. }))
        .map(|(origin, op)| (*origin, op))
        .collect();

    for (i, (origin_a, a)) in binds.iter().enumerate() {
        for (origin_b, b) in &binds[..i] {
            if a == b {
                // Identical ops are deduplicated later.
                continue;
            }
            if a.dst() != b.dst() {
                continue;
            }
            if a.is_readonly() && b.is_readonly() {
                continue;
            }
            if *origin_a == "root_share" || *origin_b == "root_share" {
                continue;
            }
            return Err(Error::ConfigParse(format!(
                "services {origin_b:?} and {origin_a:?} both bind {}",
                a.dst().unwrap_or_else(|| Path::new("?")).display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::HostEnv;
    use std::collections::BTreeMap as Map;

    fn service(name: &str, toml: &str) -> Service {
        Service::from_table(name, &toml::from_str(toml).unwrap()).unwrap()
    }

    fn ctx_with_home(home: &Path, instance_home: &Path) -> ServiceContext {
        ServiceContext {
            env: HostEnv {
                vars: Map::from([
                    ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                    ("LANG".to_string(), "C.UTF-8".to_string()),
                ]),
                home: home.to_path_buf(),
                runtime_dir: "/run/user/1000".into(),
                uid: 1000,
                user: "u".into(),
            },
            home_bind_src: instance_home.to_path_buf(),
            debug_shell: false,
        }
    }

    fn paths() -> RunPaths {
        RunPaths::new("/run/user/1000/bubblejail/t1".into())
    }

    fn fixture() -> (tempfile::TempDir, ServiceContext) {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        let instance_home = dir.path().join("instance-home");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::create_dir_all(&instance_home).unwrap();
        let ctx = ctx_with_home(&home, &instance_home);
        (dir, ctx)
    }

    #[test]
    fn equal_inputs_yield_byte_equal_argv() {
        let (_dir, ctx) = fixture();
        let services = vec![
            service("common", "executable_name = \"/bin/true\""),
            service("network", ""),
        ];
        let a = compose(&services, &ctx, &paths()).unwrap().base_argv();
        let b = compose(&services, &ctx, &paths()).unwrap().base_argv();
        assert_eq!(a, b);
    }

    #[test]
    fn activation_order_does_not_matter() {
        let (_dir, ctx) = fixture();
        let forward = vec![service("common", ""), service("network", "")];
        let backward = vec![service("network", ""), service("common", "")];
        assert_eq!(
            compose(&forward, &ctx, &paths()).unwrap().base_argv(),
            compose(&backward, &ctx, &paths()).unwrap().base_argv()
        );
    }

    #[test]
    fn minimal_run_has_no_dbus() {
        let (_dir, ctx) = fixture();
        let services = vec![service("common", "executable_name = \"/bin/true\"")];
        let config = compose(&services, &ctx, &paths()).unwrap();
        assert!(!config.has_dbus());
        assert_eq!(config.launch_argv, vec!["/bin/true"]);
        let argv = config.base_argv();
        assert!(!argv.iter().any(|a| a.contains("dbus")));
        assert_eq!(argv[0], "--unshare-all");
    }

    #[test]
    fn notify_service_pulls_in_dbus_binds() {
        let (_dir, ctx) = fixture();
        let services = vec![service("common", ""), service("notify", "")];
        let config = compose(&services, &ctx, &paths()).unwrap();
        assert!(config.has_dbus());
        let argv = config.base_argv();
        let joined = argv.join(" ");
        assert!(joined.contains("/run/user/1000/bubblejail/t1/dbus_session_proxy"));
        assert!(joined.contains("/run/dbus/system_bus_socket"));
        assert!(joined.contains("unix:path=/run/user/1000/bus"));
    }

    #[test]
    fn conflicting_services_fail_before_any_work() {
        let (_dir, ctx) = fixture();
        let services = vec![service("network", ""), service("slirp4netns", "")];
        let err = compose(&services, &ctx, &paths()).unwrap_err();
        assert!(matches!(err, Error::ServiceConflict { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn home_share_bind_appears_and_missing_src_is_fatal() {
        let (dir, ctx) = fixture();
        let downloads = ctx.env.home.join("Downloads");
        std::fs::create_dir_all(&downloads).unwrap();

        let services = vec![
            service("common", ""),
            service("home_share", "home_paths = [\"Downloads\"]"),
        ];
        let config = compose(&services, &ctx, &paths()).unwrap();
        let argv = config.base_argv();
        let downloads_str = downloads.to_string_lossy().into_owned();
        let pos = argv.iter().position(|a| *a == downloads_str).unwrap();
        assert_eq!(argv[pos - 1], "--bind");
        assert_eq!(argv[pos + 1], downloads_str);

        std::fs::remove_dir_all(&downloads).unwrap();
        let err = compose(&services, &ctx, &paths()).unwrap_err();
        assert!(matches!(err, Error::BindSourceMissing(_)));
        assert_eq!(err.exit_code(), 4);
        drop(dir);
    }

    #[test]
    fn env_ops_compose_last_writer_wins() {
        let (_dir, ctx) = fixture();
        let services = vec![service(
            "common",
            "environment = { PATH = \"/custom/bin\", FOO = \"bar\" }",
        )];
        let config = compose(&services, &ctx, &paths()).unwrap();
        // common's environment table overrides the preamble PATH.
        assert_eq!(config.env.get("PATH").unwrap(), "/custom/bin");
        assert_eq!(config.env.get("FOO").unwrap(), "bar");
        assert_eq!(
            config.env.get("HOME").map(String::as_str),
            ctx.env.home.to_str()
        );
    }

    #[test]
    fn duplicate_rw_binds_from_distinct_services_collide() {
        let (dir, ctx) = fixture();
        let shared = ctx.env.home.join("Shared");
        std::fs::create_dir_all(&shared).unwrap();
        let shared_str = shared.to_string_lossy().into_owned();

        // home_share and root_share both bind the same path; root_share
        // is explicitly allowed to overlap.
        let services = vec![
            service("home_share", "home_paths = [\"Shared\"]"),
            service(
                "root_share",
                &format!("paths = [{shared_str:?}]"),
            ),
        ];
        assert!(compose(&services, &ctx, &paths()).is_ok());
        drop(dir);
    }

    #[test]
    fn all_destinations_are_absolute() {
        let (_dir, ctx) = fixture();
        let services = vec![service("common", ""), service("network", "")];
        let config = compose(&services, &ctx, &paths()).unwrap();
        for op in &config.ops {
            if let Some(dst) = op.dst() {
                assert!(dst.is_absolute(), "relative dst: {dst:?}");
            }
        }
    }

    #[test]
    fn debug_raw_args_come_last() {
        let (_dir, ctx) = fixture();
        let services = vec![
            service("common", ""),
            service("debug", "raw_bwrap_args = [\"--hostname\", \"bubble\"]"),
        ];
        let argv = compose(&services, &ctx, &paths()).unwrap().base_argv();
        assert_eq!(argv[argv.len() - 2..], ["--hostname", "bubble"]);
    }

    #[test]
    fn debug_shell_replaces_launch_argv() {
        let (_dir, mut ctx) = fixture();
        ctx.debug_shell = true;
        ctx.env
            .vars
            .insert("TERM".into(), "xterm-256color".into());
        let services = vec![service("common", "executable_name = \"/bin/true\"")];
        let config = compose(&services, &ctx, &paths()).unwrap();
        assert_eq!(config.launch_argv, vec!["/bin/sh"]);
        let argv = config.base_argv();
        assert!(!argv.contains(&"--new-session".to_string()));
        assert!(argv.contains(&"xterm-256color".to_string()));
    }
}
