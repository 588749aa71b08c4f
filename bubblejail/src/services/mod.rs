//! Built-in sandbox services.
//!
//! A service is a capability provider: from its validated options it
//! emits filesystem/environment ops ([`BindOp`]), D-Bus rules, seccomp
//! rules, and startup hooks. Services never call each other; they only
//! feed the config merger.

mod catalog;
mod options;

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::warn;

pub use catalog::{lookup, OptionInfo, OptionType, ServiceInfo, SERVICES};
pub use options::{
    CommonOptions, DebugOptions, DirectRenderingOptions, EmptyOptions, HomeShareOptions,
    NamespacesLimitsOptions, PastaOptions, RootShareOptions, Slirp4netnsOptions, StrList,
};

use crate::bwrap::BindOp;
use crate::dbus::DbusRule;
use crate::error::{Error, Result};
use crate::namespaces::{NsKind, NsLimits};
use crate::seccomp::SeccompRule;

/// Environment variables forwarded into the sandbox when the host has
/// them and a windowing service is active.
const XDG_DESKTOP_VARS: &[&str] = &[
    "XDG_CURRENT_DESKTOP",
    "DESKTOP_SESSION",
    "XDG_SESSION_TYPE",
    "XDG_SESSION_DESKTOP",
];

/// Pre-0.6.0 home bind path, kept as a compatibility symlink.
const OLD_HOME_BIND: &str = "/home/user";

// ---------------------------------------------------------------------------
// Host environment snapshot
// ---------------------------------------------------------------------------

/// Snapshot of everything a service may read from the host environment.
///
/// Captured once per run so composition is deterministic and testable.
#[derive(Debug, Clone)]
pub struct HostEnv {
    /// Selected environment variables present on the host.
    pub vars: BTreeMap<String, String>,
    /// The user's real home directory.
    pub home: PathBuf,
    /// Host `$XDG_RUNTIME_DIR`.
    pub runtime_dir: PathBuf,
    /// Host UID; the sandbox runtime dir is `/run/user/<uid>`.
    pub uid: u32,
    /// Login name.
    pub user: String,
}

impl HostEnv {
    /// Variables [`HostEnv::capture`] snapshots.
    const CAPTURED: &'static [&'static str] = &[
        "XDG_CURRENT_DESKTOP",
        "DESKTOP_SESSION",
        "XDG_SESSION_TYPE",
        "XDG_SESSION_DESKTOP",
        "DISPLAY",
        "XAUTHORITY",
        "WAYLAND_DISPLAY",
        "LANG",
        "PATH",
        "TERM",
        "COLORTERM",
        "PULSE_SERVER",
        "DBUS_SESSION_BUS_ADDRESS",
        "EDITOR",
        "BUBBLEJAIL_DISABLE_SECCOMP_DEFAULTS",
    ];

    /// Captures the live process environment.
    pub fn capture() -> Result<Self> {
        let mut vars = BTreeMap::new();
        for key in Self::CAPTURED {
            if let Ok(value) = std::env::var(key) {
                vars.insert((*key).to_owned(), value);
            }
        }
        Ok(Self {
            vars,
            home: crate::paths::home_dir()?,
            runtime_dir: crate::paths::runtime_dir()?,
            uid: nix::unistd::getuid().as_raw(),
            user: std::env::var("USER").unwrap_or_else(|_| "user".into()),
        })
    }

    /// A captured variable, if the host had it.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// The runtime dir path as seen from inside the sandbox.
    pub fn sandbox_runtime_dir(&self) -> PathBuf {
        PathBuf::from(format!("/run/user/{}", self.uid))
    }

    /// `PATH` filtered to distribution locations.
    fn sandbox_path_var(&self) -> String {
        self.var("PATH")
            .unwrap_or("/usr/bin:/bin:/sbin")
            .split(':')
            .filter(|p| p.starts_with("/usr/") || *p == "/bin" || *p == "/sbin")
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Everything a service needs to emit its ops.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    /// Host environment snapshot.
    pub env: HostEnv,
    /// Host directory bound as the sandbox home.
    pub home_bind_src: PathBuf,
    /// `run --debug-shell` is active.
    pub debug_shell: bool,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// One activated service with its validated options.
#[derive(Debug, Clone, PartialEq)]
pub enum Service {
    /// `[common]`
    Common(CommonOptions),
    /// `[x11]`
    X11,
    /// `[wayland]`
    Wayland,
    /// `[network]`
    Network,
    /// `[pulse_audio]`
    PulseAudio,
    /// `[home_share]`
    HomeShare(HomeShareOptions),
    /// `[direct_rendering]`
    DirectRendering(DirectRenderingOptions),
    /// `[systray]`
    Systray,
    /// `[joystick]`
    Joystick,
    /// `[root_share]`
    RootShare(RootShareOptions),
    /// `[openjdk]`
    OpenJdk,
    /// `[notify]`
    Notify,
    /// `[ibus]`
    IBus,
    /// `[fcitx]`
    Fcitx,
    /// `[slirp4netns]`
    Slirp4netns(Slirp4netnsOptions),
    /// `[pasta_network]`
    PastaNetwork(PastaOptions),
    /// `[namespaces_limits]`
    NamespacesLimits(NamespacesLimitsOptions),
    /// `[v4l]`
    V4l,
    /// `[pipewire]`
    Pipewire,
    /// `[gamemode]`
    Gamemode,
    /// `[mpris]`
    Mpris,
    /// `[xdg_desktop_portal]`
    XdgDesktopPortal,
    /// `[debug]`
    Debug(DebugOptions),
}

/// An action that needs the running sandbox PID.
#[derive(Debug, Clone)]
pub enum StartupHook {
    /// Attach slirp4netns to the sandbox network namespace.
    Slirp4netns(Slirp4netnsOptions),
    /// Attach pasta to the sandbox network namespace.
    Pasta(PastaOptions),
    /// Write namespace ceilings into the sandbox user namespace.
    NamespaceLimits(NsLimits),
}

impl Service {
    /// Instantiates a service from its TOML table, validating the schema.
    pub fn from_table(name: &str, table: &toml::Table) -> Result<Self> {
        let info =
            lookup(name).ok_or_else(|| Error::ConfigParse(format!("unknown service {name:?}")))?;

        fn parse<T: serde::de::DeserializeOwned>(name: &str, table: &toml::Table) -> Result<T> {
            table
                .clone()
                .try_into()
                .map_err(|e| Error::ConfigParse(format!("service [{name}]: {e}")))
        }

        let service = match name {
            "common" => Self::Common(parse(name, table)?),
            "x11" => Self::unit(name, table, Self::X11)?,
            "wayland" => Self::unit(name, table, Self::Wayland)?,
            "network" => Self::unit(name, table, Self::Network)?,
            "pulse_audio" => Self::unit(name, table, Self::PulseAudio)?,
            "home_share" => Self::HomeShare(parse(name, table)?),
            "direct_rendering" => Self::DirectRendering(parse(name, table)?),
            "systray" => Self::unit(name, table, Self::Systray)?,
            "joystick" => Self::unit(name, table, Self::Joystick)?,
            "root_share" => Self::RootShare(parse(name, table)?),
            "openjdk" => Self::unit(name, table, Self::OpenJdk)?,
            "notify" => Self::unit(name, table, Self::Notify)?,
            "ibus" => Self::unit(name, table, Self::IBus)?,
            "fcitx" => Self::unit(name, table, Self::Fcitx)?,
            "slirp4netns" => Self::Slirp4netns(parse(name, table)?),
            "pasta_network" => Self::PastaNetwork(parse(name, table)?),
            "namespaces_limits" => {
                let opts: NamespacesLimitsOptions = parse(name, table)?;
                for (key, value) in opts.fields() {
                    if value < -1 {
                        return Err(Error::ConfigParse(format!(
                            "service [namespaces_limits]: {key} = {value} is out of range \
                             (minimum -1)"
                        )));
                    }
                }
                Self::NamespacesLimits(opts)
            }
            "v4l" => Self::unit(name, table, Self::V4l)?,
            "pipewire" => Self::unit(name, table, Self::Pipewire)?,
            "gamemode" => Self::unit(name, table, Self::Gamemode)?,
            "mpris" => Self::unit(name, table, Self::Mpris)?,
            "xdg_desktop_portal" => Self::unit(name, table, Self::XdgDesktopPortal)?,
            "debug" => Self::Debug(parse(name, table)?),
            _ => unreachable!("catalog and match arms diverged for {name}"),
        };

        if info.experimental {
            warn!(service = name, "service is experimental");
        }
        if info.deprecated {
            warn!(service = name, "service is deprecated");
        }
        for option in info.options {
            if option.deprecated && table.contains_key(option.key) {
                warn!(
                    service = name,
                    option = option.key,
                    "option is deprecated and has no effect"
                );
            }
        }

        Ok(service)
    }

    /// Validates an option-less service table (only emptiness matters).
    fn unit(name: &str, table: &toml::Table, value: Self) -> Result<Self> {
        let _: EmptyOptions = table
            .clone()
            .try_into()
            .map_err(|e| Error::ConfigParse(format!("service [{name}]: {e}")))?;
        Ok(value)
    }

    /// Unique service name, also the TOML table name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Common(_) => "common",
            Self::X11 => "x11",
            Self::Wayland => "wayland",
            Self::Network => "network",
            Self::PulseAudio => "pulse_audio",
            Self::HomeShare(_) => "home_share",
            Self::DirectRendering(_) => "direct_rendering",
            Self::Systray => "systray",
            Self::Joystick => "joystick",
            Self::RootShare(_) => "root_share",
            Self::OpenJdk => "openjdk",
            Self::Notify => "notify",
            Self::IBus => "ibus",
            Self::Fcitx => "fcitx",
            Self::Slirp4netns(_) => "slirp4netns",
            Self::PastaNetwork(_) => "pasta_network",
            Self::NamespacesLimits(_) => "namespaces_limits",
            Self::V4l => "v4l",
            Self::Pipewire => "pipewire",
            Self::Gamemode => "gamemode",
            Self::Mpris => "mpris",
            Self::XdgDesktopPortal => "xdg_desktop_portal",
            Self::Debug(_) => "debug",
        }
    }

    /// Catalog entry for this service.
    pub fn info(&self) -> &'static ServiceInfo {
        lookup(self.name()).expect("every variant has a catalog entry")
    }

    /// Filesystem and environment ops, in emission order.
    pub fn bind_ops(&self, ctx: &ServiceContext) -> Result<Vec<BindOp>> {
        match self {
            Self::Common(opts) => Ok(common_ops(opts)),
            Self::X11 => x11_ops(ctx),
            Self::Wayland => wayland_ops(ctx),
            Self::Network => Ok(network_ops()),
            Self::PulseAudio => Ok(pulse_ops(ctx)),
            Self::HomeShare(opts) => Ok(home_share_ops(opts, ctx)),
            Self::DirectRendering(_) => Ok(direct_rendering_ops()),
            Self::Joystick => Ok(joystick_ops()),
            Self::RootShare(opts) => Ok(root_share_ops(opts)),
            Self::IBus => Ok(ibus_ops()),
            Self::Fcitx => Ok(fcitx_ops()),
            Self::Slirp4netns(opts) => slirp_ops(opts),
            Self::PastaNetwork(opts) => pasta_ops(opts),
            Self::NamespacesLimits(_) => namespaces_limits_gate().map(|()| Vec::new()),
            Self::V4l => Ok(v4l_ops()),
            Self::Pipewire => Ok(pipewire_ops(ctx)),
            Self::XdgDesktopPortal => Ok(vec![BindOp::env("GTK_USE_PORTAL", "1")]),
            Self::Systray
            | Self::OpenJdk
            | Self::Notify
            | Self::Gamemode
            | Self::Mpris
            | Self::Debug(_) => Ok(Vec::new()),
        }
    }

    /// D-Bus rules as `(session, system)` lists.
    pub fn dbus_rules(&self) -> (Vec<DbusRule>, Vec<DbusRule>) {
        match self {
            Self::Common(opts) => (
                opts.dbus_name.iter().cloned().map(DbusRule::Own).collect(),
                Vec::new(),
            ),
            Self::Systray => (
                vec![DbusRule::call_at(
                    "org.kde.StatusNotifierWatcher",
                    "/StatusNotifierWatcher",
                )],
                Vec::new(),
            ),
            Self::Notify => (
                vec![DbusRule::call_at(
                    "org.freedesktop.Notifications",
                    "/org/freedesktop/Notifications",
                )],
                Vec::new(),
            ),
            Self::IBus => (
                vec![DbusRule::Talk("org.freedesktop.portal.IBus.*".into())],
                Vec::new(),
            ),
            Self::Fcitx => (
                vec![
                    DbusRule::Talk("org.freedesktop.portal.Fcitx.*".into()),
                    DbusRule::Talk("org.freedesktop.portal.IBus.*".into()),
                ],
                Vec::new(),
            ),
            Self::Gamemode => (
                vec![DbusRule::Talk("com.feralinteractive.GameMode".into())],
                Vec::new(),
            ),
            Self::Mpris => (
                vec![DbusRule::Own("org.mpris.MediaPlayer2.*".into())],
                Vec::new(),
            ),
            Self::XdgDesktopPortal => (
                vec![DbusRule::Talk("org.freedesktop.portal.*".into())],
                Vec::new(),
            ),
            Self::Debug(opts) => (
                opts.raw_dbus_session_args
                    .iter()
                    .cloned()
                    .map(DbusRule::Raw)
                    .collect(),
                opts.raw_dbus_system_args
                    .iter()
                    .cloned()
                    .map(DbusRule::Raw)
                    .collect(),
            ),
            _ => (Vec::new(), Vec::new()),
        }
    }

    /// Seccomp rules emitted by this service.
    pub fn seccomp_rules(&self) -> Vec<SeccompRule> {
        match self {
            Self::Common(opts) if opts.filter_disk_sync => vec![
                SeccompRule::deny("sync", 0),
                SeccompRule::deny("fsync", 0),
            ],
            _ => Vec::new(),
        }
    }

    /// Default launch argv, if this service provides one.
    pub fn launch_args(&self) -> Vec<String> {
        match self {
            Self::Common(opts) => opts.executable_name.to_vec(),
            _ => Vec::new(),
        }
    }

    /// Raw bwrap arguments, appended after every structured option.
    pub fn raw_bwrap_args(&self) -> Vec<String> {
        match self {
            Self::Debug(opts) => opts.raw_bwrap_args.iter().map(|a| expand_vars(a)).collect(),
            _ => Vec::new(),
        }
    }

    /// Action to run once the sandbox PID is known.
    ///
    /// `network_active` feeds the net-namespace self-consumption
    /// adjustment for `namespaces_limits`.
    pub fn startup_hook(&self, network_active: bool) -> Option<StartupHook> {
        match self {
            Self::Slirp4netns(opts) => Some(StartupHook::Slirp4netns(opts.clone())),
            Self::PastaNetwork(opts) => Some(StartupHook::Pasta(opts.clone())),
            Self::NamespacesLimits(opts) => Some(StartupHook::NamespaceLimits(adjusted_limits(
                opts,
                network_active,
            ))),
            _ => None,
        }
    }
}

/// Rejects the first activated pair of conflicting services.
///
/// The relation is treated symmetrically: a conflict declared on either
/// side applies to both.
pub fn conflict_check(services: &[Service]) -> Result<()> {
    for (i, service) in services.iter().enumerate() {
        for earlier in &services[..i] {
            let a = service.info();
            let b = earlier.info();
            if a.conflicts.contains(&b.name) || b.conflicts.contains(&a.name) {
                return Err(Error::ServiceConflict {
                    first: b.name.to_owned(),
                    second: a.name.to_owned(),
                });
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Default preamble
// ---------------------------------------------------------------------------

/// Ops present in every sandbox, before any service runs.
///
/// Distribution binaries and libraries read-only, pseudo-home at the real
/// home path, filtered environment.
pub fn default_ops(ctx: &ServiceContext) -> Result<Vec<BindOp>> {
    let mut ops = Vec::new();

    ops.push(BindOp::ro_bind("/usr"));
    ops.push(BindOp::Bind {
        src: "/opt".into(),
        dst: "/opt".into(),
        readonly: true,
        try_: true,
    });

    // Recreate / symlinks (lib, lib64, bin, sbin) or bind them read-only.
    // Portable across merged-usr and split-usr distributions.
    let mut roots: Vec<PathBuf> = fs::read_dir("/")?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    roots.sort();
    for root_path in roots {
        let name = match root_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if !(name.starts_with("lib") || name == "bin" || name == "sbin") {
            continue;
        }
        match fs::read_link(&root_path) {
            Ok(target) => ops.push(BindOp::SymlinkCreate {
                target,
                at: root_path,
            }),
            Err(_) => ops.push(BindOp::ro_bind(root_path)),
        }
    }

    ops.push(BindOp::ro_bind("/etc"));

    ops.push(BindOp::DirCreate {
        dst: "/tmp".into(),
        mode: None,
    });
    ops.push(BindOp::DirCreate {
        dst: "/var".into(),
        mode: None,
    });
    ops.push(BindOp::DirCreate {
        dst: ctx.env.sandbox_runtime_dir(),
        mode: Some(0o700),
    });

    // Pseudo-home bound at the real home path.
    let home = &ctx.env.home;
    ops.push(BindOp::bind_at(&ctx.home_bind_src, home));
    ops.push(BindOp::env("HOME", home.to_string_lossy()));
    if home != Path::new(OLD_HOME_BIND) {
        ops.push(BindOp::SymlinkCreate {
            target: home.clone(),
            at: OLD_HOME_BIND.into(),
        });
    }
    ops.push(BindOp::ChangeDir { dst: home.clone() });

    ops.push(BindOp::env("USER", &ctx.env.user));
    ops.push(BindOp::env("USERNAME", &ctx.env.user));
    ops.push(BindOp::env("PATH", ctx.env.sandbox_path_var()));
    ops.push(BindOp::env(
        "XDG_RUNTIME_DIR",
        ctx.env.sandbox_runtime_dir().to_string_lossy(),
    ));
    if let Some(lang) = ctx.env.var("LANG") {
        ops.push(BindOp::env("LANG", lang));
    }

    Ok(ops)
}

// ---------------------------------------------------------------------------
// Per-service emissions
// ---------------------------------------------------------------------------

fn common_ops(opts: &CommonOptions) -> Vec<BindOp> {
    opts.environment
        .iter()
        .map(|(k, v)| BindOp::env(k, v))
        .collect()
}

/// Derives the X socket path from a `DISPLAY` value.
///
/// Handles `protocol/hostname:display.screen` per X(7); anything that is
/// not a local display yields `None`.
fn x11_socket_path(display: &str) -> Option<String> {
    let rest = match display.split_once('/') {
        Some(("unix", rest)) => rest,
        Some(_) => return None,
        None => display,
    };
    let (host, number) = rest.split_once(':')?;
    if !host.is_empty() {
        return None;
    }
    let display_number = number.split('.').next().unwrap_or(number);
    if display_number.is_empty() || !display_number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("/tmp/.X11-unix/X{display_number}"))
}

fn desktop_var_ops(ctx: &ServiceContext) -> Vec<BindOp> {
    XDG_DESKTOP_VARS
        .iter()
        .filter_map(|&key| ctx.env.var(key).map(|v| BindOp::env(key, v)))
        .collect()
}

/// kdeglobals carries toolkit theming that Qt applications expect.
fn toolkit_ops(ctx: &ServiceContext) -> Vec<BindOp> {
    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.env.home.join(".config"));
    let kde_globals = config_home.join("kdeglobals");
    if kde_globals.exists() {
        vec![BindOp::ro_bind(kde_globals)]
    } else {
        Vec::new()
    }
}

fn x11_ops(ctx: &ServiceContext) -> Result<Vec<BindOp>> {
    let display = ctx
        .env
        .var("DISPLAY")
        .ok_or_else(|| Error::DependencyMissing("DISPLAY (required by the x11 service)".into()))?;

    let mut ops = desktop_var_ops(ctx);
    ops.push(BindOp::env("DISPLAY", display));

    if let Some(socket) = x11_socket_path(display) {
        ops.push(BindOp::ro_bind(socket));
    }

    if let Some(xauthority) = ctx.env.var("XAUTHORITY") {
        ops.push(BindOp::ro_bind_at(xauthority, "/tmp/.Xauthority"));
        ops.push(BindOp::env("XAUTHORITY", "/tmp/.Xauthority"));
    }

    ops.extend(toolkit_ops(ctx));
    Ok(ops)
}

fn wayland_ops(ctx: &ServiceContext) -> Result<Vec<BindOp>> {
    let wayland_display = ctx.env.var("WAYLAND_DISPLAY").ok_or_else(|| {
        Error::DependencyMissing("WAYLAND_DISPLAY (required by the wayland service)".into())
    })?;

    let mut ops = desktop_var_ops(ctx);
    ops.push(BindOp::env("GDK_BACKEND", "wayland"));
    ops.push(BindOp::env("MOZ_DBUS_REMOTE", "1"));
    ops.push(BindOp::env("MOZ_ENABLE_WAYLAND", "1"));
    ops.push(BindOp::env("WAYLAND_DISPLAY", "wayland-0"));
    ops.push(BindOp::bind_at(
        ctx.env.runtime_dir.join(wayland_display),
        ctx.env.sandbox_runtime_dir().join("wayland-0"),
    ));
    ops.extend(toolkit_ops(ctx));
    Ok(ops)
}

fn network_ops() -> Vec<BindOp> {
    let mut ops = Vec::new();
    // systemd-resolved and some DHCP clients make /etc/resolv.conf a
    // symlink out of /etc; bind the real file so DNS works.
    let resolv = Path::new("/etc/resolv.conf");
    if let Ok(actual) = resolv.canonicalize() {
        if actual != resolv {
            ops.push(BindOp::Bind {
                src: actual.clone(),
                dst: actual,
                readonly: true,
                try_: true,
            });
        }
    }
    ops.push(BindOp::Share(NsKind::Net));
    ops
}

fn pulse_ops(ctx: &ServiceContext) -> Vec<BindOp> {
    vec![BindOp::bind_at(
        ctx.env.runtime_dir.join("pulse/native"),
        ctx.env.sandbox_runtime_dir().join("pulse/native"),
    )]
}

fn home_share_ops(opts: &HomeShareOptions, ctx: &ServiceContext) -> Vec<BindOp> {
    opts.home_paths
        .iter()
        .map(|rel| {
            let at_home = ctx.env.home.join(rel);
            BindOp::bind_at(&at_home, &at_home)
        })
        .collect()
}

fn direct_rendering_ops() -> Vec<BindOp> {
    let mut ops = Vec::new();

    // cardX / renderX node names under /dev/dri.
    let mut device_names = Vec::new();
    if let Ok(entries) = fs::read_dir("/dev/dri") {
        for entry in entries.flatten() {
            if is_char_device(&entry.path()) {
                if let Some(name) = entry.path().file_stem().and_then(|s| s.to_os_string().into_string().ok()) {
                    device_names.push(name);
                }
            }
        }
    }
    device_names.sort();

    // Resolve /sys/dev/char links pointing at those nodes; the PCI parent
    // two levels up carries the device attributes mesa reads.
    for link in sorted_dir("/sys/dev/char") {
        if let Ok(resolved) = link.canonicalize() {
            let is_dri = resolved
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| device_names.iter().any(|d| d == n));
            if is_dri {
                ops.push(BindOp::SymlinkCreate {
                    target: resolved.clone(),
                    at: link,
                });
                if let Some(pci) = resolved.ancestors().nth(2) {
                    ops.push(BindOp::dev_bind(pci));
                }
            }
        }
    }

    ops.push(BindOp::dev_bind("/dev/dri"));

    for dev in sorted_dir("/dev") {
        let is_nvidia = dev
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("nvidia"));
        if is_nvidia {
            ops.push(BindOp::dev_bind(dev));
        }
    }

    ops.push(BindOp::Bind {
        src: "/sys/module/nvidia".into(),
        dst: "/sys/module/nvidia".into(),
        readonly: true,
        try_: true,
    });
    ops.push(BindOp::Bind {
        src: "/sys/devices/system/cpu".into(),
        dst: "/sys/devices/system/cpu".into(),
        readonly: true,
        try_: true,
    });

    ops
}

fn joystick_ops() -> Vec<BindOp> {
    let mut ops = Vec::new();
    let dev_input = Path::new("/dev/input");
    let sys_class_input = Path::new("/sys/class/input");

    // jsX nodes are the only input devices readable by others; gamepads
    // additionally expose an eventX node next to them in sysfs.
    let mut node_names: Vec<String> = Vec::new();
    for node in sorted_dir(dev_input) {
        let Ok(meta) = fs::metadata(&node) else {
            continue;
        };
        if !meta.file_type().is_char_device() || meta.mode() & 0o004 == 0 {
            continue;
        }
        if let Some(name) = node.file_name().and_then(|n| n.to_str()) {
            node_names.push(name.to_owned());
        }
    }

    let mut all_names = node_names.clone();
    for js_name in &node_names {
        let sys_js = sys_class_input.join(js_name);
        if let Ok(resolved) = sys_js.canonicalize() {
            if let Some(input_dir) = resolved.parent() {
                for sibling in sorted_dir(input_dir) {
                    if let Some(name) = sibling.file_name().and_then(|n| n.to_str()) {
                        if name.starts_with("event") {
                            all_names.push(name.to_owned());
                        }
                    }
                }
            }
        }
    }
    all_names.sort();
    all_names.dedup();

    for name in &all_names {
        ops.push(BindOp::dev_bind(dev_input.join(name)));

        let sys_path = sys_class_input.join(name);
        if let Ok(target) = fs::read_link(&sys_path) {
            ops.push(BindOp::SymlinkCreate {
                target,
                at: sys_path.clone(),
            });
        }
        if let Ok(pci) = sys_path.canonicalize() {
            if let Some(parent) = pci.ancestors().nth(3) {
                ops.push(BindOp::dev_bind(parent));
            }
        }
    }

    ops
}

fn root_share_ops(opts: &RootShareOptions) -> Vec<BindOp> {
    let mut ops = Vec::new();
    for path in &opts.paths {
        ops.push(BindOp::bind(expand_vars(path)));
    }
    for path in &opts.read_only_paths {
        ops.push(BindOp::ro_bind(expand_vars(path)));
    }
    ops
}

fn ibus_ops() -> Vec<BindOp> {
    vec![
        BindOp::env("IBUS_USE_PORTAL", "1"),
        BindOp::env("GTK_IM_MODULE", "ibus"),
        BindOp::env("QT_IM_MODULE", "ibus"),
        BindOp::env("XMODIFIERS", "@im=ibus"),
        BindOp::env("GLFW_IM_MODULE", "ibus"),
    ]
}

fn fcitx_ops() -> Vec<BindOp> {
    vec![
        BindOp::env("GTK_IM_MODULE", "fcitx"),
        BindOp::env("QT_IM_MODULE", "fcitx"),
        BindOp::env("XMODIFIERS", "@im=fcitx"),
        BindOp::env("SDL_IM_MODULE", "fcitx"),
        BindOp::env("GLFW_IM_MODULE", "ibus"),
    ]
}

fn slirp_ops(opts: &Slirp4netnsOptions) -> Result<Vec<BindOp>> {
    x86_64_gate("slirp4netns")?;
    let mut dns_servers = opts.dns_servers.clone();
    dns_servers.push("10.0.2.3".into());
    Ok(vec![resolv_conf(&dns_servers)])
}

fn pasta_ops(opts: &PastaOptions) -> Result<Vec<BindOp>> {
    x86_64_gate("pasta_network")?;
    if opts.dns_servers.is_empty() {
        Ok(Vec::new())
    } else {
        Ok(vec![resolv_conf(&opts.dns_servers)])
    }
}

fn namespaces_limits_gate() -> Result<()> {
    x86_64_gate("namespaces_limits")
}

fn v4l_ops() -> Vec<BindOp> {
    let mut ops = vec![
        BindOp::dev_bind_try("/dev/v4l"),
        BindOp::dev_bind_try("/sys/class/video4linux"),
        BindOp::dev_bind_try("/sys/bus/media"),
    ];

    for sys_path in sorted_dir("/sys/class/video4linux") {
        if let Ok(pcie) = sys_path.canonicalize() {
            for char_link in sorted_dir("/sys/dev/char") {
                if char_link.canonicalize().ok().as_deref() == Some(&pcie) {
                    if let Ok(target) = fs::read_link(&char_link) {
                        ops.push(BindOp::SymlinkCreate {
                            target,
                            at: char_link,
                        });
                    }
                }
            }
            if let Some(parent) = pcie.ancestors().nth(2) {
                ops.push(BindOp::dev_bind(parent));
            }
        }
    }

    for dev in sorted_dir("/dev") {
        let Some(name) = dev.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let numeric_tail = |prefix: &str| {
            name.strip_prefix(prefix)
                .is_some_and(|tail| !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()))
        };
        if numeric_tail("video") || numeric_tail("media") {
            ops.push(BindOp::dev_bind(dev));
        }
    }

    ops
}

fn pipewire_ops(ctx: &ServiceContext) -> Vec<BindOp> {
    vec![BindOp::ro_bind_at(
        ctx.env.runtime_dir.join("pipewire-0"),
        ctx.env.sandbox_runtime_dir().join("pipewire-0"),
    )]
}

/// resolv.conf content bound over the sandbox's /etc/resolv.conf.
fn resolv_conf(dns_servers: &[String]) -> BindOp {
    let mut bytes = Vec::new();
    for server in dns_servers {
        bytes.extend_from_slice(format!("nameserver {server}\n").as_bytes());
    }
    BindOp::FileWrite {
        dst: "/etc/resolv.conf".into(),
        bytes,
    }
}

/// Namespace ceilings with the self-consumption adjustment applied.
///
/// The sandbox already occupies one namespace of most kinds, so a
/// non-zero request is bumped by one. The net namespace only exists when
/// the host network is not shared.
fn adjusted_limits(opts: &NamespacesLimitsOptions, network_active: bool) -> NsLimits {
    let bump = |v: i64| -> i64 {
        match v {
            -1 => -1,
            0 => 0,
            n => n + 1,
        }
    };
    let mut limits = NsLimits::new();
    limits.insert(NsKind::User, bump(opts.user.max(-1)));
    limits.insert(NsKind::Mnt, bump(opts.mount.max(-1)));
    limits.insert(NsKind::Pid, bump(opts.pid.max(-1)));
    limits.insert(NsKind::Ipc, bump(opts.ipc.max(-1)));
    limits.insert(
        NsKind::Net,
        match (opts.net, network_active) {
            (-1, _) => -1,
            (n, false) => n + 1,
            (n, true) => n,
        },
    );
    limits.insert(NsKind::Time, opts.time.max(-1));
    limits.insert(NsKind::Uts, bump(opts.uts.max(-1)));
    limits.insert(NsKind::Cgroup, bump(opts.cgroup.max(-1)));
    limits
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn x86_64_gate(service: &str) -> Result<()> {
    if cfg!(target_arch = "x86_64") {
        Ok(())
    } else {
        Err(Error::DependencyMissing(format!(
            "{service} is only available on x86_64"
        )))
    }
}

/// Directory entries, sorted for deterministic emission. Missing
/// directories yield nothing.
fn sorted_dir(dir: impl AsRef<Path>) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map(|iter| iter.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    entries.sort();
    entries
}

fn is_char_device(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.file_type().is_char_device())
}

/// Expands `$VAR` and `${VAR}` references from the host environment.
fn expand_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("static regex");
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        std::env::var(name).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(toml: &str) -> toml::Table {
        toml::from_str(toml).unwrap()
    }

    fn test_env() -> HostEnv {
        HostEnv {
            vars: [
                ("DISPLAY".to_string(), ":0".to_string()),
                ("LANG".to_string(), "en_US.UTF-8".to_string()),
                ("PATH".to_string(), "/usr/bin:/home/u/.bin:/bin".to_string()),
            ]
            .into(),
            home: "/home/u".into(),
            runtime_dir: "/run/user/1000".into(),
            uid: 1000,
            user: "u".into(),
        }
    }

    fn test_ctx() -> ServiceContext {
        ServiceContext {
            env: test_env(),
            home_bind_src: "/data/bubblejail/instances/t1/home".into(),
            debug_shell: false,
        }
    }

    #[test]
    fn unknown_service_is_rejected() {
        let err = Service::from_table("frobnicator", &table("")).unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn unit_service_rejects_options() {
        assert!(Service::from_table("x11", &table("")).is_ok());
        assert!(Service::from_table("x11", &table("display = \":1\"")).is_err());
    }

    #[test]
    fn namespaces_limits_bounds_are_enforced() {
        assert!(Service::from_table("namespaces_limits", &table("user = -1")).is_ok());
        let err = Service::from_table("namespaces_limits", &table("user = -2")).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn conflict_check_is_symmetric() {
        let a = Service::from_table("network", &table("")).unwrap();
        let b = Service::from_table("slirp4netns", &table("")).unwrap();
        assert!(conflict_check(&[a.clone(), b.clone()]).is_err());
        assert!(conflict_check(&[b, a]).is_err());
    }

    #[test]
    fn conflict_check_passes_compatible_sets() {
        let services = vec![
            Service::from_table("common", &table("")).unwrap(),
            Service::from_table("network", &table("")).unwrap(),
            Service::from_table("pulse_audio", &table("")).unwrap(),
        ];
        assert!(conflict_check(&services).is_ok());
    }

    #[test]
    fn x11_socket_path_parsing() {
        assert_eq!(x11_socket_path(":0"), Some("/tmp/.X11-unix/X0".into()));
        assert_eq!(x11_socket_path(":1.0"), Some("/tmp/.X11-unix/X1".into()));
        assert_eq!(x11_socket_path("unix/:3"), Some("/tmp/.X11-unix/X3".into()));
        assert_eq!(x11_socket_path("tcp/host:1"), None);
        assert_eq!(x11_socket_path("remotehost:0"), None);
    }

    #[test]
    fn home_share_binds_relative_to_home() {
        let opts = HomeShareOptions {
            home_paths: vec!["Downloads".into()],
        };
        let ops = home_share_ops(&opts, &test_ctx());
        assert_eq!(
            ops,
            vec![BindOp::bind_at("/home/u/Downloads", "/home/u/Downloads")]
        );
    }

    #[test]
    fn filter_disk_sync_fakes_sync_success() {
        let service = Service::from_table("common", &table("filter_disk_sync = true")).unwrap();
        let rules = service.seccomp_rules();
        assert!(rules.contains(&SeccompRule::deny("sync", 0)));
        assert!(rules.contains(&SeccompRule::deny("fsync", 0)));
    }

    #[test]
    fn common_dbus_names_become_own_rules() {
        let service =
            Service::from_table("common", &table("dbus_name = [\"org.example.App\"]")).unwrap();
        let (session, system) = service.dbus_rules();
        assert_eq!(session, vec![DbusRule::Own("org.example.App".into())]);
        assert!(system.is_empty());
    }

    #[test]
    fn slirp_always_adds_internal_resolver() {
        let service = Service::from_table("slirp4netns", &table("dns_servers = [\"9.9.9.9\"]"))
            .unwrap();
        let ops = service.bind_ops(&test_ctx()).unwrap();
        let BindOp::FileWrite { dst, bytes } = &ops[0] else {
            panic!("expected resolv.conf FileWrite");
        };
        assert_eq!(dst, Path::new("/etc/resolv.conf"));
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("nameserver 9.9.9.9"));
        assert!(text.contains("nameserver 10.0.2.3"));
    }

    #[test]
    fn limit_adjustment_accounts_for_self_consumption() {
        let opts: NamespacesLimitsOptions = toml::from_str("user = 2\nnet = 0").unwrap();
        let limits = adjusted_limits(&opts, false);
        assert_eq!(limits[&NsKind::User], 3);
        // Sandbox owns a netns when the host network is not shared.
        assert_eq!(limits[&NsKind::Net], 1);
        assert_eq!(limits[&NsKind::Mnt], 0);

        let limits = adjusted_limits(&opts, true);
        assert_eq!(limits[&NsKind::Net], 0);
    }

    #[test]
    fn default_preamble_sets_up_home_and_path() {
        let ctx = test_ctx();
        let ops = default_ops(&ctx).unwrap();

        assert!(ops.contains(&BindOp::bind_at(
            "/data/bubblejail/instances/t1/home",
            "/home/u"
        )));
        assert!(ops.contains(&BindOp::env("HOME", "/home/u")));
        // PATH filtered to distribution locations only.
        assert!(ops.contains(&BindOp::env("PATH", "/usr/bin:/bin")));
        assert!(ops.contains(&BindOp::env("XDG_RUNTIME_DIR", "/run/user/1000")));
        assert!(ops.contains(&BindOp::ChangeDir {
            dst: "/home/u".into()
        }));
    }

    #[test]
    fn expand_vars_substitutes_environment() {
        std::env::set_var("BUBBLEJAIL_TEST_VAR", "value");
        assert_eq!(expand_vars("/a/$BUBBLEJAIL_TEST_VAR/b"), "/a/value/b");
        assert_eq!(expand_vars("/a/${BUBBLEJAIL_TEST_VAR}b"), "/a/valueb");
        assert_eq!(expand_vars("/plain"), "/plain");
    }
}
