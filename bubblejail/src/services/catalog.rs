//! Static service catalog: metadata, option schemas, conflicts.
//!
//! The catalog drives `list services`, man-page generation, validation
//! warnings, and the conflict check. Order is stable and user-facing.

/// Option value types understood by the config layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    /// TOML string.
    Str,
    /// TOML string or array of strings.
    StrOrList,
    /// TOML array of strings.
    List,
    /// TOML boolean.
    Bool,
    /// TOML integer with inclusive bounds.
    Int {
        /// Smallest accepted value.
        min: i64,
        /// Largest accepted value.
        max: i64,
    },
    /// TOML table of string keys to string values.
    StrTable,
}

/// Schema entry for one service option.
#[derive(Debug, Clone, Copy)]
pub struct OptionInfo {
    /// TOML key.
    pub key: &'static str,
    /// Value type.
    pub type_: OptionType,
    /// Short human name.
    pub pretty_name: &'static str,
    /// Help text.
    pub description: &'static str,
    /// Setting it still works but warns.
    pub deprecated: bool,
}

/// Catalog entry for one service.
#[derive(Debug, Clone, Copy)]
pub struct ServiceInfo {
    /// TOML table name and unique key.
    pub name: &'static str,
    /// Human name.
    pub pretty_name: &'static str,
    /// Help text.
    pub description: &'static str,
    /// Names of services that may not be active together with this one.
    /// The relation is interpreted symmetrically.
    pub conflicts: &'static [&'static str],
    /// Whole service warns on activation but still works.
    pub deprecated: bool,
    /// Service warns that its behavior may change.
    pub experimental: bool,
    /// Option schema.
    pub options: &'static [OptionInfo],
}

const NO_OPTIONS: &[OptionInfo] = &[];

const NS_LIMIT: OptionType = OptionType::Int {
    min: -1,
    max: i64::MAX,
};

/// All built-in services, in presentation order.
pub const SERVICES: &[ServiceInfo] = &[
    ServiceInfo {
        name: "common",
        pretty_name: "Common Settings",
        description: "Settings that don't fit in any particular category",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: &[
            OptionInfo {
                key: "executable_name",
                type_: OptionType::StrOrList,
                pretty_name: "Default arguments",
                description: "Default arguments to run when no arguments were provided",
                deprecated: false,
            },
            OptionInfo {
                key: "filter_disk_sync",
                type_: OptionType::Bool,
                pretty_name: "Filter disk sync",
                description: "Do not allow flushing disk. \
                              Useful for clients that flush to disk too often.",
                deprecated: false,
            },
            OptionInfo {
                key: "dbus_name",
                type_: OptionType::List,
                pretty_name: "Application's D-Bus names",
                description: "D-Bus names allowed to be acquired and owned",
                deprecated: false,
            },
            OptionInfo {
                key: "share_local_time",
                type_: OptionType::Bool,
                pretty_name: "Share local time",
                description: "This option has no effect since version 0.6.0",
                deprecated: true,
            },
            OptionInfo {
                key: "environment",
                type_: OptionType::StrTable,
                pretty_name: "Environment variables",
                description: "Extra environment variables set inside the sandbox",
                deprecated: false,
            },
        ],
    },
    ServiceInfo {
        name: "x11",
        pretty_name: "X11 windowing system",
        description: "Gives access to the X11 socket.\n\
                      This is generally the default Linux windowing system.",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "wayland",
        pretty_name: "Wayland windowing system",
        description: "Make sure you are running a Wayland session\n\
                      and your application supports Wayland.",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "network",
        pretty_name: "Network access",
        description: "Gives access to the host network.",
        conflicts: &["slirp4netns", "pasta_network"],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "pulse_audio",
        pretty_name: "Pulse Audio",
        description: "Default audio system in most distros",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "home_share",
        pretty_name: "Home Share",
        description: "Share directories or files relative to home",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: &[OptionInfo {
            key: "home_paths",
            type_: OptionType::List,
            pretty_name: "List of paths",
            description: "Paths to share with the sandbox",
            deprecated: false,
        }],
    },
    ServiceInfo {
        name: "direct_rendering",
        pretty_name: "Direct Rendering",
        description: "Provides access to the GPU",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: &[OptionInfo {
            key: "enable_aco",
            type_: OptionType::Bool,
            pretty_name: "Enable ACO",
            description: "Enables the high performance vulkan shader compiler \
                          for AMD GPUs. Enabled by default since mesa 20.02.",
            deprecated: true,
        }],
    },
    ServiceInfo {
        name: "systray",
        pretty_name: "System tray icons",
        description: "Provides access to the D-Bus API for creating tray icons.\n\
                      This is not the only way to create tray icons but\n\
                      the most common one.",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "joystick",
        pretty_name: "Joysticks and gamepads",
        description: "Windowing systems do not support gamepads.\n\
                      Games have to read device files directly.\n\
                      This service provides access to them.",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "root_share",
        pretty_name: "Root share",
        description: "Share directories or files relative to /",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: &[
            OptionInfo {
                key: "paths",
                type_: OptionType::List,
                pretty_name: "Read/Write paths",
                description: "Paths to share with the sandbox",
                deprecated: false,
            },
            OptionInfo {
                key: "read_only_paths",
                type_: OptionType::List,
                pretty_name: "Read only paths",
                description: "Paths to share read-only with the sandbox",
                deprecated: false,
            },
        ],
    },
    ServiceInfo {
        name: "openjdk",
        pretty_name: "Java",
        description: "Enable for applications that require Java.\n\
                      Example: Minecraft",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "notify",
        pretty_name: "Notifications",
        description: "Ability to send notifications to the desktop",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "ibus",
        pretty_name: "IBus input method",
        description: "Gives access to the IBus input method.\n\
                      This is generally the default input method for multilingual input.",
        conflicts: &["fcitx"],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "fcitx",
        pretty_name: "Fcitx/Fcitx5 input method",
        description: "Gives access to the Fcitx/Fcitx5 input method.",
        conflicts: &["ibus"],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "slirp4netns",
        pretty_name: "Slirp4netns networking",
        description: "Independent networking stack for the sandbox. \
                      Requires the slirp4netns executable.",
        conflicts: &["network", "pasta_network", "namespaces_limits"],
        deprecated: false,
        experimental: false,
        options: &[
            OptionInfo {
                key: "dns_servers",
                type_: OptionType::List,
                pretty_name: "DNS servers",
                description: "DNS servers used. The internal DNS server is always used.",
                deprecated: false,
            },
            OptionInfo {
                key: "outbound_addr",
                type_: OptionType::Str,
                pretty_name: "Outbound address or device",
                description: "Address or device to bind to. \
                              If not set the default address is used.",
                deprecated: false,
            },
            OptionInfo {
                key: "disable_host_loopback",
                type_: OptionType::Bool,
                pretty_name: "Disable host loopback access",
                description: "Prohibit connecting to the host's loopback interface",
                deprecated: false,
            },
        ],
    },
    ServiceInfo {
        name: "pasta_network",
        pretty_name: "Pasta networking",
        description: "Independent networking stack based on passt/pasta. \
                      Requires the pasta executable.",
        conflicts: &["network", "slirp4netns"],
        deprecated: false,
        experimental: true,
        options: &[
            OptionInfo {
                key: "dns_servers",
                type_: OptionType::List,
                pretty_name: "DNS servers",
                description: "DNS servers written to the sandbox resolv.conf",
                deprecated: false,
            },
            OptionInfo {
                key: "extra_args",
                type_: OptionType::List,
                pretty_name: "Extra pasta arguments",
                description: "Raw arguments appended to the pasta invocation",
                deprecated: false,
            },
        ],
    },
    ServiceInfo {
        name: "namespaces_limits",
        pretty_name: "Limit namespaces",
        description: "Limit the number of namespaces available inside the sandbox. \
                      Limits are recursive: 0 blocks creating new namespaces, \
                      -1 keeps the kind unlimited.",
        conflicts: &["slirp4netns"],
        deprecated: false,
        experimental: false,
        options: &[
            OptionInfo {
                key: "user",
                type_: NS_LIMIT,
                pretty_name: "Max user namespaces",
                description: "Limiting user namespaces blocks acquiring new \
                              capabilities and privileges inside namespaces",
                deprecated: false,
            },
            OptionInfo {
                key: "mount",
                type_: NS_LIMIT,
                pretty_name: "Max mount namespaces",
                description: "Limits the number of mount namespaces",
                deprecated: false,
            },
            OptionInfo {
                key: "pid",
                type_: NS_LIMIT,
                pretty_name: "Max PID namespaces",
                description: "Limits the number of PID namespaces",
                deprecated: false,
            },
            OptionInfo {
                key: "ipc",
                type_: NS_LIMIT,
                pretty_name: "Max IPC namespaces",
                description: "Limits the number of IPC namespaces",
                deprecated: false,
            },
            OptionInfo {
                key: "net",
                type_: NS_LIMIT,
                pretty_name: "Max net namespaces",
                description: "Limits the number of net namespaces",
                deprecated: false,
            },
            OptionInfo {
                key: "time",
                type_: NS_LIMIT,
                pretty_name: "Max time namespaces",
                description: "Limits the number of time namespaces",
                deprecated: false,
            },
            OptionInfo {
                key: "uts",
                type_: NS_LIMIT,
                pretty_name: "Max UTS namespaces",
                description: "Limits the number of UTS namespaces",
                deprecated: false,
            },
            OptionInfo {
                key: "cgroup",
                type_: NS_LIMIT,
                pretty_name: "Max cgroup namespaces",
                description: "Limits the number of cgroup namespaces",
                deprecated: false,
            },
        ],
    },
    ServiceInfo {
        name: "v4l",
        pretty_name: "Video4Linux",
        description: "Video capture devices (webcams and similar)",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "pipewire",
        pretty_name: "Pipewire",
        description: "Pipewire sound and screen-capture system",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "gamemode",
        pretty_name: "GameMode",
        description: "Allows requesting GameMode optimizations over D-Bus",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "mpris",
        pretty_name: "MPRIS media control",
        description: "Allows the application to publish an MPRIS media player",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "xdg_desktop_portal",
        pretty_name: "XDG desktop portal",
        description: "Access to the portal D-Bus APIs for file choosers, \
                      screenshots and similar desktop integration",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: NO_OPTIONS,
    },
    ServiceInfo {
        name: "debug",
        pretty_name: "Debug options",
        description: "Various debug options such as adding raw arguments \
                      to the bwrap or xdg-dbus-proxy invocations",
        conflicts: &[],
        deprecated: false,
        experimental: false,
        options: &[
            OptionInfo {
                key: "raw_bwrap_args",
                type_: OptionType::List,
                pretty_name: "Raw bwrap args",
                description: "Raw arguments to add to the bwrap invocation",
                deprecated: false,
            },
            OptionInfo {
                key: "raw_dbus_session_args",
                type_: OptionType::List,
                pretty_name: "Raw xdg-dbus-proxy session args",
                description: "Raw arguments for the session proxy invocation",
                deprecated: false,
            },
            OptionInfo {
                key: "raw_dbus_system_args",
                type_: OptionType::List,
                pretty_name: "Raw xdg-dbus-proxy system args",
                description: "Raw arguments for the system proxy invocation",
                deprecated: false,
            },
        ],
    },
];

/// Looks up a service by its table name.
pub fn lookup(name: &str) -> Option<&'static ServiceInfo> {
    SERVICES.iter().find(|s| s.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_and_stable() {
        let mut names: Vec<&str> = SERVICES.iter().map(|s| s.name).collect();
        assert_eq!(names[0], "common");
        assert_eq!(*names.last().unwrap(), "debug");
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SERVICES.len());
    }

    #[test]
    fn conflicts_are_symmetric() {
        for service in SERVICES {
            for &other in service.conflicts {
                let peer = lookup(other)
                    .unwrap_or_else(|| panic!("{} conflicts with unknown {other}", service.name));
                assert!(
                    peer.conflicts.contains(&service.name),
                    "{} -> {} not symmetric",
                    service.name,
                    other
                );
            }
        }
    }

    #[test]
    fn known_conflicts_are_declared() {
        for (a, b) in [
            ("ibus", "fcitx"),
            ("network", "slirp4netns"),
            ("network", "pasta_network"),
            ("slirp4netns", "namespaces_limits"),
        ] {
            assert!(lookup(a).unwrap().conflicts.contains(&b), "{a} vs {b}");
        }
    }
}
