//! Typed option records, one per service TOML table.
//!
//! Every field has a default, so an empty table activates the service
//! with defaults. Unknown keys are rejected at deserialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A TOML value that is either a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StrList {
    /// Single string form.
    One(String),
    /// List form.
    Many(Vec<String>),
}

impl Default for StrList {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl StrList {
    /// Normalized list form. An empty string counts as empty.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) if s.is_empty() => Vec::new(),
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }

    /// True when no value was configured.
    pub fn is_empty(&self) -> bool {
        self.to_vec().is_empty()
    }
}

/// `[common]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommonOptions {
    /// Default argv when `run` is invoked without arguments.
    pub executable_name: StrList,
    /// Make `sync`/`fsync` fake success. For applications that flush to
    /// disk pathologically often.
    pub filter_disk_sync: bool,
    /// Well-known D-Bus names the application may own on the session bus.
    pub dbus_name: Vec<String>,
    /// No effect since 0.6.0. Accepted so old configs keep loading.
    pub share_local_time: bool,
    /// Extra environment variables set inside the sandbox.
    pub environment: BTreeMap<String, String>,
}

/// `[home_share]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HomeShareOptions {
    /// Paths relative to home to share read-write.
    pub home_paths: Vec<String>,
}

/// `[direct_rendering]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectRenderingOptions {
    /// Deprecated: ACO is the mesa default since 20.02.
    pub enable_aco: bool,
}

/// `[root_share]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RootShareOptions {
    /// Absolute paths shared read-write. `$VAR` references are expanded.
    pub paths: Vec<String>,
    /// Absolute paths shared read-only.
    pub read_only_paths: Vec<String>,
}

/// `[slirp4netns]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Slirp4netnsOptions {
    /// Extra DNS servers. The internal 10.0.2.3 resolver is always added.
    pub dns_servers: Vec<String>,
    /// Outbound address or device to bind to.
    pub outbound_addr: String,
    /// Prohibit connections to the host loopback interface.
    pub disable_host_loopback: bool,
}

impl Default for Slirp4netnsOptions {
    fn default() -> Self {
        Self {
            dns_servers: Vec::new(),
            outbound_addr: String::new(),
            disable_host_loopback: true,
        }
    }
}

/// `[pasta_network]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PastaOptions {
    /// DNS servers written to the sandbox resolv.conf.
    pub dns_servers: Vec<String>,
    /// Raw extra arguments for the pasta invocation.
    pub extra_args: Vec<String>,
}

/// `[namespaces_limits]` table.
///
/// `0` denies the kind, `-1` keeps it unlimited, `n >= 1` allows `n`
/// namespaces. Values below `-1` are rejected at validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NamespacesLimitsOptions {
    /// Max user namespaces. Blocks privilege acquisition via nesting.
    pub user: i64,
    /// Max mount namespaces.
    pub mount: i64,
    /// Max PID namespaces.
    pub pid: i64,
    /// Max IPC namespaces.
    pub ipc: i64,
    /// Max network namespaces.
    pub net: i64,
    /// Max time namespaces.
    pub time: i64,
    /// Max UTS namespaces.
    pub uts: i64,
    /// Max cgroup namespaces.
    pub cgroup: i64,
}

impl NamespacesLimitsOptions {
    /// All limit fields as `(name, value)` pairs, declaration order.
    pub fn fields(&self) -> [(&'static str, i64); 8] {
        [
            ("user", self.user),
            ("mount", self.mount),
            ("pid", self.pid),
            ("ipc", self.ipc),
            ("net", self.net),
            ("time", self.time),
            ("uts", self.uts),
            ("cgroup", self.cgroup),
        ]
    }
}

/// `[debug]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugOptions {
    /// Raw arguments appended to the bwrap invocation.
    pub raw_bwrap_args: Vec<String>,
    /// Raw arguments for the session side of xdg-dbus-proxy.
    pub raw_dbus_session_args: Vec<String>,
    /// Raw arguments for the system side of xdg-dbus-proxy.
    pub raw_dbus_system_args: Vec<String>,
}

/// Schema for services without options; rejects any key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyOptions {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executable_name_accepts_string_or_list() {
        let one: CommonOptions =
            toml::from_str(r#"executable_name = "/usr/bin/firefox""#).unwrap();
        assert_eq!(one.executable_name.to_vec(), vec!["/usr/bin/firefox"]);

        let many: CommonOptions =
            toml::from_str(r#"executable_name = ["/usr/bin/env", "firefox"]"#).unwrap();
        assert_eq!(many.executable_name.to_vec().len(), 2);
    }

    #[test]
    fn empty_table_activates_with_defaults() {
        let opts: Slirp4netnsOptions = toml::from_str("").unwrap();
        assert!(opts.disable_host_loopback);
        assert!(opts.dns_servers.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<CommonOptions>("frobnicate = true").is_err());
        assert!(toml::from_str::<EmptyOptions>("anything = 1").is_err());
    }

    #[test]
    fn wrong_types_are_rejected() {
        assert!(toml::from_str::<CommonOptions>("filter_disk_sync = \"yes\"").is_err());
        assert!(toml::from_str::<NamespacesLimitsOptions>("user = \"zero\"").is_err());
    }

    #[test]
    fn namespace_fields_cover_all_kinds() {
        let opts = NamespacesLimitsOptions::default();
        assert_eq!(opts.fields().len(), 8);
        assert!(opts.fields().iter().all(|(_, v)| *v == 0));
    }
}
