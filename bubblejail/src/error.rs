//! Error types for bubblejail operations.

use std::path::PathBuf;

/// Alias for `Result<T, bubblejail::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the `bubblejail` CLI boundary.
///
/// Every variant maps to a stable process exit code via [`Error::exit_code`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed TOML, unknown key, or wrong value type in a config file.
    #[error("ConfigParseError: {0}")]
    ConfigParse(String),

    /// Two activated services declare each other in `conflicts`.
    #[error("ServiceConflict: {first} \u{21c4} {second}")]
    ServiceConflict {
        /// The service activated later.
        first: String,
        /// The already-active conflicting service.
        second: String,
    },

    /// A required external binary or platform capability is absent.
    #[error("DependencyMissing: {0}")]
    DependencyMissing(String),

    /// A non-`try` bind source does not exist on the host.
    #[error("BindSourceMissing: {}", .0.display())]
    BindSourceMissing(PathBuf),

    /// xdg-dbus-proxy exited non-zero (or disappeared) during startup.
    #[error("DBusProxyStartupFailed: {0}")]
    DBusProxyStartupFailed(String),

    /// The helper did not complete the HELLO exchange in time.
    #[error("HelperHandshakeTimeout: no HELLO within {0} seconds")]
    HelperHandshakeTimeout(u64),

    /// Writing namespace ceilings into the sandbox user namespace failed.
    #[error("NamespaceLimitFailed: {0}")]
    NamespaceLimitFailed(String),

    /// slirp4netns / pasta failed while configuring the sandbox network.
    #[error("NetworkStackFailed: {0}")]
    NetworkStackFailed(String),

    /// bwrap or the helper failed outside the sandboxed program's
    /// control: a startup step went wrong, or bwrap died abnormally.
    #[error("SandboxStartupFailed: {0}")]
    SandboxStartupFailed(String),

    /// The sandboxed program exited with a non-zero status.
    #[error("SandboxExit: sandboxed program exited with code {0}")]
    SandboxExit(i32),

    /// A `run` was forwarded into an already-running instance.
    #[error("AlreadyRunning: instance is already running")]
    AlreadyRunning,

    /// An instance directory was not found in any store.
    #[error("ConfigParseError: instance {0:?} does not exist")]
    InstanceNotFound(String),

    /// A foreground wait was interrupted by SIGINT.
    #[error("Cancelled")]
    Cancelled,

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this error, per the CLI contract.
    ///
    /// `SandboxExit` passes the child's code through, clamped to 125 so it
    /// never collides with shell-reserved codes.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigParse(_) | Self::InstanceNotFound(_) | Self::Io(_) | Self::Cancelled => 1,
            Self::ServiceConflict { .. } => 2,
            Self::DependencyMissing(_) => 3,
            Self::BindSourceMissing(_)
            | Self::DBusProxyStartupFailed(_)
            | Self::HelperHandshakeTimeout(_)
            | Self::NamespaceLimitFailed(_)
            | Self::NetworkStackFailed(_)
            | Self::SandboxStartupFailed(_) => 4,
            Self::SandboxExit(code) => (*code).clamp(1, 125),
            Self::AlreadyRunning => 0,
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(Error::ConfigParse("x".into()).exit_code(), 1);
        assert_eq!(
            Error::ServiceConflict {
                first: "network".into(),
                second: "slirp4netns".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            Error::DependencyMissing("xdg-dbus-proxy".into()).exit_code(),
            3
        );
        assert_eq!(
            Error::BindSourceMissing(PathBuf::from("/nowhere")).exit_code(),
            4
        );
        assert_eq!(Error::SandboxExit(7).exit_code(), 7);
        assert_eq!(Error::SandboxExit(300).exit_code(), 125);
        assert_eq!(Error::AlreadyRunning.exit_code(), 0);
    }

    #[test]
    fn conflict_message_names_both_services() {
        let err = Error::ServiceConflict {
            first: "network".into(),
            second: "slirp4netns".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("network"));
        assert!(msg.contains("slirp4netns"));
        assert!(msg.starts_with("ServiceConflict"));
    }
}
