//! Atomic directives for the bubblewrap command line.
//!
//! Services emit [`BindOp`] values; the merger orders and validates them
//! and the runner flattens them into the final `bwrap` argv. Every `dst`
//! is a path as seen from inside the sandbox and must be absolute.

use std::path::{Path, PathBuf};

use crate::namespaces::NsKind;

/// One directive to the container runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOp {
    /// Bind a host path read-write (`--bind` / `--bind-try`).
    Bind {
        /// Host path.
        src: PathBuf,
        /// Path inside the sandbox.
        dst: PathBuf,
        /// Bind read-only (`--ro-bind`).
        readonly: bool,
        /// Skip silently when `src` does not exist (`--*-bind-try`).
        try_: bool,
    },

    /// Bind a device node or device directory (`--dev-bind`).
    DevBind {
        /// Host path.
        src: PathBuf,
        /// Path inside the sandbox.
        dst: PathBuf,
        /// Skip silently when `src` does not exist.
        try_: bool,
    },

    /// Create a directory inside the sandbox (`--dir`).
    DirCreate {
        /// Path inside the sandbox.
        dst: PathBuf,
        /// Octal permissions for `--perms`, when not the bwrap default.
        mode: Option<u32>,
    },

    /// Create a symlink inside the sandbox (`--symlink`).
    SymlinkCreate {
        /// Link target.
        target: PathBuf,
        /// Link location inside the sandbox.
        at: PathBuf,
    },

    /// Materialize bytes on an inherited FD, bound read-only at `dst`
    /// (`--ro-bind-data`).
    FileWrite {
        /// Path inside the sandbox.
        dst: PathBuf,
        /// File content.
        bytes: Vec<u8>,
    },

    /// Set an environment variable (`--setenv`). Last writer wins in
    /// merger order.
    EnvSet {
        /// Variable name.
        key: String,
        /// Variable value.
        value: String,
    },

    /// Remove an environment variable (`--unsetenv`).
    EnvUnset {
        /// Variable name.
        key: String,
    },

    /// Keep the given namespace shared with the host. Only the network
    /// namespace has a bwrap share flag (`--share-net`).
    Share(NsKind),

    /// Change working directory inside the sandbox (`--chdir`).
    ChangeDir {
        /// Directory inside the sandbox.
        dst: PathBuf,
    },

    /// Raw passthrough argument. Escape hatch for the `debug` service,
    /// appended after every structured option.
    Arg(String),
}

impl BindOp {
    /// Read-write bind of `src` at the same path inside the sandbox.
    pub fn bind(src: impl Into<PathBuf>) -> Self {
        let src = src.into();
        Self::Bind {
            dst: src.clone(),
            src,
            readonly: false,
            try_: false,
        }
    }

    /// Read-write bind at an explicit sandbox path.
    pub fn bind_at(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self::Bind {
            src: src.into(),
            dst: dst.into(),
            readonly: false,
            try_: false,
        }
    }

    /// Read-only bind of `src` at the same path inside the sandbox.
    pub fn ro_bind(src: impl Into<PathBuf>) -> Self {
        let src = src.into();
        Self::Bind {
            dst: src.clone(),
            src,
            readonly: true,
            try_: false,
        }
    }

    /// Read-only bind at an explicit sandbox path.
    pub fn ro_bind_at(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self::Bind {
            src: src.into(),
            dst: dst.into(),
            readonly: true,
            try_: false,
        }
    }

    /// Device bind of `src` at the same path inside the sandbox.
    pub fn dev_bind(src: impl Into<PathBuf>) -> Self {
        let src = src.into();
        Self::DevBind {
            dst: src.clone(),
            src,
            try_: false,
        }
    }

    /// Device bind that is skipped when `src` is absent.
    pub fn dev_bind_try(src: impl Into<PathBuf>) -> Self {
        let src = src.into();
        Self::DevBind {
            dst: src.clone(),
            src,
            try_: true,
        }
    }

    /// Environment assignment.
    pub fn env(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::EnvSet {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Sandbox-view destination path of a filesystem op, if it has one.
    pub fn dst(&self) -> Option<&Path> {
        match self {
            Self::Bind { dst, .. }
            | Self::DevBind { dst, .. }
            | Self::DirCreate { dst, .. }
            | Self::FileWrite { dst, .. } => Some(dst),
            Self::SymlinkCreate { at, .. } => Some(at),
            _ => None,
        }
    }

    /// Host source path of a bind, if it has one.
    pub fn src(&self) -> Option<&Path> {
        match self {
            Self::Bind { src, .. } | Self::DevBind { src, .. } => Some(src),
            _ => None,
        }
    }

    /// Whether a missing source is tolerated.
    pub fn is_try(&self) -> bool {
        matches!(
            self,
            Self::Bind { try_: true, .. } | Self::DevBind { try_: true, .. }
        )
    }

    /// Whether the sandbox view of this op is immutable.
    pub fn is_readonly(&self) -> bool {
        matches!(
            self,
            Self::Bind { readonly: true, .. } | Self::FileWrite { .. }
        )
    }

    /// Appends the bwrap arguments for this op.
    ///
    /// `FileWrite` is skipped here: its bytes first have to be staged on
    /// an inheritable FD by the runner, which emits `--ro-bind-data`
    /// itself.
    pub fn extend_argv(&self, argv: &mut Vec<String>) {
        match self {
            Self::Bind {
                src,
                dst,
                readonly,
                try_,
            } => {
                let flag = match (readonly, try_) {
                    (false, false) => "--bind",
                    (false, true) => "--bind-try",
                    (true, false) => "--ro-bind",
                    (true, true) => "--ro-bind-try",
                };
                argv.push(flag.into());
                argv.push(path_arg(src));
                argv.push(path_arg(dst));
            }
            Self::DevBind { src, dst, try_ } => {
                argv.push(if *try_ { "--dev-bind-try" } else { "--dev-bind" }.into());
                argv.push(path_arg(src));
                argv.push(path_arg(dst));
            }
            Self::DirCreate { dst, mode } => {
                if let Some(mode) = mode {
                    argv.push("--perms".into());
                    argv.push(format!("{mode:o}"));
                }
                argv.push("--dir".into());
                argv.push(path_arg(dst));
            }
            Self::SymlinkCreate { target, at } => {
                argv.push("--symlink".into());
                argv.push(path_arg(target));
                argv.push(path_arg(at));
            }
            Self::FileWrite { .. } => {}
            Self::EnvSet { key, value } => {
                argv.push("--setenv".into());
                argv.push(key.clone());
                argv.push(value.clone());
            }
            Self::EnvUnset { key } => {
                argv.push("--unsetenv".into());
                argv.push(key.clone());
            }
            Self::Share(kind) => {
                if *kind == NsKind::Net {
                    argv.push("--share-net".into());
                }
            }
            Self::ChangeDir { dst } => {
                argv.push("--chdir".into());
                argv.push(path_arg(dst));
            }
            Self::Arg(raw) => argv.push(raw.clone()),
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv_of(op: &BindOp) -> Vec<String> {
        let mut argv = Vec::new();
        op.extend_argv(&mut argv);
        argv
    }

    #[test]
    fn bind_variants_pick_correct_flag() {
        assert_eq!(argv_of(&BindOp::bind("/a"))[0], "--bind");
        assert_eq!(argv_of(&BindOp::ro_bind("/a"))[0], "--ro-bind");
        assert_eq!(argv_of(&BindOp::dev_bind_try("/dev/v4l"))[0], "--dev-bind-try");
        let try_bind = BindOp::Bind {
            src: "/a".into(),
            dst: "/b".into(),
            readonly: true,
            try_: true,
        };
        assert_eq!(argv_of(&try_bind), vec!["--ro-bind-try", "/a", "/b"]);
    }

    #[test]
    fn dir_create_emits_perms_when_set() {
        let op = BindOp::DirCreate {
            dst: "/run/user/1000".into(),
            mode: Some(0o700),
        };
        assert_eq!(argv_of(&op), vec!["--perms", "700", "--dir", "/run/user/1000"]);
    }

    #[test]
    fn only_net_namespace_has_a_share_flag() {
        assert_eq!(argv_of(&BindOp::Share(NsKind::Net)), vec!["--share-net"]);
        assert!(argv_of(&BindOp::Share(NsKind::Ipc)).is_empty());
    }

    #[test]
    fn file_write_defers_to_runner() {
        let op = BindOp::FileWrite {
            dst: "/etc/resolv.conf".into(),
            bytes: b"nameserver 10.0.2.3\n".to_vec(),
        };
        assert!(argv_of(&op).is_empty());
        assert_eq!(op.dst(), Some(Path::new("/etc/resolv.conf")));
        assert!(op.is_readonly());
    }
}
