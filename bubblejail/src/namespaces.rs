//! Kernel namespace kinds and the namespace-limits applier.
//!
//! Limits are written to `/proc/sys/user/max_*_namespaces` from inside the
//! sandbox's user namespace, so the ceilings bind the sandbox without
//! touching the host. The write runs in a forked child so the parent never
//! changes namespace membership.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use nix::sched::{setns, CloneFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{Error, Result};

/// A kernel namespace kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NsKind {
    /// User namespace.
    User,
    /// Mount namespace.
    Mnt,
    /// PID namespace.
    Pid,
    /// IPC namespace.
    Ipc,
    /// Network namespace.
    Net,
    /// Time namespace.
    Time,
    /// UTS (hostname) namespace.
    Uts,
    /// Cgroup namespace.
    Cgroup,
}

impl NsKind {
    /// All kinds, in `/proc/sys/user` order.
    pub const ALL: [NsKind; 8] = [
        NsKind::User,
        NsKind::Mnt,
        NsKind::Pid,
        NsKind::Ipc,
        NsKind::Net,
        NsKind::Time,
        NsKind::Uts,
        NsKind::Cgroup,
    ];

    /// Sysctl file under `/proc/sys/user` holding this kind's ceiling.
    pub fn proc_limit_file(self) -> &'static str {
        match self {
            NsKind::User => "max_user_namespaces",
            NsKind::Mnt => "max_mnt_namespaces",
            NsKind::Pid => "max_pid_namespaces",
            NsKind::Ipc => "max_ipc_namespaces",
            NsKind::Net => "max_net_namespaces",
            NsKind::Time => "max_time_namespaces",
            NsKind::Uts => "max_uts_namespaces",
            NsKind::Cgroup => "max_cgroup_namespaces",
        }
    }
}

impl fmt::Display for NsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NsKind::User => "user",
            NsKind::Mnt => "mnt",
            NsKind::Pid => "pid",
            NsKind::Ipc => "ipc",
            NsKind::Net => "net",
            NsKind::Time => "time",
            NsKind::Uts => "uts",
            NsKind::Cgroup => "cgroup",
        })
    }
}

/// Requested namespace ceilings.
///
/// `0` denies creating any namespace of that kind, `-1` keeps the
/// inherited (platform maximum) ceiling, `n >= 1` allows `n` namespaces.
/// The `+1` self-consumption adjustment has already been applied by the
/// service that produced the map.
pub type NsLimits = BTreeMap<NsKind, i64>;

/// How long the setter child may take before it is killed.
const SETTER_TIMEOUT: Duration = Duration::from_secs(3);

/// Writes `limits` into the user namespace of `pid`.
///
/// Forks a setter child that joins the target user namespace via
/// `setns(2)` and writes each ceiling. Any failure — open, join, write,
/// child timeout — is fatal and must abort sandbox startup.
pub fn apply_limits(pid: i32, limits: &NsLimits) -> Result<()> {
    if limits.values().all(|v| *v == -1) {
        return Ok(());
    }

    // Pin the namespace before forking so a dying sandbox PID surfaces as
    // an open error here rather than a write into the wrong namespace.
    let userns = fs::File::open(format!("/proc/{pid}/ns/user"))
        .map_err(|e| Error::NamespaceLimitFailed(format!("open user namespace of {pid}: {e}")))?;

    match unsafe { fork() }.map_err(|e| Error::NamespaceLimitFailed(e.to_string()))? {
        ForkResult::Child => {
            let code = match setter(&userns, limits) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => wait_setter(child),
    }
}

/// Child body: join the namespace and write every ceiling.
fn setter(userns: &fs::File, limits: &NsLimits) -> Result<()> {
    setns(userns.as_fd(), CloneFlags::CLONE_NEWUSER)?;

    for (kind, value) in limits {
        if *value == -1 {
            continue;
        }
        let path = format!("/proc/sys/user/{}", kind.proc_limit_file());
        fs::write(&path, value.to_string())?;
    }
    Ok(())
}

nix::ioctl_none!(ns_get_userns, 0xb7, 0x1);

/// Opens the user namespace owning the network namespace of `pid`.
///
/// slirp4netns has to join that namespace to attach its tap device.
pub fn userns_of_netns(pid: i32) -> Result<OwnedFd> {
    let netns = fs::File::open(format!("/proc/{pid}/ns/net"))
        .map_err(|e| Error::NetworkStackFailed(format!("open net namespace of {pid}: {e}")))?;
    let fd = unsafe { ns_get_userns(netns.as_raw_fd()) }
        .map_err(|e| Error::NetworkStackFailed(format!("NS_GET_USERNS: {e}")))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Waits for the setter child, killing it after [`SETTER_TIMEOUT`].
fn wait_setter(child: Pid) -> Result<()> {
    let deadline = Instant::now() + SETTER_TIMEOUT;
    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    let _ = nix::sys::signal::kill(child, nix::sys::signal::SIGKILL);
                    let _ = waitpid(child, None);
                    return Err(Error::NamespaceLimitFailed(
                        "limit setter subprocess timed out".into(),
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(WaitStatus::Exited(_, 0)) => return Ok(()),
            Ok(WaitStatus::Exited(_, code)) => {
                return Err(Error::NamespaceLimitFailed(format!(
                    "limit setter subprocess exited with code {code}"
                )));
            }
            Ok(status) => {
                return Err(Error::NamespaceLimitFailed(format!(
                    "limit setter subprocess failed: {status:?}"
                )));
            }
            Err(e) => return Err(Error::NamespaceLimitFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_files_cover_all_kinds() {
        let files: Vec<_> = NsKind::ALL.iter().map(|k| k.proc_limit_file()).collect();
        assert_eq!(files.len(), 8);
        for f in &files {
            assert!(f.starts_with("max_") && f.ends_with("_namespaces"));
        }
        // Kind names match the sysctl spelling.
        assert_eq!(NsKind::Mnt.proc_limit_file(), "max_mnt_namespaces");
        assert_eq!(NsKind::Cgroup.proc_limit_file(), "max_cgroup_namespaces");
    }

    #[test]
    fn all_unlimited_is_a_no_op() {
        let limits: NsLimits = NsKind::ALL.iter().map(|k| (*k, -1)).collect();
        // PID 0 never has an openable namespace file; success proves the
        // applier short-circuited before touching /proc.
        assert!(apply_limits(0, &limits).is_ok());
    }

    #[test]
    fn missing_target_pid_is_fatal() {
        let mut limits = NsLimits::new();
        limits.insert(NsKind::User, 0);
        let err = apply_limits(-1, &limits).unwrap_err();
        assert!(matches!(err, Error::NamespaceLimitFailed(_)));
    }
}
