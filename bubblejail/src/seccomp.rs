//! Seccomp rule set and BPF filter compiler.
//!
//! The filter is default-allow: a prologue dispatches on the audit
//! architecture, each known architecture gets a block of per-syscall
//! errno returns, and everything else falls through to `ALLOW`. The
//! compiled program is raw `struct sock_filter` bytes, handed to bwrap
//! over an inherited FD (`--seccomp`).
//!
//! Syscall names are resolved against per-architecture tables. A name
//! unknown on one architecture is skipped silently (the kernel simply
//! does not expose it there); a name unknown on every architecture is
//! logged as a warning but never fails the build.

use std::collections::BTreeMap;

use tracing::warn;

/// One seccomp directive emitted by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeccompRule {
    /// Make `syscall` fail with `errno` instead of executing.
    Deny {
        /// Syscall name, resolved per architecture.
        syscall: String,
        /// Errno returned to the caller (`0` fakes success).
        errno: u16,
    },
    /// Remove `syscall` from the deny set, whatever added it.
    Allow {
        /// Syscall name.
        syscall: String,
    },
}

impl SeccompRule {
    /// Denial shorthand.
    pub fn deny(syscall: &str, errno: u16) -> Self {
        Self::Deny {
            syscall: syscall.into(),
            errno,
        }
    }
}

/// Revision of the baseline deny list. Bumped whenever the list changes
/// so instances can be audited against the policy they were built with.
pub const BASELINE_REVISION: u32 = 2;

/// Syscalls denied by default in every sandbox.
///
/// Namespace creation, tracing, kernel-facility and obsolete calls. The
/// `debug` service can punch holes with explicit `Allow` rules, and
/// `BUBBLEJAIL_DISABLE_SECCOMP_DEFAULTS=1` suppresses the list entirely.
const BASELINE_DENY: &[(&str, u16)] = &[
    // Namespace creation. clone3 gets ENOSYS so runtimes fall back to
    // clone, which bwrap's no-new-userns setup already constrains.
    ("unshare", EPERM),
    ("clone3", ENOSYS),
    // Tracing and kernel introspection.
    ("ptrace", EPERM),
    ("perf_event_open", EPERM),
    ("bpf", EPERM),
    ("userfaultfd", EPERM),
    ("lookup_dcookie", EPERM),
    ("fanotify_init", EPERM),
    // Kernel module and kexec facilities.
    ("init_module", EPERM),
    ("finit_module", EPERM),
    ("delete_module", EPERM),
    ("query_module", EPERM),
    ("kexec_load", EPERM),
    ("kexec_file_load", EPERM),
    // Host administration.
    ("swapon", EPERM),
    ("swapoff", EPERM),
    ("acct", EPERM),
    ("quotactl", EPERM),
    ("sethostname", EPERM),
    ("setdomainname", EPERM),
    ("settimeofday", EPERM),
    ("clock_settime", EPERM),
    ("clock_settime64", EPERM),
    ("vhangup", EPERM),
    ("iopl", EPERM),
    ("ioperm", EPERM),
    ("pciconfig_read", EPERM),
    ("pciconfig_write", EPERM),
    ("pciconfig_iobase", EPERM),
    // NUMA page migration.
    ("migrate_pages", EPERM),
    ("move_pages", EPERM),
    // Obsolete or unused.
    ("bdflush", EPERM),
    ("io_pgetevents", EPERM),
    ("nfsservctl", EPERM),
    ("nice", EPERM),
    ("oldfstat", EPERM),
    ("oldlstat", EPERM),
    ("oldolduname", EPERM),
    ("oldstat", EPERM),
    ("olduname", EPERM),
    ("sgetmask", EPERM),
    ("ssetmask", EPERM),
    ("stime", EPERM),
    ("swapcontext", EPERM),
    ("sysfs", EPERM),
    ("uselib", EPERM),
    ("ustat", EPERM),
    ("vm86", EPERM),
    ("vm86old", EPERM),
    ("vmsplice", EPERM),
];

const EPERM: u16 = 1;
const ENOSYS: u16 = 38;

/// Baseline rules as emitted by the default preamble.
pub fn baseline_rules() -> impl Iterator<Item = SeccompRule> {
    BASELINE_DENY
        .iter()
        .map(|&(name, errno)| SeccompRule::deny(name, errno))
}

// ---------------------------------------------------------------------------
// Rule accumulation
// ---------------------------------------------------------------------------

/// Accumulated seccomp state for one sandbox.
#[derive(Debug, Default)]
pub struct SeccompFilter {
    /// Denied syscalls by name. BTreeMap keeps compilation deterministic.
    denies: BTreeMap<String, u16>,
    /// Explicitly allowed names; win over any deny.
    allows: Vec<String>,
}

impl SeccompFilter {
    /// Empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one rule. `Allow` beats `Deny` regardless of order.
    pub fn add(&mut self, rule: &SeccompRule) {
        match rule {
            SeccompRule::Deny { syscall, errno } => {
                self.denies.insert(syscall.clone(), *errno);
            }
            SeccompRule::Allow { syscall } => self.allows.push(syscall.clone()),
        }
    }

    /// True when no denial survives; such a filter is not emitted at all.
    pub fn is_empty(&self) -> bool {
        self.effective().next().is_none()
    }

    /// Denials that survive the allow overrides.
    fn effective(&self) -> impl Iterator<Item = (&str, u16)> {
        self.denies
            .iter()
            .filter(|(name, _)| !self.allows.iter().any(|a| a == *name))
            .map(|(name, errno)| (name.as_str(), *errno))
    }

    /// Compiles the filter to raw BPF program bytes.
    pub fn compile(&self) -> Vec<u8> {
        let rules: Vec<(&str, u16)> = self.effective().collect();

        for &(name, _) in &rules {
            if ARCHES.iter().all(|arch| resolve(arch, name).is_none()) {
                warn!(syscall = name, "syscall unknown on every supported architecture");
            }
        }

        let mut prog: Vec<libc::sock_filter> = Vec::new();
        // A := seccomp_data.arch
        prog.push(stmt(BPF_LD_W_ABS, ARCH_OFFSET));

        for arch in ARCHES {
            let block = arch_block(arch, &rules);
            // Fall into the block on a match, skip past it otherwise.
            prog.push(jump(arch.audit, 0, block.len() as u8));
            prog.extend(block);
        }

        // Unlisted architectures pass through unfiltered, matching the
        // kernel exposing an arch we have no table for.
        prog.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));

        let mut bytes = Vec::with_capacity(prog.len() * 8);
        for insn in &prog {
            bytes.extend_from_slice(&insn.code.to_ne_bytes());
            bytes.push(insn.jt);
            bytes.push(insn.jf);
            bytes.extend_from_slice(&insn.k.to_ne_bytes());
        }
        bytes
    }
}

/// Per-architecture filter block: load the syscall nr, match each denied
/// syscall resolvable on this architecture, allow the rest.
fn arch_block(arch: &Arch, rules: &[(&str, u16)]) -> Vec<libc::sock_filter> {
    let mut block = Vec::new();
    // A := seccomp_data.nr
    block.push(stmt(BPF_LD_W_ABS, NR_OFFSET));
    for &(name, errno) in rules {
        if let Some(nr) = resolve(arch, name) {
            block.push(jump(nr, 0, 1));
            block.push(stmt(
                BPF_RET_K,
                SECCOMP_RET_ERRNO | (u32::from(errno) & SECCOMP_RET_DATA),
            ));
        }
    }
    block.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
    block
}

/// Resolves a syscall name on one architecture.
fn resolve(arch: &Arch, name: &str) -> Option<u32> {
    arch.table
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, nr)| *nr)
}

// ---------------------------------------------------------------------------
// BPF encoding
// ---------------------------------------------------------------------------

// Classic BPF opcodes (BPF_LD|BPF_W|BPF_ABS, BPF_JMP|BPF_JEQ|BPF_K,
// BPF_RET|BPF_K), as consumed by SECCOMP_SET_MODE_FILTER.
const BPF_LD_W_ABS: u16 = 0x20;
const BPF_JEQ_K: u16 = 0x15;
const BPF_RET_K: u16 = 0x06;

/// `struct seccomp_data` field offsets.
const NR_OFFSET: u32 = 0;
const ARCH_OFFSET: u32 = 4;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;
const AUDIT_ARCH_I386: u32 = 0x4000_0003;

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter {
        code: BPF_JEQ_K,
        jt,
        jf,
        k,
    }
}

// ---------------------------------------------------------------------------
// Syscall tables
// ---------------------------------------------------------------------------

/// One architecture the compiler can target.
struct Arch {
    audit: u32,
    table: &'static [(&'static str, u32)],
}

/// Architectures the host kernel may expose to an x86_64 sandbox: native
/// plus 32-bit compat.
const ARCHES: &[Arch] = &[
    Arch {
        audit: AUDIT_ARCH_X86_64,
        table: TABLE_X86_64,
    },
    Arch {
        audit: AUDIT_ARCH_I386,
        table: TABLE_I386,
    },
];

/// x86_64 syscall numbers for every name a service can emit.
const TABLE_X86_64: &[(&str, u32)] = &[
    ("acct", 163),
    ("bpf", 321),
    ("clock_settime", 227),
    ("clone3", 435),
    ("delete_module", 176),
    ("fanotify_init", 300),
    ("finit_module", 313),
    ("fsync", 74),
    ("init_module", 175),
    ("io_pgetevents", 333),
    ("ioperm", 173),
    ("iopl", 172),
    ("kexec_file_load", 320),
    ("kexec_load", 246),
    ("lookup_dcookie", 212),
    ("migrate_pages", 256),
    ("move_pages", 279),
    ("nfsservctl", 180),
    ("perf_event_open", 298),
    ("ptrace", 101),
    ("quotactl", 179),
    ("setdomainname", 171),
    ("sethostname", 170),
    ("settimeofday", 164),
    ("swapoff", 168),
    ("swapon", 167),
    ("sync", 162),
    ("sysfs", 139),
    ("unshare", 272),
    ("uselib", 134),
    ("userfaultfd", 323),
    ("ustat", 136),
    ("vhangup", 153),
    ("vmsplice", 278),
];

/// i386 syscall numbers for the same catalog, including 32-bit-only
/// obsolete calls that have no x86_64 counterpart.
const TABLE_I386: &[(&str, u32)] = &[
    ("acct", 51),
    ("bdflush", 134),
    ("bpf", 357),
    ("clock_settime", 264),
    ("clock_settime64", 404),
    ("clone3", 435),
    ("delete_module", 129),
    ("fanotify_init", 338),
    ("finit_module", 350),
    ("fsync", 118),
    ("init_module", 128),
    ("io_pgetevents", 385),
    ("ioperm", 101),
    ("iopl", 110),
    ("kexec_file_load", 380),
    ("kexec_load", 283),
    ("lookup_dcookie", 253),
    ("migrate_pages", 294),
    ("move_pages", 317),
    ("nfsservctl", 169),
    ("nice", 34),
    ("oldfstat", 28),
    ("oldlstat", 84),
    ("oldolduname", 59),
    ("oldstat", 18),
    ("olduname", 109),
    ("perf_event_open", 336),
    ("ptrace", 26),
    ("query_module", 167),
    ("quotactl", 131),
    ("setdomainname", 121),
    ("sethostname", 74),
    ("settimeofday", 79),
    ("sgetmask", 68),
    ("ssetmask", 69),
    ("stime", 25),
    ("swapoff", 115),
    ("swapon", 87),
    ("sync", 36),
    ("sysfs", 135),
    ("unshare", 310),
    ("uselib", 86),
    ("userfaultfd", 374),
    ("ustat", 62),
    ("vhangup", 111),
    ("vm86", 166),
    ("vm86old", 113),
    ("vmsplice", 316),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Vec<(u16, u8, u8, u32)> {
        bytes
            .chunks_exact(8)
            .map(|c| {
                (
                    u16::from_ne_bytes([c[0], c[1]]),
                    c[2],
                    c[3],
                    u32::from_ne_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
            .collect()
    }

    #[test]
    fn empty_filter_reports_empty() {
        assert!(SeccompFilter::new().is_empty());
    }

    #[test]
    fn allow_overrides_deny_regardless_of_order() {
        let mut filter = SeccompFilter::new();
        filter.add(&SeccompRule::Allow {
            syscall: "unshare".into(),
        });
        filter.add(&SeccompRule::deny("unshare", 1));
        assert!(filter.is_empty());
    }

    #[test]
    fn baseline_covers_mandatory_syscalls() {
        let names: Vec<String> = baseline_rules()
            .map(|r| match r {
                SeccompRule::Deny { syscall, .. } => syscall,
                SeccompRule::Allow { syscall } => syscall,
            })
            .collect();
        for required in ["unshare", "clone3", "perf_event_open", "bpf", "userfaultfd", "ptrace"] {
            assert!(names.iter().any(|n| n == required), "missing {required}");
        }
    }

    #[test]
    fn program_starts_with_arch_load_and_ends_with_allow() {
        let mut filter = SeccompFilter::new();
        filter.add(&SeccompRule::deny("unshare", 1));
        let insns = decode(&filter.compile());

        assert_eq!(insns[0], (BPF_LD_W_ABS, 0, 0, ARCH_OFFSET));
        let last = insns.last().unwrap();
        assert_eq!(*last, (BPF_RET_K, 0, 0, SECCOMP_RET_ALLOW));
    }

    #[test]
    fn denied_syscall_returns_requested_errno() {
        let mut filter = SeccompFilter::new();
        filter.add(&SeccompRule::deny("sync", 0));
        filter.add(&SeccompRule::deny("unshare", 1));
        let insns = decode(&filter.compile());

        // sync on x86_64 is nr 162; the instruction after its match must
        // return ERRNO with errno 0.
        let pos = insns
            .iter()
            .position(|i| i.0 == BPF_JEQ_K && i.3 == 162)
            .expect("no match for sync");
        assert_eq!(insns[pos + 1], (BPF_RET_K, 0, 0, SECCOMP_RET_ERRNO));

        let pos = insns
            .iter()
            .position(|i| i.0 == BPF_JEQ_K && i.3 == 272)
            .expect("no match for unshare");
        assert_eq!(insns[pos + 1].3, SECCOMP_RET_ERRNO | 1);
    }

    #[test]
    fn unknown_name_on_this_arch_is_skipped() {
        let mut filter = SeccompFilter::new();
        // vm86 exists only on i386.
        filter.add(&SeccompRule::deny("vm86", 1));
        let insns = decode(&filter.compile());
        // The x86_64 block must not contain a match for any nr mapped
        // from vm86's i386 number under the x86_64 arch test.
        assert!(!filter.is_empty());
        assert!(insns.iter().any(|i| i.3 == AUDIT_ARCH_I386));
    }

    #[test]
    fn compilation_is_deterministic() {
        let build = || {
            let mut f = SeccompFilter::new();
            for rule in baseline_rules() {
                f.add(&rule);
            }
            f.add(&SeccompRule::deny("sync", 0));
            f.compile()
        };
        assert_eq!(build(), build());
    }
}
