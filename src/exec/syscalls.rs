//! Syscall and path allow-lists for the two restriction tiers.
//!
//! Numbers come straight from `libc`'s x86-64 syscall table, the same
//! target the daemon commits to in its resource accounting (§6); the
//! engine does not attempt to run under any other architecture's syscall
//! numbering.

/// Always-allowed syscalls, both under STRICT and LOOSE.
pub const STRICT_SET: &[i64] = &[
    libc::SYS_getxattr,
    libc::SYS_access,
    libc::SYS_brk,
    libc::SYS_close,
    libc::SYS_execve,
    libc::SYS_exit_group,
    libc::SYS_fstat,
    libc::SYS_futex,
    libc::SYS_getrlimit,
    libc::SYS_ioctl,
    libc::SYS_ioperm,
    libc::SYS_mmap,
    libc::SYS_open,
    libc::SYS_rt_sigaction,
    libc::SYS_rt_sigprocmask,
    libc::SYS_set_robust_list,
    libc::SYS_set_thread_area,
    libc::SYS_set_tid_address,
    libc::SYS_stat,
    libc::SYS_uname,
    libc::SYS_write,
    libc::SYS_read,
    libc::SYS_mprotect,
    libc::SYS_arch_prctl,
    libc::SYS_munmap,
    libc::SYS_clone,
];

/// Extra syscalls allowed only under LOOSE, on top of [`STRICT_SET`].
pub const LOOSE_SET: &[i64] = &[
    libc::SYS_readlink,
    libc::SYS_openat,
    libc::SYS_getdents,
    libc::SYS_getgid,
    libc::SYS_getegid,
    libc::SYS_getuid,
    libc::SYS_geteuid,
    libc::SYS_setrlimit,
    libc::SYS_lstat,
    libc::SYS_vfork,
    libc::SYS_wait4,
    libc::SYS_getpid,
    libc::SYS_unlink,
    libc::SYS_writev,
];

const STRICT_OPEN_PREFIXES: &[&str] = &["/usr/", "/lib/", "/lib64/", "/etc/", "/proc/"];
const LOOSE_OPEN_PREFIXES: &[&str] = &["/sys/", "/tmp/"];

/// Is `syscall_no` reachable under the active tier?
pub fn is_syscall_allowed(syscall_no: i64, loose: bool) -> bool {
    STRICT_SET.contains(&syscall_no) || (loose && LOOSE_SET.contains(&syscall_no))
}

/// Is `path` a legal `open`/`openat` target under the active tier?
pub fn check_open(path: &str, loose: bool) -> bool {
    let matches_any = |prefixes: &[&str]| prefixes.iter().any(|p| path.starts_with(p));
    matches_any(STRICT_OPEN_PREFIXES) || (loose && matches_any(LOOSE_OPEN_PREFIXES))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strict_syscalls_allowed_in_both_tiers() {
        assert!(is_syscall_allowed(libc::SYS_read, false));
        assert!(is_syscall_allowed(libc::SYS_read, true));
    }

    #[test]
    fn loose_only_syscall_rejected_under_strict() {
        assert!(!is_syscall_allowed(libc::SYS_openat, false));
        assert!(is_syscall_allowed(libc::SYS_openat, true));
    }

    #[test]
    fn unknown_syscall_always_rejected() {
        assert!(!is_syscall_allowed(libc::SYS_ptrace, false));
        assert!(!is_syscall_allowed(libc::SYS_ptrace, true));
    }

    #[test]
    fn strict_prefixes_allowed_in_both_tiers() {
        assert!(check_open("/etc/passwd", false));
        assert!(check_open("/etc/passwd", true));
    }

    #[test]
    fn tmp_only_allowed_when_loose() {
        assert!(!check_open("/tmp/x", false));
        assert!(check_open("/tmp/x", true));
    }

    #[test]
    fn unrelated_path_rejected_in_both_tiers() {
        assert!(!check_open("/home/user/.bashrc", false));
        assert!(!check_open("/home/user/.bashrc", true));
    }
}
