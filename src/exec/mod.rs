//! The ptrace-based sandboxed execution engine.
//!
//! Runs one child under `PTRACE_SYSCALL`, enforcing a two-tier
//! syscall/path allow-list and a set of rlimits, and yields a single
//! [`ExecResult`], built on `nix`'s process/signal/resource wrappers
//! around a fork-and-exec child.

pub mod syscalls;

use std::ffi::CString;
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

use nix::fcntl::{open, OFlag};
use nix::sys::ptrace;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::WaitStatus;
use nix::unistd::{self, dup2_stderr, dup2_stdin, dup2_stdout, fork, ForkResult, Gid, Pid, Uid};

use crate::error::{AllKorrectError, Result};

/// Two-tier syscall/path restriction active for one exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restriction {
    /// Only `STRICT_SET`/`STRICT_OPEN_PREFIXES`, a single process, a
    /// single `execve`.
    Strict,
    /// `STRICT_SET ∪ LOOSE_SET`, up to 20 processes, unlimited `execve`.
    Loose,
}

impl Restriction {
    fn process_limit(self) -> u64 {
        match self {
            Restriction::Strict => 1,
            Restriction::Loose => 20,
        }
    }

    fn limits_syscalls(self) -> bool {
        matches!(self, Restriction::Strict)
    }
}

/// Outcome of a finished sandboxed execution. `Unknown` only ever
/// appears transiently while the parent loop is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Verdict {
    Unknown = -1,
    Success = 0,
    Failure = 1,
    Crashed = 2,
    Tle = 3,
    Mle = 4,
    Ole = 5,
    Violation = 6,
    MathError = 7,
    MemViolation = 8,
}

/// Per-run resource limits. `None` means "no limit enforced" for that
/// dimension.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    /// Memory cap in bytes, checked against sampled RSS.
    pub memory: Option<u64>,
    /// Output size cap in bytes, enforced via `RLIMIT_FSIZE`.
    pub output: Option<u64>,
    /// Wall/CPU time cap in milliseconds.
    pub time_ms: Option<u64>,
}

/// Everything needed to launch one sandboxed child.
#[derive(Debug)]
pub struct ExecRequest {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub error_file: PathBuf,
    pub limits: Limits,
    pub restriction: Restriction,
}

/// Result of running an [`ExecRequest`] to completion.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub verdict: Verdict,
    pub exit_status: i32,
    pub time_ms: u64,
    pub memory: u64,
}

struct Identity {
    uid: Uid,
    gid: Gid,
}

static IDENTITY: OnceLock<Identity> = OnceLock::new();

/// Resolves the fixed unprivileged `nobody`/`nogroup` identity every
/// sandboxed child runs as. Must be called once at daemon startup before
/// [`execute`]; failure is fatal to the whole process.
pub fn init() -> Result<()> {
    let nobody = nix::unistd::User::from_name("nobody")
        .map_err(|e| AllKorrectError::FatalConfig(format!("looking up user 'nobody': {e}")))?
        .ok_or_else(|| AllKorrectError::FatalConfig("user 'nobody' not found".into()))?;
    log::info!("resolved uid of nobody = {}", nobody.uid.as_raw());

    let nogroup = nix::unistd::Group::from_name("nogroup")
        .map_err(|e| AllKorrectError::FatalConfig(format!("looking up group 'nogroup': {e}")))?
        .or(
            nix::unistd::Group::from_name("nobody").map_err(|e| {
                AllKorrectError::FatalConfig(format!("looking up group 'nobody': {e}"))
            })?,
        )
        .ok_or_else(|| {
            AllKorrectError::FatalConfig("neither group 'nogroup' nor 'nobody' exists".into())
        })?;
    log::info!("resolved gid of nogroup = {}", nogroup.gid.as_raw());

    IDENTITY
        .set(Identity {
            uid: nobody.uid,
            gid: nogroup.gid,
        })
        .map_err(|_| AllKorrectError::FatalConfig("exec::init called twice".into()))
}

/// Forks, sandboxes, and traces one child to completion.
pub fn execute(req: &ExecRequest) -> Result<ExecResult> {
    let identity = IDENTITY
        .get()
        .ok_or_else(|| AllKorrectError::FatalConfig("exec::init was never called".into()))?;

    match unsafe { fork() }.map_err(|e| AllKorrectError::Sandbox(format!("fork failed: {e}")))? {
        ForkResult::Child => run_child(req, identity),
        ForkResult::Parent { child } => run_parent(child, req),
    }
}

fn run_parent(pid: Pid, req: &ExecRequest) -> Result<ExecResult> {
    if let Some(time_ms) = req.limits.time_ms {
        arm_watchdog(pid, time_ms)?;
    }
    let result = parent_loop(pid, req);
    disarm_watchdog();
    result
}

/// Child-side setup (in order): drop to `nobody`/`nogroup`, `chdir`,
/// apply rlimits, redirect stdio to the blob paths, enable tracing, and
/// `execve`. Any failed step exits the child with status 255, which the
/// parent observes as a non-zero exit and reports as `FAILURE`.
fn run_child(req: &ExecRequest, identity: &Identity) -> ! {
    if unistd::setgid(identity.gid).is_err() {
        std::process::exit(255);
    }
    if unistd::setuid(identity.uid).is_err() {
        std::process::exit(255);
    }
    if unistd::chdir(&req.cwd).is_err() {
        std::process::exit(255);
    }
    if set_rlimits(&req.limits, req.restriction).is_err() {
        std::process::exit(255);
    }
    if redirect_stdio(req).is_err() {
        std::process::exit(255);
    }
    if ptrace::traceme().is_err() {
        std::process::exit(255);
    }

    let Ok(command) = CString::new(req.command.as_os_str().as_bytes()) else {
        std::process::exit(255);
    };
    let mut argv = Vec::with_capacity(req.args.len() + 1);
    argv.push(command.clone());
    for arg in &req.args {
        match CString::new(arg.as_bytes()) {
            Ok(c) => argv.push(c),
            Err(_) => std::process::exit(255),
        }
    }

    let _ = unistd::execvp(&command, &argv);
    std::process::exit(255)
}

fn redirect_stdio(req: &ExecRequest) -> nix::Result<()> {
    let in_fd = open(&req.input_file, OFlag::O_RDONLY, Mode::empty())?;
    let out_fd = open(
        &req.output_file,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        Mode::from_bits_truncate(0o700),
    )?;
    let err_fd = open(
        &req.error_file,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        Mode::from_bits_truncate(0o700),
    )?;
    dup2_stdin(in_fd.as_fd())?;
    dup2_stdout(out_fd.as_fd())?;
    dup2_stderr(err_fd.as_fd())?;
    Ok(())
}

fn set_rlimits(limits: &Limits, restriction: Restriction) -> nix::Result<()> {
    if let Some(output) = limits.output {
        setrlimit(Resource::RLIMIT_FSIZE, output, output)?;
    }
    if let Some(memory) = limits.memory {
        let doubled = memory.saturating_mul(2);
        setrlimit(Resource::RLIMIT_AS, doubled, doubled)?;
    }
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    if let Some(time_ms) = limits.time_ms {
        let soft = time_ms.div_ceil(1000);
        setrlimit(Resource::RLIMIT_CPU, soft, soft + 1)?;
    }
    setrlimit(Resource::RLIMIT_NICE, 20, 20)?;
    let proc_limit = restriction.process_limit();
    setrlimit(Resource::RLIMIT_NPROC, proc_limit, proc_limit)?;
    Ok(())
}

static WATCHDOG_PID: AtomicI32 = AtomicI32::new(0);

/// Fires `ceil(1.5 * time_ms / 1000)` seconds out and sends `SIGUSR1` to
/// the traced child, rearming for 1 s until [`disarm_watchdog`] runs.
/// Only `kill`/`alarm` run inside the handler, both async-signal-safe.
fn arm_watchdog(pid: Pid, time_ms: u64) -> Result<()> {
    WATCHDOG_PID.store(pid.as_raw(), Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(alarm_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGALRM, &action) }
        .map_err(|e| AllKorrectError::Sandbox(format!("sigaction(SIGALRM) failed: {e}")))?;
    let secs = (1.5 * time_ms as f64 / 1000.0).ceil().max(1.0) as libc::c_uint;
    unsafe {
        libc::alarm(secs);
    }
    Ok(())
}

fn disarm_watchdog() {
    unsafe {
        libc::alarm(0);
    }
    WATCHDOG_PID.store(0, Ordering::SeqCst);
}

extern "C" fn alarm_handler(_signo: libc::c_int) {
    let pid = WATCHDOG_PID.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe {
            libc::kill(pid, libc::SIGUSR1);
            libc::alarm(1);
        }
    }
}

fn wait4_with_rusage(pid: Pid) -> Result<(libc::c_int, libc::rusage)> {
    let mut status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut rusage) };
    if ret < 0 {
        return Err(AllKorrectError::Sandbox(format!(
            "wait4 failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok((status, rusage))
}

/// Where the next `SIGTRAP` sits in the syscall-stop sequence. The very
/// first `SIGTRAP` a tracee delivers after `PTRACE_TRACEME` + `execve` is
/// the kernel's post-exec notification, not a traced entry-stop — there
/// is no entry-stop for the `execve` that armed tracing, since tracing
/// only started partway through it. Treating that stop as an ordinary
/// "entering" stop (and toggling parity afterward) flips enter/exit
/// parity for every syscall the tracee makes for the rest of its life,
/// so it gets its own state instead of being folded into the toggle.
#[derive(Clone, Copy, PartialEq, Eq)]
enum TraceStop {
    AwaitingExec,
    Entering,
    Exiting,
}

/// Traces `pid` to completion, enforcing the syscall/path/memory/time
/// policy. After the initial post-exec notification, syscall-enter and
/// syscall-exit stops alternate on every `SIGTRAP` under
/// `PTRACE_SYSCALL`; checks run on enter, memory sampling for
/// `brk`/`mmap`/`munmap` runs on the matching exit once the call has
/// actually taken effect.
fn parent_loop(pid: Pid, req: &ExecRequest) -> Result<ExecResult> {
    let mut verdict = Verdict::Unknown;
    let mut exit_status = 0i32;
    let mut time_ms = 0u64;
    let mut memory = 0u64;
    let mut has_exec = false;
    let mut stop = TraceStop::AwaitingExec;
    let mut pending_syscall: Option<i64> = None;

    loop {
        let (status, rusage) = wait4_with_rusage(pid)?;

        time_ms = (rusage.ru_utime.tv_sec as u64) * 1000 + (rusage.ru_utime.tv_usec as u64) / 1000;
        if let Some(limit) = req.limits.time_ms {
            if verdict == Verdict::Unknown && time_ms > limit {
                verdict = Verdict::Tle;
                kill_tree(pid);
            }
        }

        let wait_status = WaitStatus::from_raw(pid, status)
            .map_err(|e| AllKorrectError::Sandbox(format!("decoding wait status: {e}")))?;

        match wait_status {
            WaitStatus::Exited(_, code) => {
                exit_status = code;
                if verdict == Verdict::Unknown {
                    verdict = if code == 0 {
                        Verdict::Success
                    } else {
                        Verdict::Failure
                    };
                }
                return Ok(ExecResult {
                    verdict,
                    exit_status,
                    time_ms,
                    memory,
                });
            }
            WaitStatus::Signaled(_, sig, _) => {
                exit_status = sig as i32;
                if verdict == Verdict::Unknown {
                    verdict = Verdict::Crashed;
                }
                return Ok(ExecResult {
                    verdict,
                    exit_status,
                    time_ms,
                    memory,
                });
            }
            WaitStatus::Stopped(_, sig) => {
                match sig {
                    Signal::SIGURG | Signal::SIGCHLD | Signal::SIGWINCH => {}
                    Signal::SIGTRAP => {
                        match stop {
                            TraceStop::AwaitingExec => {
                                has_exec = true;
                                stop = TraceStop::Entering;
                            }
                            TraceStop::Entering => {
                                match check_syscall_enter(pid, req, &mut has_exec) {
                                    Ok(syscall_no) => pending_syscall = Some(syscall_no),
                                    Err(cause) => {
                                        verdict = cause;
                                        kill_tree(pid);
                                    }
                                }
                                stop = TraceStop::Exiting;
                            }
                            TraceStop::Exiting => {
                                if let Some(syscall_no) = pending_syscall.take() {
                                    if matches!(
                                        syscall_no,
                                        libc::SYS_brk | libc::SYS_mmap | libc::SYS_munmap
                                    ) {
                                        if let Ok(sampled) = sample_memory(pid) {
                                            memory = sampled;
                                            if let Some(limit) = req.limits.memory {
                                                if verdict == Verdict::Unknown && memory > limit {
                                                    verdict = Verdict::Mle;
                                                    kill_tree(pid);
                                                }
                                            }
                                        }
                                    }
                                }
                                stop = TraceStop::Entering;
                            }
                        }
                    }
                    Signal::SIGXFSZ => {
                        verdict = Verdict::Ole;
                        kill_tree(pid);
                    }
                    Signal::SIGXCPU => {
                        verdict = Verdict::Tle;
                        kill_tree(pid);
                    }
                    Signal::SIGUSR1 => {
                        verdict = Verdict::Tle;
                        kill_tree(pid);
                    }
                    Signal::SIGSEGV => {
                        verdict = Verdict::MemViolation;
                        kill_tree(pid);
                    }
                    Signal::SIGFPE => {
                        verdict = Verdict::MathError;
                        kill_tree(pid);
                    }
                    _ => {
                        verdict = Verdict::Crashed;
                        kill_tree(pid);
                    }
                }
                ptrace::syscall(pid, None)
                    .map_err(|e| AllKorrectError::Sandbox(format!("ptrace resume failed: {e}")))?;
            }
            _ => {}
        }
    }
}

fn check_syscall_enter(
    pid: Pid,
    req: &ExecRequest,
    has_exec: &mut bool,
) -> std::result::Result<i64, Verdict> {
    let regs = ptrace::getregs(pid).map_err(|_| Verdict::Crashed)?;
    let syscall_no = regs.orig_rax as i64;
    let loose = !req.restriction.limits_syscalls();

    if !syscalls::is_syscall_allowed(syscall_no, loose) {
        log::warn!("caught forbidden syscall {syscall_no}");
        return Err(Verdict::Violation);
    }

    if syscall_no == libc::SYS_open {
        let path = peek_string(pid, regs.rdi).map_err(|_| Verdict::Crashed)?;
        if !syscalls::check_open(&path, loose) {
            log::warn!("caught opening forbidden file {path}");
            return Err(Verdict::Violation);
        }
    } else if syscall_no == libc::SYS_execve {
        if req.restriction.limits_syscalls() && *has_exec {
            log::warn!("tried to exec a second time under strict mode");
            return Err(Verdict::Violation);
        }
        *has_exec = true;
    }

    Ok(syscall_no)
}

/// Word-granularity `PTRACE_PEEKDATA` scan for a NUL terminator.
fn peek_string(pid: Pid, addr: u64) -> Result<String> {
    let word_size = std::mem::size_of::<libc::c_long>() as u64;
    let mut out = Vec::new();
    let mut offset = 0u64;
    loop {
        let target = (addr + offset) as usize as ptrace::AddressType;
        let word = ptrace::read(pid, target)
            .map_err(|e| AllKorrectError::Sandbox(format!("ptrace peek failed: {e}")))?;
        for byte in word.to_ne_bytes() {
            if byte == 0 {
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.push(byte);
        }
        offset += word_size;
    }
}

/// Samples resident set size from `/proc/{pid}/statm` field 2 (0-indexed
/// position 1), the resolution of the source's memory-accounting open
/// question.
fn sample_memory(pid: Pid) -> Result<u64> {
    let path = format!("/proc/{}/statm", pid.as_raw());
    let content =
        std::fs::read_to_string(&path).map_err(|e| AllKorrectError::io(&path, e))?;
    let resident: u64 = content
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AllKorrectError::Sandbox(format!("malformed statm at {path}")))?;
    Ok(resident * page_size::get() as u64)
}

/// Recursively walks `/proc`, `SIGKILL`ing every descendant of `pid`
/// depth-first before killing `pid` itself. Handles LOOSE-mode
/// fork/clone trees.
pub fn kill_tree(pid: Pid) {
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Ok(child_pid) = name.parse::<i32>() else {
                continue;
            };
            if read_ppid(child_pid) == Some(pid.as_raw()) {
                kill_tree(Pid::from_raw(child_pid));
            }
        }
    }
    let _ = signal::kill(pid, Signal::SIGKILL);
}

/// Parses `ppid` out of `/proc/{pid}/stat`, skipping past the `(comm)`
/// field by its last `)` rather than a fixed token offset, since `comm`
/// may itself contain whitespace.
fn read_ppid(pid: i32) -> Option<i32> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = content.rsplit(')').next()?;
    after_comm.split_whitespace().nth(1)?.parse().ok()
}
