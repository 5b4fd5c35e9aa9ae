//! End-to-end sandboxed-execution scenarios against real binaries.
//!
//! These need root (the engine drops to `nobody`/`nogroup` mid-fork) and a
//! live `ptrace`, so every test bails out early rather than failing when
//! run unprivileged or without the binaries it drives.

use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::OnceLock;
use std::thread;

use allkorrect::codec::{ByteReader, ByteWriter};
use allkorrect::exec::{self, ExecRequest, Limits, Restriction, Verdict};
use allkorrect::frame::{self, Frame, MessageType};
use allkorrect::fs::{self as akfs, Namespace};
use allkorrect::session;
use tempfile::TempDir;

fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// `exec::init()` may only run once per process; cache its outcome so
/// every test in this binary shares one attempt instead of the second
/// test observing "already initialized" as a spurious failure.
fn init_once_ok() -> bool {
    static INIT: OnceLock<bool> = OnceLock::new();
    *INIT.get_or_init(|| exec::init().is_ok())
}

macro_rules! require_root_and_init {
    () => {
        if !running_as_root() {
            eprintln!("skipping: not running as root");
            return;
        }
        if !init_once_ok() {
            eprintln!("skipping: exec::init failed (no nobody/nogroup on this host?)");
            return;
        }
    };
}

fn fixture() -> (TempDir, Namespace) {
    let dir = TempDir::new().unwrap();
    let ns = Namespace::init(dir.path().join("cache")).unwrap();
    (dir, ns)
}

fn base_request(ns: &Namespace, cwd: &Path, command: &str, args: &[&str]) -> ExecRequest {
    ExecRequest {
        command: command.into(),
        args: args.iter().map(|s| s.to_string()).collect(),
        cwd: cwd.to_path_buf(),
        input_file: "/dev/null".into(),
        output_file: ns.new_blob("_out").unwrap(),
        error_file: ns.new_blob("_err").unwrap(),
        limits: Limits::default(),
        restriction: Restriction::Loose,
    }
}

/// S1: echoing stdin to stdout succeeds under generous limits.
#[test]
fn s1_echo_exec_succeeds() {
    require_root_and_init!();
    if !Path::new("/bin/cat").exists() {
        eprintln!("skipping: /bin/cat not present");
        return;
    }
    let (_dir, ns) = fixture();
    let tmp = ns.new_tmp_dir().unwrap();
    ns.put_blob("in", b"hi\n").unwrap();
    let input = ns.blob_path("in");

    let mut req = base_request(&ns, &tmp, "/bin/cat", &["/bin/cat"]);
    req.input_file = input;
    req.limits = Limits {
        memory: Some(64 * 1024 * 1024),
        output: Some(1024 * 1024),
        time_ms: Some(1000),
    };

    let result = exec::execute(&req).unwrap();
    assert_eq!(result.verdict, Verdict::Success);
    assert_eq!(result.exit_status, 0);
    assert!(result.time_ms < 1000);

    let output = std::fs::read(&req.output_file).unwrap();
    assert_eq!(output, b"hi\n");
}

/// S2: a STRICT-mode program that issues `socket(2)` is caught by the
/// syscall allow-list before the kernel ever runs it (ptrace stops on
/// syscall-enter), regardless of whether the call would itself have
/// succeeded under the dropped-privilege `nobody` identity.
#[test]
fn s2_forbidden_syscall_is_a_violation() {
    require_root_and_init!();
    if !Path::new("/bin/ping").exists() {
        eprintln!("skipping: /bin/ping not present");
        return;
    }
    let (_dir, ns) = fixture();
    let tmp = ns.new_tmp_dir().unwrap();

    let mut req = base_request(&ns, &tmp, "/bin/ping", &["/bin/ping", "-c1", "127.0.0.1"]);
    req.restriction = Restriction::Strict;
    req.limits.time_ms = Some(2000);

    let result = exec::execute(&req).unwrap();
    assert_eq!(result.verdict, Verdict::Violation);
}

/// S3: a STRICT-mode program that calls `execve` twice (its own launch,
/// then a shell-builtin `exec`) is caught on the second call.
#[test]
fn s3_second_execve_under_strict_is_a_violation() {
    require_root_and_init!();
    if !Path::new("/bin/sh").exists() {
        eprintln!("skipping: /bin/sh not present");
        return;
    }
    let (_dir, ns) = fixture();
    let tmp = ns.new_tmp_dir().unwrap();

    let mut req = base_request(&ns, &tmp, "/bin/sh", &["/bin/sh", "-c", "exec /bin/true"]);
    req.restriction = Restriction::Strict;
    req.limits.time_ms = Some(2000);

    let result = exec::execute(&req).unwrap();
    assert_eq!(result.verdict, Verdict::Violation);
}

/// S4: a STRICT-mode program opening a path outside the allow-listed
/// prefixes is caught at the `open` call.
#[test]
fn s4_forbidden_path_is_a_violation() {
    require_root_and_init!();
    if !Path::new("/bin/cat").exists() {
        eprintln!("skipping: /bin/cat not present");
        return;
    }
    let (_dir, ns) = fixture();
    let tmp = ns.new_tmp_dir().unwrap();

    let mut req = base_request(
        &ns,
        &tmp,
        "/bin/cat",
        &["/bin/cat", "/home/nonexistent-user/secret"],
    );
    req.restriction = Restriction::Strict;
    req.limits.time_ms = Some(2000);

    let result = exec::execute(&req).unwrap();
    assert_eq!(result.verdict, Verdict::Violation);
}

/// S5: a busy loop is killed once it exceeds its time limit.
#[test]
fn s5_time_bomb_is_tle() {
    require_root_and_init!();
    if !Path::new("/bin/sh").exists() {
        eprintln!("skipping: /bin/sh not present");
        return;
    }
    let (_dir, ns) = fixture();
    let tmp = ns.new_tmp_dir().unwrap();

    let mut req = base_request(&ns, &tmp, "/bin/sh", &["/bin/sh", "-c", "while :; do :; done"]);
    req.limits.time_ms = Some(200);

    let result = exec::execute(&req).unwrap();
    assert_eq!(result.verdict, Verdict::Tle);
    assert!(result.time_ms >= 200 || result.time_ms > 0);
}

/// S6: writing past the output limit raises `SIGXFSZ`, reported as OLE.
#[test]
fn s6_output_bomb_is_ole() {
    require_root_and_init!();
    if !Path::new("/bin/dd").exists() {
        eprintln!("skipping: /bin/dd not present");
        return;
    }
    let (_dir, ns) = fixture();
    let tmp = ns.new_tmp_dir().unwrap();

    let mut req = base_request(
        &ns,
        &tmp,
        "/bin/dd",
        &["/bin/dd", "if=/dev/zero", "bs=1M", "count=10"],
    );
    req.limits.output = Some(1024 * 1024);
    req.limits.time_ms = Some(5000);

    let result = exec::execute(&req).unwrap();
    assert_eq!(result.verdict, Verdict::Ole);
}

/// S7: starving `RLIMIT_AS` so severely that the dynamic loader itself
/// cannot map in `libc` reliably turns into a `SIGSEGV`, which the engine
/// classifies as `MEM_VIOLATION` — there is no portable way to compile a
/// deliberately crashing test binary here, so this drives the same signal
/// through resource starvation instead of a hand-written null deref.
#[test]
fn s7_starved_process_is_killed_by_a_fatal_signal() {
    require_root_and_init!();
    if !Path::new("/bin/true").exists() {
        eprintln!("skipping: /bin/true not present");
        return;
    }
    let (_dir, ns) = fixture();
    let tmp = ns.new_tmp_dir().unwrap();

    let mut req = base_request(&ns, &tmp, "/bin/true", &["/bin/true"]);
    req.limits.memory = Some(4096);
    req.limits.time_ms = Some(2000);

    let result = exec::execute(&req).unwrap();
    assert!(matches!(
        result.verdict,
        Verdict::MemViolation | Verdict::Crashed | Verdict::Failure
    ));
}

/// Invariant 1: after a full `EXEC` round trip over the wire, the input
/// blob and both generated output/error blobs sit back at mode `0700` —
/// exercised through `session::run` rather than `exec::execute` directly,
/// since the restore guarantee lives in the dispatcher, not the engine.
#[test]
fn invariant1_exec_restores_blob_modes_over_the_wire() {
    require_root_and_init!();
    if !Path::new("/bin/cat").exists() {
        eprintln!("skipping: /bin/cat not present");
        return;
    }

    let dir = TempDir::new().unwrap();
    let ns = Namespace::init(dir.path().join("cache")).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let ns_for_server = ns.clone();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = session::run(&mut stream, &ns_for_server);
    });

    let mut client = TcpStream::connect(addr).unwrap();

    let mut w = ByteWriter::new();
    w.write_string("in");
    w.write_i32(3);
    w.write_bytes(b"hi\n");
    frame::write_frame(&mut client, &Frame::with_body(MessageType::PUT_BLOB, w.into_bytes())).unwrap();
    assert_eq!(frame::read_frame(&mut client).unwrap().ty, MessageType::OK);

    let mut w = ByteWriter::new();
    w.write_string("/bin/cat");
    w.write_i32(1);
    w.write_string("/bin/cat");
    w.write_i64(64 * 1024 * 1024);
    w.write_i64(1024 * 1024);
    w.write_i32(1000);
    w.write_i32(1); // LOOSE
    w.write_string("in");
    frame::write_frame(&mut client, &Frame::with_body(MessageType::EXEC, w.into_bytes())).unwrap();
    let reply = frame::read_frame(&mut client).unwrap();
    assert_eq!(reply.ty, MessageType::EXEC_REPLY);

    let mut r = ByteReader::new(&reply.body);
    let _exit_status = r.read_i32().unwrap();
    let verdict = r.read_i32().unwrap();
    let output_name = r.read_string().unwrap();
    let error_name = r.read_string().unwrap();
    assert_eq!(verdict, Verdict::Success as i32);

    let mode_of = |name: &str| -> u32 {
        std::fs::metadata(ns.blob_path(name)).unwrap().permissions().mode() & 0o777
    };
    assert_eq!(mode_of("in"), akfs::MODE_AT_REST);
    assert_eq!(mode_of(&output_name), akfs::MODE_AT_REST);
    assert_eq!(mode_of(&error_name), akfs::MODE_AT_REST);

    frame::write_frame(&mut client, &Frame::empty(MessageType::EXIT)).unwrap();
    drop(client);
    handle.join().unwrap();
}
