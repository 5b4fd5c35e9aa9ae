//! Per-connection request dispatcher.
//!
//! Owns one session's private tmp directory and drives the framed
//! request/reply loop until `EXIT` or a fatal error. Every exit path —
//! `EXIT`, an error return, an early `?` — removes the tmp directory via
//! [`crate::scope_guard::ScopeGuard`].

use std::cell::RefCell;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::codec::{ByteReader, ByteWriter};
use crate::error::{AllKorrectError, Result};
use crate::exec::{self, ExecRequest, Limits, Restriction};
use crate::fs::{self, Class, Namespace, Op};
use crate::frame::{self, Frame, MessageType};
use crate::scope_guard::ScopeGuard;

/// Runs one client session to completion: creates a tmp directory,
/// processes frames until `EXIT` or an error, then tears the tmp
/// directory down unconditionally.
pub fn run<S: Read + Write>(stream: &mut S, namespace: &Namespace) -> Result<()> {
    let tmp_dir = namespace.new_tmp_dir()?;
    log::info!("using tmp dir {}", tmp_dir.display());
    let namespace_for_cleanup = namespace.clone();
    let tmp_dir_for_cleanup = tmp_dir.clone();
    let _cleanup = ScopeGuard::new(move || {
        if let Err(e) = namespace_for_cleanup.remove_tmp_dir(&tmp_dir_for_cleanup) {
            log::error!("failed to remove tmp dir: {e}");
        }
    });

    loop {
        let request = frame::read_frame(stream)?;
        if request.ty == MessageType::EXIT {
            log::info!("client sent EXIT");
            return Ok(());
        }
        let reply = dispatch(request, namespace, &tmp_dir)?;
        frame::write_frame(stream, &reply)?;
    }
}

fn dispatch(request: Frame, namespace: &Namespace, tmp_dir: &Path) -> Result<Frame> {
    match request.ty {
        MessageType::EXIT => unreachable!("handled by the caller"),
        MessageType::EXEC => handle_exec(&request.body, namespace, tmp_dir),
        MessageType::PUT_BLOB => handle_put_blob(&request.body, namespace),
        MessageType::GET_BLOB => handle_get_blob(&request.body, namespace),
        MessageType::HAS_BLOB => handle_has_blob(&request.body, namespace),
        MessageType::HAS_FILE => handle_has_file(&request.body, namespace, tmp_dir),
        MessageType::MOVE_BLOB2FILE => {
            handle_transfer(Op::Move, Class::Blob, Class::File, &request.body, namespace, tmp_dir)
        }
        MessageType::MOVE_BLOB2BLOB => {
            handle_transfer(Op::Move, Class::Blob, Class::Blob, &request.body, namespace, tmp_dir)
        }
        MessageType::MOVE_FILE2FILE => {
            handle_transfer(Op::Move, Class::File, Class::File, &request.body, namespace, tmp_dir)
        }
        MessageType::MOVE_FILE2BLOB => {
            handle_transfer(Op::Move, Class::File, Class::Blob, &request.body, namespace, tmp_dir)
        }
        MessageType::COPY_BLOB2FILE => {
            handle_transfer(Op::Copy, Class::Blob, Class::File, &request.body, namespace, tmp_dir)
        }
        MessageType::COPY_BLOB2BLOB => {
            handle_transfer(Op::Copy, Class::Blob, Class::Blob, &request.body, namespace, tmp_dir)
        }
        MessageType::COPY_FILE2FILE => {
            handle_transfer(Op::Copy, Class::File, Class::File, &request.body, namespace, tmp_dir)
        }
        MessageType::COPY_FILE2BLOB => {
            handle_transfer(Op::Copy, Class::File, Class::Blob, &request.body, namespace, tmp_dir)
        }
        other => Err(AllKorrectError::ProtocolError(format!(
            "{other:?} is not a valid client request"
        ))),
    }
}

fn handle_exec(body: &[u8], namespace: &Namespace, tmp_dir: &Path) -> Result<Frame> {
    let mut r = ByteReader::new(body);
    let cmd = r.read_string()?;
    let argc = r.read_i32()?;
    if argc < 0 {
        return Err(AllKorrectError::ProtocolError("negative argc".into()));
    }
    let mut args = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        args.push(r.read_string()?);
    }
    let memory_limit = r.read_i64()?;
    let output_limit = r.read_i64()?;
    let time_limit = r.read_i32()?;
    let restriction_tag = r.read_i32()?;
    let input = r.read_string()?;

    let restriction = match restriction_tag {
        0 => Restriction::Strict,
        1 => Restriction::Loose,
        other => {
            return Err(AllKorrectError::ProtocolError(format!(
                "unknown restriction tier {other}"
            )))
        }
    };

    // Registered before any permission is actually changed, so that
    // whichever of the steps below fails first still rolls back every
    // blob touched up to that point — invariant 1 holds on every exit
    // path, not just the ones past the last fallible step.
    let pending_restore: Rc<RefCell<Vec<PathBuf>>> = Rc::new(RefCell::new(Vec::new()));
    let pending_restore_for_guard = Rc::clone(&pending_restore);
    let _restore = ScopeGuard::new(move || {
        for path in pending_restore_for_guard.borrow().iter() {
            if let Err(e) = fs::restore(path) {
                log::error!("failed to restore blob permission for {}: {e}", path.display());
            }
        }
    });

    let has_input = !input.is_empty();
    let input_path = if has_input {
        fs::check_name(&input)?;
        if !namespace.has_blob(&input)? {
            return Err(AllKorrectError::NotFound(namespace.blob_path(&input)));
        }
        let path = namespace.blob_path(&input);
        fs::set_read_only(&path)?;
        pending_restore.borrow_mut().push(path.clone());
        path
    } else {
        PathBuf::from("/dev/null")
    };

    let output_name = fs::rand_string();
    let error_name = fs::rand_string();
    let output_path = namespace.new_blob(&output_name)?;
    let error_path = namespace.new_blob(&error_name)?;
    fs::set_write_only(&output_path)?;
    pending_restore.borrow_mut().push(output_path.clone());
    fs::set_write_only(&error_path)?;
    pending_restore.borrow_mut().push(error_path.clone());

    log::info!("EXEC {cmd} {args:?}");

    let req = ExecRequest {
        command: PathBuf::from(&cmd),
        args,
        cwd: tmp_dir.to_path_buf(),
        input_file: input_path,
        output_file: output_path,
        error_file: error_path,
        limits: Limits {
            memory: non_negative(memory_limit),
            output: non_negative(output_limit),
            time_ms: non_negative(time_limit as i64),
        },
        restriction,
    };

    let result = exec::execute(&req)?;

    let mut w = ByteWriter::new();
    w.write_i32(result.exit_status);
    w.write_i32(result.verdict as i32);
    w.write_string(&output_name);
    w.write_string(&error_name);
    w.write_i64(result.memory as i64);
    w.write_i32(result.time_ms as i32);
    Ok(Frame::with_body(MessageType::EXEC_REPLY, w.into_bytes()))
}

fn non_negative(v: i64) -> Option<u64> {
    if v >= 0 {
        Some(v as u64)
    } else {
        None
    }
}

fn handle_put_blob(body: &[u8], namespace: &Namespace) -> Result<Frame> {
    let mut r = ByteReader::new(body);
    let name = r.read_string()?;
    let len = r.read_i32()?;
    if len < 0 {
        return Err(AllKorrectError::ProtocolError("negative blob length".into()));
    }
    let bytes = r.read_exact_bytes(len as usize)?;
    log::info!("PUT_BLOB {name}");
    namespace.put_blob(&name, bytes)?;
    Ok(Frame::empty(MessageType::OK))
}

fn handle_get_blob(body: &[u8], namespace: &Namespace) -> Result<Frame> {
    let mut r = ByteReader::new(body);
    let name = r.read_string()?;
    log::info!("GET_BLOB {name}");
    if !namespace.has_blob(&name)? {
        return Err(AllKorrectError::NotFound(namespace.blob_path(&name)));
    }
    let bytes = namespace.get_blob(&name)?;
    Ok(Frame::with_body(MessageType::GET_BLOB_REPLY, bytes))
}

fn handle_has_blob(body: &[u8], namespace: &Namespace) -> Result<Frame> {
    let mut r = ByteReader::new(body);
    let name = r.read_string()?;
    log::info!("HAS_BLOB {name}");
    let present = namespace.has_blob(&name)?;
    let mut w = ByteWriter::new();
    w.write_i32(present as i32);
    Ok(Frame::with_body(MessageType::HAS_BLOB_REPLY, w.into_bytes()))
}

fn handle_has_file(body: &[u8], namespace: &Namespace, tmp_dir: &Path) -> Result<Frame> {
    let mut r = ByteReader::new(body);
    let name = r.read_string()?;
    log::info!("HAS_FILE {name}");
    fs::check_name(&name)?;
    let present = namespace.has_file(&tmp_dir.join(&name))?;
    let mut w = ByteWriter::new();
    w.write_i32(present as i32);
    Ok(Frame::with_body(MessageType::HAS_FILE_REPLY, w.into_bytes()))
}

fn resolve(class: Class, namespace: &Namespace, tmp_dir: &Path, name: &str) -> Result<PathBuf> {
    fs::check_name(name)?;
    Ok(match class {
        Class::Blob => namespace.blob_path(name),
        Class::File => tmp_dir.join(name),
    })
}

fn handle_transfer(
    op: Op,
    from_class: Class,
    to_class: Class,
    body: &[u8],
    namespace: &Namespace,
    tmp_dir: &Path,
) -> Result<Frame> {
    let mut r = ByteReader::new(body);
    let old_name = r.read_string()?;
    let new_name = r.read_string()?;
    let from = resolve(from_class, namespace, tmp_dir, &old_name)?;
    let to = resolve(to_class, namespace, tmp_dir, &new_name)?;
    fs::transfer(op, &from, &to, to_class)?;
    Ok(Frame::empty(MessageType::OK))
}
