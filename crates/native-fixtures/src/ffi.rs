//! Generic create/invoke/drop glue shared by every fixture service.
//!
//! Mirrors `crates/bindings/src/service.rs`'s `create`/`invoke`/`drop`
//! generics, rebased onto `abi::RawChannel` in place of the deleted
//! `bindings::Channel`.

use std::sync::Once;

static LOGGING: Once = Once::new();

/// Install a process-global `tracing` subscriber exactly once, writing to
/// stderr. This is this process's own diagnostic output, independent of any
/// particular channel's log pipe -- each channel's `log_dest_fd` is a
/// separate, per-instance pipe the host forwards on its own (see
/// `log_startup_line` below), not a destination for process-wide `tracing`
/// events.
fn init_logging() {
    LOGGING.call_once(|| {
        use tracing_subscriber::prelude::*;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(env_filter))
            .try_init();
    });
}

/// Write one startup line directly to this channel's log pipe, matching
/// `bindings::service::create`'s behavior of announcing itself on the pipe
/// the host is forwarding. `ops::decode::Decoder` maps unstructured lines
/// like this one into a `Log` same as a structured one. Best-effort: a full
/// pipe or a closed read-end is not fatal to channel creation.
fn log_startup_line(log_dest_fd: i32, prefix: &str) {
    if log_dest_fd < 0 {
        return;
    }
    let line = format!("{prefix} service created\n");
    // SAFETY: `log_dest_fd` is a valid, open fd for the duration of this
    // call. We do not take ownership of it -- `drop_channel` closes it.
    unsafe {
        libc::write(log_dest_fd, line.as_ptr() as *const libc::c_void, line.len());
    }
}

/// Create a channel fronting a fresh `S`, per the `<svc>_create` ABI.
pub fn create<S: cgo::Service>(log_level: i32, log_dest_fd: i32) -> *mut abi::RawChannel {
    init_logging();
    log_startup_line(log_dest_fd, std::any::type_name::<S>());
    let _ = log_level;

    let svc = Box::new(S::create());
    let svc_impl = Box::into_raw(svc) as *mut abi::ServiceImpl;

    let mut arena: Vec<u8> = Vec::new();
    let mut out: Vec<abi::Out> = Vec::new();
    let mut err: Vec<u8> = Vec::new();

    let channel = Box::new(abi::RawChannel {
        svc_impl,
        arena_ptr: arena.as_mut_ptr(),
        arena_len: arena.len(),
        arena_cap: arena.capacity(),
        out_ptr: out.as_mut_ptr(),
        out_len: out.len(),
        out_cap: out.capacity(),
        err_ptr: err.as_mut_ptr(),
        err_len: err.len(),
        err_cap: err.capacity(),
        log_dest_fd,
    });
    std::mem::forget(arena);
    std::mem::forget(out);
    std::mem::forget(err);

    Box::into_raw(channel)
}

/// A single logical input frame: a service code paired with borrowed data.
pub struct Frame<'a> {
    pub code: u32,
    pub data: &'a [u8],
}

/// Drive `svc` through `frames` in order, appending to the channel's arena
/// and out array without clearing them first -- the host is responsible for
/// zeroing `arena_len`/`out_len` once at the start of a poll, so that several
/// vectorized invocations (stride 16, then 4, then 1) accumulate into a
/// single combined result. A no-op if the channel already carries an error.
///
/// # Safety
/// `ch` must be a live pointer returned by [`create`] for the same `S`.
pub unsafe fn invoke<S: cgo::Service>(ch: *mut abi::RawChannel, frames: &[Frame]) {
    let channel = &mut *ch;
    if channel.err_cap != 0 {
        return;
    }

    let svc = &mut *(channel.svc_impl as *mut S);
    let mut arena = Vec::from_raw_parts(channel.arena_ptr, channel.arena_len, channel.arena_cap);
    let mut out = Vec::from_raw_parts(channel.out_ptr, channel.out_len, channel.out_cap);

    let mut failure: Option<String> = None;
    for frame in frames {
        if let Err(err) = svc.invoke(frame.code, frame.data, &mut arena, &mut out) {
            failure = Some(err.to_string());
            break;
        }
    }

    channel.arena_ptr = arena.as_mut_ptr();
    channel.arena_len = arena.len();
    channel.arena_cap = arena.capacity();
    std::mem::forget(arena);

    channel.out_ptr = out.as_mut_ptr();
    channel.out_len = out.len();
    channel.out_cap = out.capacity();
    std::mem::forget(out);

    if let Some(message) = failure {
        let mut err_buf = message.into_bytes();
        channel.err_ptr = err_buf.as_mut_ptr();
        channel.err_len = err_buf.len();
        channel.err_cap = err_buf.capacity();
        std::mem::forget(err_buf);
    }
}

/// Tear down a channel and its service, per the `<svc>_drop` ABI.
///
/// # Safety
/// `ch` must be a live pointer returned by [`create`] for the same `S`, not
/// previously passed to `drop_channel`.
pub unsafe fn drop_channel<S: cgo::Service>(ch: *mut abi::RawChannel) {
    let channel = Box::from_raw(ch);
    drop(Box::from_raw(channel.svc_impl as *mut S));
    drop(Vec::from_raw_parts(
        channel.arena_ptr,
        channel.arena_len,
        channel.arena_cap,
    ));
    drop(Vec::from_raw_parts(
        channel.out_ptr,
        channel.out_len,
        channel.out_cap,
    ));
    drop(Vec::from_raw_parts(
        channel.err_ptr,
        channel.err_len,
        channel.err_cap,
    ));
    if channel.log_dest_fd >= 0 {
        // Closing our end of the log pipe is what lets the host's log
        // forwarder for this channel observe EOF.
        libc::close(channel.log_dest_fd);
    }
}

/// Extract `(code, data)` pairs out of an `In1`.
///
/// # Safety
/// `i.data_ptr`/`i.data_len` must describe a valid, live slice (or be empty).
pub unsafe fn frame_of(i: &abi::In1) -> Frame<'_> {
    let data = if i.data_len == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(i.data_ptr, i.data_len as usize)
    };
    Frame { code: i.code, data }
}
