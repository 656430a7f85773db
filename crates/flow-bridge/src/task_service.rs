//! `TaskService`: a host-side handle to a long-running native process that
//! serves gRPC over a local Unix socket, with a log pipe multiplexed the
//! same way as [`crate::service::Service`]'s.
//!
//! Shutdown is strictly ordered (SPEC_FULL.md §4.3): close the gRPC
//! connection, then invoke the native drop (which gracefully finishes
//! in-flight RPCs and closes the log pipe write-end), then join the log
//! forwarder on EOF, then best-effort unlink the socket file. Reversing any
//! pair risks either a stalled shutdown or a forwarder that blocks forever
//! because the write-end is still open.

use crate::logging::LogForwarder;
use crate::util::{pipe_cloexec, socket_path};
use prost::Message;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::sync::Once;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/flow_bridge.task_service.rs"));
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("native task-service constructor failed: {0}")]
    Native(String),
    #[error("dialing gRPC over {0:?}")]
    Dial(PathBuf, #[source] tonic::transport::Error),
    #[error("failed to create log pipe")]
    LogPipe(#[source] std::io::Error),
}

/// Message-size limits applied by [`TaskService::create`]'s caller to the
/// client stub it builds over [`TaskService::conn`] -- `tonic`'s generated
/// clients accept these as builder methods (`max_decoding_message_size`,
/// `max_encoding_message_size`); this crate has no generated stub of its
/// own to apply them to.
#[derive(Clone, Copy, Debug)]
pub struct MessageSizeLimits {
    pub max_receive: u32,
    pub max_send: u32,
}

impl Default for MessageSizeLimits {
    fn default() -> Self {
        Self {
            max_receive: 64 * 1024 * 1024,
            max_send: 64 * 1024 * 1024,
        }
    }
}

static IGNORE_SIGPIPE: Once = Once::new();

/// Ignore `SIGPIPE` process-wide, idempotently. The native process's
/// HTTP/2 library closes transports immediately on graceful shutdown;
/// receiving `SIGPIPE` while the host is still reading from those
/// transports would otherwise terminate the host.
fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// A running native task service and its gRPC connection.
pub struct TaskService {
    native: *mut abi::TaskServiceImpl,
    drop_fn: abi::TaskServiceDropFn,
    conn: Option<Channel>,
    log_forwarder: Option<LogForwarder>,
    socket_path: PathBuf,
    pub limits: MessageSizeLimits,
}

// SAFETY: `native` is an opaque handle the native side promises is safe to
// move between threads (it is never dereferenced by us, only passed back
// to `drop_fn`); `TaskService` otherwise contains only `Send` types.
unsafe impl Send for TaskService {}

impl TaskService {
    /// Launch a native task service.
    ///
    /// `create_fn` is the native `<svc>_task_service_create` export;
    /// `drop_fn` is its matching `_drop`. `socket_dir` is where a socket
    /// path is derived if `explicit_socket_path` is `None`.
    ///
    /// # Safety
    /// `create_fn`/`drop_fn` must be a matching pair implementing the
    /// `abi::TaskServiceCreateFn`/`DropFn` ABI.
    pub async unsafe fn create(
        create_fn: abi::TaskServiceCreateFn,
        drop_fn: abi::TaskServiceDropFn,
        task_name: &str,
        socket_dir: &std::path::Path,
        explicit_socket_path: Option<PathBuf>,
        limits: MessageSizeLimits,
        log_handler: impl Fn(ops::Log) + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        ignore_sigpipe();

        let socket_path = explicit_socket_path.unwrap_or_else(|| socket_path(socket_dir, task_name));
        let _ = std::fs::remove_file(&socket_path);

        let (read_fd, write_fd) = pipe_cloexec().map_err(Error::LogPipe)?;

        let config = proto::Config {
            task_name: task_name.to_string(),
            uds_path: socket_path.to_string_lossy().into_owned(),
            log_file_fd: write_fd,
            max_receive_message_size: limits.max_receive,
            max_send_message_size: limits.max_send,
        };
        let mut config_bytes = Vec::new();
        config.encode(&mut config_bytes).expect("Config always encodes");

        let raw = unsafe { create_fn(config_bytes.as_ptr(), config_bytes.len() as u32) };
        // SAFETY: `raw` is a live `RawTaskService*` per the ABI contract.
        let handle = unsafe { &*raw };

        if handle.err_cap != 0 {
            // SAFETY: a non-zero `err_cap` means `err_ptr`/`err_len` are a
            // valid, native-owned UTF-8 buffer we must not reuse further.
            let message = unsafe {
                String::from_utf8_lossy(std::slice::from_raw_parts(
                    handle.err_ptr,
                    handle.err_len,
                ))
                .into_owned()
            };
            // SAFETY: `raw` was never handed to anything else; we own its
            // teardown on this error path.
            unsafe { free_raw_task_service(raw) };
            // The native side never ran, so it never closed `write_fd`;
            // close our local descriptors directly.
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(Error::Native(message));
        }
        let native = handle.svc_impl;
        unsafe { free_raw_task_service_box_only(raw) };

        // SAFETY: the native side owns `write_fd` from here on; `read_fd`
        // is ours.
        let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let log_forwarder = LogForwarder::spawn(read_file, log_handler);

        let dial_path = socket_path.clone();
        let conn = Endpoint::try_from("http://[::]:50051")
            .expect("static placeholder URI always parses")
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = dial_path.clone();
                async move {
                    tokio::net::UnixStream::connect(path)
                        .await
                        .map(hyper_util::rt::TokioIo::new)
                }
            }))
            .await
            .map_err(|err| Error::Dial(socket_path.clone(), err))?;

        Ok(Self {
            native,
            drop_fn,
            conn: Some(conn),
            log_forwarder: Some(log_forwarder),
            socket_path,
            limits,
        })
    }

    /// The gRPC connection to the native process, for use with a
    /// generated client stub.
    pub fn conn(&self) -> &Channel {
        self.conn.as_ref().expect("TaskService already dropped")
    }
}

impl Drop for TaskService {
    fn drop(&mut self) {
        // 1. Close the gRPC connection.
        self.conn.take();

        // 2. Invoke the native drop: graceful shutdown, then close the log
        //    pipe write-end.
        // SAFETY: `self.native` was returned by `create_fn` and has not
        // been passed to `drop_fn` before.
        unsafe { (self.drop_fn)(task_service_handle(self.native)) };

        // 3. Block on the log-forwarder's EOF, which only fires once the
        //    native side has closed the write-end (step 2).
        if let Some(forwarder) = self.log_forwarder.take() {
            forwarder.join_blocking();
        }

        // 4. Best-effort unlink the socket file.
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// `<svc>_task_service_drop` expects a `*mut RawTaskService`, but we only
/// keep the inner `svc_impl` pointer alive past construction (the
/// `RawTaskService` wrapper itself was consumed at `create` time). Rebuild
/// a minimal `RawTaskService` purely to hand the native side its own
/// pointer back in the shape its drop function expects.
fn task_service_handle(native: *mut abi::TaskServiceImpl) -> *mut abi::RawTaskService {
    Box::into_raw(Box::new(abi::RawTaskService {
        svc_impl: native,
        err_ptr: std::ptr::null_mut(),
        err_len: 0,
        err_cap: 0,
    }))
}

/// Free a failed `RawTaskService`'s error buffer and the box itself.
///
/// # Safety
/// `raw` must be a live pointer from `create_fn`, not previously freed.
unsafe fn free_raw_task_service(raw: *mut abi::RawTaskService) {
    let handle = Box::from_raw(raw);
    if handle.err_cap != 0 {
        drop(Vec::from_raw_parts(
            handle.err_ptr,
            handle.err_len,
            handle.err_cap,
        ));
    }
}

/// Free only the `RawTaskService` box on the success path, without
/// touching `svc_impl` (which the caller keeps) or the (empty) error
/// buffer.
///
/// # Safety
/// `raw` must be a live pointer from `create_fn`, not previously freed.
unsafe fn free_raw_task_service_box_only(raw: *mut abi::RawTaskService) {
    drop(Box::from_raw(raw));
}
