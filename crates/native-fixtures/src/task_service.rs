//! Fixture native task service: a tiny tonic `Echo` gRPC server bound to a
//! Unix domain socket, plus a log pipe the host reads structured JSON log
//! lines from. Grounded on `crates/bindings/src/task_service.rs`'s
//! create/drop ABI and on `examples/hyperium-tonic`'s UDS server pattern.

use abi::{RawTaskService, TaskServiceImpl};
use std::os::unix::io::FromRawFd;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status};

pub mod echo {
    tonic::include_proto!("fixtures.echo");
}

pub mod config {
    include!(concat!(env!("OUT_DIR"), "/flow_bridge.task_service.rs"));
}

use echo::echo_server::{Echo, EchoServer};
use echo::{EchoRequest, EchoResponse};

#[derive(Default)]
struct EchoImpl;

#[tonic::async_trait]
impl Echo for EchoImpl {
    async fn ping(&self, req: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        Ok(Response::new(EchoResponse {
            message: req.into_inner().message,
        }))
    }
}

/// A running fixture task service: an owned background thread serving the
/// `Echo` service over `uds_path`, torn down on drop.
pub struct FixtureTaskService {
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
    // Declared last so it drops last: graceful RPC shutdown must complete
    // before the log pipe write-end closes, matching the drop ordering the
    // host-side TaskService::drop relies on. Never read, only held for its
    // Drop side effect (closing the fd).
    #[allow(dead_code)]
    log_file: Option<std::fs::File>,
}

impl FixtureTaskService {
    fn start(config: config::Config) -> anyhow::Result<Self> {
        let _ = std::fs::remove_file(&config.uds_path);
        let listener = std::os::unix::net::UnixListener::bind(&config.uds_path)?;
        listener.set_nonblocking(true)?;

        let log_file = if config.log_file_fd >= 0 {
            // SAFETY: the host handed us exclusive ownership of this fd.
            let mut file = unsafe { std::fs::File::from_raw_fd(config.log_file_fd) };
            use std::io::Write;
            let _ = writeln!(
                file,
                r#"{{"ts":"1970-01-01T00:00:00Z","level":"info","message":"task service started"}}"#
            );
            Some(file)
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let thread = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("fixture runtime");
            rt.block_on(async move {
                let listener = UnixListener::from_std(listener).expect("adopt std listener");
                let incoming = UnixListenerStream::new(listener);
                let server = tonic::transport::Server::builder()
                    .add_service(EchoServer::new(EchoImpl))
                    .serve_with_incoming_shutdown(incoming, async {
                        let _ = shutdown_rx.await;
                    });
                let _ = server.await;
            });
        });

        Ok(Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
            log_file,
        })
    }
}

impl Drop for FixtureTaskService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// # Safety
/// `config_ptr`/`config_len` must describe a valid, live byte slice encoding
/// a `prost`-serialized [`config::Config`].
#[no_mangle]
pub unsafe extern "C" fn fixture_task_service_create(
    config_ptr: *const u8,
    config_len: u32,
) -> *mut RawTaskService {
    let config_bytes = std::slice::from_raw_parts(config_ptr, config_len as usize);

    let result: anyhow::Result<FixtureTaskService> = (|| {
        let config = <config::Config as prost::Message>::decode(config_bytes)?;
        FixtureTaskService::start(config)
    })();

    match result {
        Ok(svc) => {
            let svc_impl = Box::into_raw(Box::new(svc)) as *mut TaskServiceImpl;
            Box::into_raw(Box::new(RawTaskService {
                svc_impl,
                err_ptr: std::ptr::null_mut(),
                err_len: 0,
                err_cap: 0,
            }))
        }
        Err(err) => {
            let mut message = err.to_string().into_bytes();
            let raw = Box::into_raw(Box::new(RawTaskService {
                svc_impl: std::ptr::null_mut(),
                err_ptr: message.as_mut_ptr(),
                err_len: message.len(),
                err_cap: message.capacity(),
            }));
            std::mem::forget(message);
            raw
        }
    }
}

/// # Safety
/// `handle` must be a live pointer returned by [`fixture_task_service_create`].
#[no_mangle]
pub unsafe extern "C" fn fixture_task_service_drop(handle: *mut RawTaskService) {
    let handle = Box::from_raw(handle);
    if !handle.svc_impl.is_null() {
        drop(Box::from_raw(handle.svc_impl as *mut FixtureTaskService));
    }
    if handle.err_cap != 0 {
        drop(Vec::from_raw_parts(
            handle.err_ptr,
            handle.err_len,
            handle.err_cap,
        ));
    }
}
