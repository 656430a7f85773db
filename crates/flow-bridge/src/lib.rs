//! Host-side implementation of the channel/service/trampoline/task-service
//! FFI bridge: the Rust side of a boundary whose other side is a dynamically
//! loaded native library speaking the ABI declared in [`abi`].
//!
//! - [`channel`]: the raw vtable and vectorized-invocation dispatch.
//! - [`service`]: queuing, pinning buffer, and the borrowed [`service::Output`].
//! - [`trampoline`]: inverted-control-flow async task dispatch.
//! - [`task_service`]: long-running native processes served over gRPC.
//! - [`logging`]: forwarding a service's log pipe to a handler.
//! - [`util`]: small shared helpers (pipes, socket paths).
//! - [`handshakes`]: the build/combine/derive/extract op-code protocols.

pub mod channel;
pub mod handshakes;
pub mod logging;
pub mod service;
pub mod task_service;
pub mod trampoline;
pub mod util;

pub use channel::{Channel, ServiceVTable};
pub use service::Service;
pub use task_service::TaskService;
pub use trampoline::TrampolineServer;
