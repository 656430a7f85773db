//! In-process stand-ins for the native library the host's FFI bridge talks
//! to. Each module exports the same five-function `<svc>_*` ABI a real
//! native library would, so the host-side bridge can be exercised -- either
//! by wiring these `extern "C"` functions directly (tests), or by loading
//! this crate's own `cdylib` artifact through `libloading` (production
//! path, exercised by `flow_bridge`'s dylib integration test).

pub mod combine;
pub mod derive;
pub mod ffi;
pub mod task_service;
pub mod trampoline;
pub mod uppercase;
