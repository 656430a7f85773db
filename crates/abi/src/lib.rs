//! Shared repr(C) types crossing the host/native boundary.
//!
//! Mirrors the layouts independently declared on each side of the boundary
//! in the source system (Go on the host side, Rust via `cgo::Out` on the
//! native side) -- both sides must agree on layout, but neither depends on
//! the other's crate.

use std::ffi::c_void;

/// Output frame written by the native side into the channel's `out` array.
/// `[begin, end)` indexes into the channel's arena. Re-exported from `cgo`
/// rather than redeclared, since native service implementations build
/// these directly via `cgo::send_bytes`/`cgo::send_code`.
pub use cgo::Out;

/// A single input frame: a service-defined code paired with a borrowed,
/// host-owned byte slice. The referenced memory must remain valid and
/// unchanged until the next invocation returns.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct In1 {
    pub data_ptr: *const u8,
    pub data_len: u32,
    pub code: u32,
}

/// Four input frames, passed by value to amortize FFI call overhead.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct In4 {
    pub in0: In1,
    pub in1: In1,
    pub in2: In1,
    pub in3: In1,
}

/// Sixteen input frames, passed by value.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct In16 {
    pub in0: In4,
    pub in1: In4,
    pub in2: In4,
    pub in3: In4,
}

impl In1 {
    pub const EMPTY: In1 = In1 {
        data_ptr: std::ptr::null(),
        data_len: 0,
        code: 0,
    };
}

impl In4 {
    pub const EMPTY: In4 = In4 {
        in0: In1::EMPTY,
        in1: In1::EMPTY,
        in2: In1::EMPTY,
        in3: In1::EMPTY,
    };
}

impl In16 {
    pub const EMPTY: In16 = In16 {
        in0: In4::EMPTY,
        in1: In4::EMPTY,
        in2: In4::EMPTY,
        in3: In4::EMPTY,
    };
}

/// Opaque native-side service instance. The host never dereferences this --
/// it's an opaque pointer threaded back through every invocation.
#[repr(C)]
pub struct ServiceImpl {
    _private: [u8; 0],
}

/// The channel control block, shared across the FFI boundary.
///
/// Pointers and capacities may be changed by the native side on every
/// invocation (the arena and out array may be reallocated); the host must
/// re-read them after every call and must never retain a borrow across an
/// invocation boundary.
#[repr(C)]
pub struct RawChannel {
    pub svc_impl: *mut ServiceImpl,

    pub arena_ptr: *mut u8,
    pub arena_len: usize,
    pub arena_cap: usize,

    pub out_ptr: *mut Out,
    pub out_len: usize,
    pub out_cap: usize,

    pub err_ptr: *mut u8,
    pub err_len: usize,
    pub err_cap: usize,

    /// Raw fd of the log pipe write-end, duplicated in so native logging
    /// code can find it; purely informational to the native side.
    pub log_dest_fd: i32,
}

/// Signature shared by every `<svc>_create` FFI entry point.
pub type CreateFn = unsafe extern "C" fn(log_level: i32, log_dest_fd: i32) -> *mut RawChannel;
/// Signature shared by every `<svc>_invoke1` FFI entry point.
pub type Invoke1Fn = unsafe extern "C" fn(*mut RawChannel, In1);
/// Signature shared by every `<svc>_invoke4` FFI entry point.
pub type Invoke4Fn = unsafe extern "C" fn(*mut RawChannel, In4);
/// Signature shared by every `<svc>_invoke16` FFI entry point.
pub type Invoke16Fn = unsafe extern "C" fn(*mut RawChannel, In16);
/// Signature shared by every `<svc>_drop` FFI entry point.
pub type DropFn = unsafe extern "C" fn(*mut RawChannel);

/// Opaque native-side task-service instance.
#[repr(C)]
pub struct TaskServiceImpl {
    _private: [u8; 0],
}

/// Control block returned by a task service's native constructor: either a
/// live service pointer, or a non-empty `err` describing why construction
/// failed. Never both.
#[repr(C)]
pub struct RawTaskService {
    pub svc_impl: *mut TaskServiceImpl,
    pub err_ptr: *mut u8,
    pub err_len: usize,
    pub err_cap: usize,
}

/// Signature shared by every `<svc>_task_service_create` FFI entry point.
/// `config_ptr`/`config_len` reference an encoded `TaskServiceConfig`.
pub type TaskServiceCreateFn =
    unsafe extern "C" fn(config_ptr: *const u8, config_len: u32) -> *mut RawTaskService;
/// Signature shared by every `<svc>_task_service_drop` FFI entry point.
pub type TaskServiceDropFn = unsafe extern "C" fn(*mut RawTaskService);

/// Marker type used only to give `*mut c_void` a name at call sites that
/// accept either kind of opaque native handle.
pub type OpaquePtr = *mut c_void;
