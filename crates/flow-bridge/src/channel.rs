//! The raw FFI surface: a `ServiceVTable` of five function pointers matching
//! the `<svc>_create/_invoke1/_invoke4/_invoke16/_drop` ABI (see crate docs),
//! a `ServiceLibrary` that resolves that vtable out of a dynamically loaded
//! native library, and `Channel`, the thin wrapper around a live
//! `abi::RawChannel*` that knows how to dispatch a batch of frames in
//! descending strides of 16, 4 and 1.
//!
//! `Channel` itself does not own a pinning buffer or an input queue -- that
//! bookkeeping belongs to [`crate::service::Service`], which is the type
//! most callers use. `Channel` only owns the unsafe edge: turning raw
//! pointers into `abi::In16`/`In4`/`In1` values and calling across the FFI
//! boundary.

use std::ffi::OsStr;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("loading native library {0:?}")]
    Load(std::path::PathBuf, #[source] libloading::Error),
    #[error("resolving symbol {0:?}")]
    Symbol(String, #[source] libloading::Error),
}

/// Five raw function pointers a native library exposes for one service
/// prefix (e.g. `upper_case`, `combine`, `derive`).
#[derive(Clone, Copy)]
pub struct ServiceVTable {
    pub create: abi::CreateFn,
    pub invoke1: abi::Invoke1Fn,
    pub invoke4: abi::Invoke4Fn,
    pub invoke16: abi::Invoke16Fn,
    pub drop: abi::DropFn,
}

impl ServiceVTable {
    /// Build a vtable directly from function pointers, e.g. `extern "C"`
    /// functions compiled into the same binary (the in-process fixture
    /// path exercised by most of this crate's tests).
    pub fn new(
        create: abi::CreateFn,
        invoke1: abi::Invoke1Fn,
        invoke4: abi::Invoke4Fn,
        invoke16: abi::Invoke16Fn,
        drop: abi::DropFn,
    ) -> Self {
        Self {
            create,
            invoke1,
            invoke4,
            invoke16,
            drop,
        }
    }
}

/// An open native library plus a `ServiceVTable` resolved from it by symbol
/// name. Kept alive for as long as any `Channel` built from its vtable is in
/// use -- dropping the library while a channel is live would dangle the
/// vtable's function pointers.
pub struct ServiceLibrary {
    // Held only for its `Drop` side effect (unloading); never called through
    // directly, since `vtable` already holds the resolved symbols.
    #[allow(dead_code)]
    library: libloading::Library,
    pub vtable: ServiceVTable,
}

impl ServiceLibrary {
    /// Load `path` and resolve `<prefix>_create`, `<prefix>_invoke1`,
    /// `<prefix>_invoke4`, `<prefix>_invoke16` and `<prefix>_drop` out of it.
    ///
    /// # Safety
    /// `path` must name a library implementing the five-function ABI for
    /// `prefix` with the exact signatures in [`abi`]. Loading arbitrary
    /// native code is inherently unsafe: a mismatched signature is
    /// undefined behavior, not a catchable error.
    pub unsafe fn open(path: &Path, prefix: &str) -> Result<Self, Error> {
        let library = libloading::Library::new(path)
            .map_err(|err| Error::Load(path.to_path_buf(), err))?;

        macro_rules! resolve {
            ($name:expr, $ty:ty) => {{
                let symbol = format!("{prefix}_{}", $name);
                *library
                    .get::<$ty>(os_str(&symbol).as_encoded_bytes())
                    .map_err(|err| Error::Symbol(symbol.clone(), err))?
            }};
        }

        let vtable = ServiceVTable {
            create: resolve!("create", abi::CreateFn),
            invoke1: resolve!("invoke1", abi::Invoke1Fn),
            invoke4: resolve!("invoke4", abi::Invoke4Fn),
            invoke16: resolve!("invoke16", abi::Invoke16Fn),
            drop: resolve!("drop", abi::DropFn),
        };

        Ok(Self { library, vtable })
    }
}

fn os_str(s: &str) -> &OsStr {
    OsStr::new(s)
}

/// A live native channel: the raw pointer returned by `<svc>_create`, paired
/// with the vtable used to drive it. Dropping a `Channel` without calling
/// [`Channel::destroy`] leaks the native-side state -- `Service` always
/// calls `destroy` explicitly so the leak/use-after-destroy tradeoff is
/// made once, in one place.
pub struct Channel {
    raw: *mut abi::RawChannel,
    vtable: ServiceVTable,
}

/// One already-pinned input frame, ready to be handed across the FFI
/// boundary. Constructing this from a byte slice is the unsafe edge: the
/// pointer must stay valid until the owning `invoke_batch` call returns.
#[derive(Clone, Copy)]
pub struct PendingInput {
    pub code: u32,
    pub data_ptr: *const u8,
    pub data_len: u32,
}

impl PendingInput {
    fn as_in1(&self) -> abi::In1 {
        abi::In1 {
            data_ptr: self.data_ptr,
            data_len: self.data_len,
            code: self.code,
        }
    }
}

const STRIDES: [usize; 3] = [16, 4, 1];

impl Channel {
    /// Create a channel fronting a fresh native service instance.
    ///
    /// # Safety
    /// `vtable` must describe a service ABI matching `abi`'s layouts.
    pub unsafe fn create(vtable: ServiceVTable, log_level: i32, log_dest_fd: i32) -> Self {
        let raw = (vtable.create)(log_level, log_dest_fd);
        Self { raw, vtable }
    }

    /// Zero the channel's `arena_len`/`out_len` ahead of a fresh invocation.
    /// The native side is expected to append starting from these resets
    /// points; capacities and pointers are untouched (and may still be
    /// reallocated by the native side during the call).
    ///
    /// # Safety
    /// `self` must not have been destroyed.
    unsafe fn reset_lengths(&mut self) {
        let ch = &mut *self.raw;
        ch.arena_len = 0;
        ch.out_len = 0;
    }

    /// Drive `frames` through the native side in descending strides of 16,
    /// 4 and 1, amortizing FFI call overhead while preserving stride-1
    /// equivalence: frames are always presented to the native side in
    /// enqueue order, and padding frames (`abi::In1::EMPTY`, `code: 0,
    /// data_len: 0`) within a partially-filled stride are no-ops recognized
    /// by every fixture/native service in this corpus.
    ///
    /// # Safety
    /// Every `frame.data_ptr`/`data_len` in `frames` must describe a valid,
    /// live slice (or be the null/zero-length sentinel) for the duration of
    /// this call. `self` must not have been destroyed.
    pub unsafe fn invoke_batch(&mut self, frames: &[PendingInput]) {
        self.reset_lengths();

        let mut offset = 0;
        for &stride in &STRIDES {
            while offset + stride <= frames.len() {
                self.invoke_stride(stride, &frames[offset..offset + stride]);
                offset += stride;
            }
        }
        debug_assert_eq!(offset, frames.len());
    }

    unsafe fn invoke_stride(&mut self, stride: usize, frames: &[PendingInput]) {
        match stride {
            16 => {
                let in16 = pack_in16(frames);
                (self.vtable.invoke16)(self.raw, in16);
            }
            4 => {
                let in4 = pack_in4(frames);
                (self.vtable.invoke4)(self.raw, in4);
            }
            1 => {
                (self.vtable.invoke1)(self.raw, frames[0].as_in1());
            }
            _ => unreachable!("strides are fixed to 16/4/1"),
        }
    }

    /// Borrow the channel's current arena, output descriptors and error
    /// buffer. Valid only until the next `invoke_batch` or `destroy`.
    ///
    /// # Safety
    /// `self` must not have been destroyed.
    pub unsafe fn view(&self) -> RawView<'_> {
        let ch = &*self.raw;
        RawView {
            arena: std::slice::from_raw_parts(ch.arena_ptr.cast_const(), ch.arena_len),
            out: std::slice::from_raw_parts(ch.out_ptr.cast_const(), ch.out_len),
            err: if ch.err_len == 0 {
                None
            } else {
                Some(std::slice::from_raw_parts(ch.err_ptr.cast_const(), ch.err_len))
            },
        }
    }

    /// Tear down the native-side state. Consumes `self`, which the borrow
    /// checker uses to ensure no `RawView` from [`Channel::view`] outlives
    /// destruction -- `view`'s borrow of `&self` cannot overlap a move.
    pub fn destroy(self) {
        unsafe { (self.vtable.drop)(self.raw) }
    }
}

/// Borrowed snapshot of a channel's arena/out/err immediately after a batch
/// of invocations. Borrows `Channel`, so it cannot outlive the next
/// `invoke_batch` (which needs `&mut Channel`) or `destroy` (which needs
/// owned `Channel`) -- the arena-borrow-ends-on-next-invocation invariant is
/// therefore enforced by the Rust borrow checker rather than by caller
/// discipline.
pub struct RawView<'a> {
    pub arena: &'a [u8],
    pub out: &'a [abi::Out],
    pub err: Option<&'a [u8]>,
}

fn pack_in4(frames: &[PendingInput]) -> abi::In4 {
    abi::In4 {
        in0: frames[0].as_in1(),
        in1: frames[1].as_in1(),
        in2: frames[2].as_in1(),
        in3: frames[3].as_in1(),
    }
}

fn pack_in16(frames: &[PendingInput]) -> abi::In16 {
    abi::In16 {
        in0: pack_in4(&frames[0..4]),
        in1: pack_in4(&frames[4..8]),
        in2: pack_in4(&frames[8..12]),
        in3: pack_in4(&frames[12..16]),
    }
}
