//! The host-side `Service`: owns one [`Channel`], a queue of pending input
//! frames, and the pinning buffer those frames reference. `poll` drains the
//! queue across the FFI boundary and exposes the resulting arena/out view
//! with a lifetime tied to `&self` -- see [`Output`].

use crate::channel::{Channel, PendingInput, ServiceVTable};
use crate::logging::LogForwarder;
use crate::util::pipe_cloexec;
use prost::Message;
use std::os::unix::io::FromRawFd;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The native side reported a fatal error for the batch. The output
    /// produced alongside it (if any) is not meaningful.
    #[error("{0}")]
    Channel(String),
    #[error("failed to create log pipe")]
    LogPipe(#[source] std::io::Error),
}

/// One input frame queued for the next `poll`. Its `data_ptr`/`data_len`
/// either reference the caller's own memory (`enqueue_bytes`) or a slice of
/// this service's pinning buffer (`enqueue_message`).
type Queued = PendingInput;

/// Host-side byte arena backing `enqueue_message` calls. Growth allocates a
/// fresh buffer rather than reallocating in place, so pointers handed out
/// for prior messages in the same batch stay valid -- see
/// [`Service::enqueue_message`].
#[derive(Default)]
struct PinBuffer {
    current: Vec<u8>,
    retired: Vec<Vec<u8>>,
}

impl PinBuffer {
    /// Write `data` into the buffer, growing (never reallocating in place)
    /// if there isn't room, and return a pointer/length pinned until the
    /// next [`PinBuffer::reset`].
    fn write(&mut self, data: &[u8]) -> (*const u8, u32) {
        if self.current.capacity() - self.current.len() < data.len() {
            let new_cap = (self.current.capacity() * 2).max(data.len()).max(64);
            let old = std::mem::replace(&mut self.current, Vec::with_capacity(new_cap));
            self.retired.push(old);
        }
        let begin = self.current.len();
        self.current.extend_from_slice(data);
        // SAFETY: `begin + data.len() <= current.len()`, so this stays
        // within the just-extended allocation.
        let ptr = unsafe { self.current.as_ptr().add(begin) };
        (ptr, data.len() as u32)
    }

    /// Release every buffer pinned by frames consumed by the last `poll`.
    fn reset(&mut self) {
        self.current.clear();
        self.retired.clear();
    }
}

/// The channel plus its log forwarder, torn down together by `destroy`.
/// Split out from `Service` so `Drop` can `Option::take` it without
/// fighting the borrow checker over partial moves.
struct Inner {
    channel: Channel,
    log_forwarder: LogForwarder,
}

/// A host-side wrapper around one native [`Channel`]: queues frames,
/// dispatches them in vectorized strides, and forwards the native side's
/// log pipe to a [`LogForwarder`].
pub struct Service {
    inner: Option<Inner>,
    pending: Vec<Queued>,
    pin_buf: PinBuffer,
}

impl Service {
    /// Create a service fronting a fresh native instance, wiring up a log
    /// pipe whose write-end is handed to the native constructor and whose
    /// read-end is drained by a background forwarder.
    ///
    /// # Safety
    /// `vtable` must describe a service ABI matching [`abi`]'s layouts.
    pub unsafe fn create(
        vtable: ServiceVTable,
        log_level: i32,
        log_handler: impl Fn(ops::Log) + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        let (read_fd, write_fd) = pipe_cloexec().map_err(Error::LogPipe)?;

        // The native side takes ownership of `write_fd` for the lifetime of
        // the channel; only it closes this descriptor (see `create`'s ABI
        // contract in SPEC_FULL.md §4.1 "Log pipe").
        let channel = Channel::create(vtable, log_level, write_fd);
        let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let log_forwarder = LogForwarder::spawn(read_file, log_handler);

        Ok(Self {
            inner: Some(Inner {
                channel,
                log_forwarder,
            }),
            pending: Vec::new(),
            pin_buf: PinBuffer::default(),
        })
    }

    /// Queue an input frame referencing host-owned memory. No I/O occurs;
    /// the frame is only dispatched on the next [`Service::poll`].
    ///
    /// # Safety
    /// `data` must remain valid and unmodified until the next `poll`
    /// returns -- the FFI boundary gives the compiler no way to enforce
    /// this, so it is the caller's documented obligation, exactly as for
    /// [`crate::channel::Channel::invoke_batch`].
    pub unsafe fn enqueue_bytes(&mut self, code: u32, data: &[u8]) {
        self.pending.push(PendingInput {
            code,
            data_ptr: data.as_ptr(),
            data_len: data.len() as u32,
        });
    }

    /// Serialize `msg` into this service's pinning buffer and enqueue a
    /// frame referencing the written slice. Safe: the pinning buffer is
    /// owned by `self` and outlives the frame until the next `poll`.
    pub fn enqueue_message<M: Message>(&mut self, code: u32, msg: &M) {
        let mut data = Vec::new();
        msg.encode_raw(&mut data);
        let (ptr, len) = self.pin_buf.write(&data);
        self.pending.push(PendingInput {
            code,
            data_ptr: ptr,
            data_len: len,
        });
    }

    /// Copy `data` into this service's pinning buffer and enqueue a frame
    /// referencing it -- for payloads already serialized (e.g. a
    /// trampoline reply's pre-framed body) rather than encoded fresh from
    /// a `prost::Message`.
    pub fn enqueue_owned_bytes(&mut self, code: u32, data: &[u8]) {
        let (ptr, len) = self.pin_buf.write(data);
        self.pending.push(PendingInput {
            code,
            data_ptr: ptr,
            data_len: len,
        });
    }

    /// Dispatch every queued frame to the native side in descending strides
    /// of 16, 4 and 1, then return a borrowed [`Output`] view of the
    /// resulting arena and output descriptors (or the channel error, if
    /// any). The input queue and pinning buffer are reset regardless of
    /// outcome.
    pub fn poll(&mut self) -> Result<Output<'_>, Error> {
        let frames = std::mem::take(&mut self.pending);
        let inner = self.inner.as_mut().expect("Service used after destroy()");

        // SAFETY: every queued frame's data pointer is guaranteed live by
        // its enqueuer (documented invariant of `enqueue_bytes`, or backed
        // by `self.pin_buf`, which we do not reset until after this call).
        unsafe { inner.channel.invoke_batch(&frames) };
        self.pin_buf.reset();

        // SAFETY: the channel was not destroyed -- `self.inner` is `Some`.
        let view = unsafe { inner.channel.view() };

        if let Some(err) = view.err {
            return Err(Error::Channel(String::from_utf8_lossy(err).into_owned()));
        }

        Ok(Output {
            arena: view.arena,
            out: view.out,
        })
    }

    /// Tear down the native-side state and join the log forwarder. Once
    /// called, any [`Output`] borrowed from a prior `poll` is gone --
    /// enforced by the borrow checker, since `poll` and `destroy` cannot
    /// both hold a live borrow of `self` at once.
    pub fn destroy(mut self) {
        let inner = self.inner.take().expect("Service destroyed twice");
        inner.channel.destroy();
        inner.log_forwarder.join_blocking();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        // `destroy()` consumes `self`, so this only fires if a caller
        // dropped a `Service` without calling it -- a programmer error we
        // still tear down best-effort rather than leaking the native side.
        if let Some(inner) = self.inner.take() {
            tracing::error!("Service dropped without calling destroy()");
            inner.channel.destroy();
            inner.log_forwarder.join_blocking();
        }
    }
}

/// Borrowed arena + output descriptors produced by one [`Service::poll`].
/// Valid only until the next `poll` or `destroy`, which the Rust borrow
/// checker enforces by tying this type's lifetime to `&Service`.
#[derive(Debug)]
pub struct Output<'a> {
    pub arena: &'a [u8],
    pub out: &'a [abi::Out],
}

impl<'a> Output<'a> {
    /// The bytes an output descriptor refers to.
    pub fn bytes(&self, frame: &abi::Out) -> &'a [u8] {
        &self.arena[frame.begin as usize..frame.end as usize]
    }
}
