//! Fixture service standing in for a native Service that offloads work to
//! the host via `cgo::Trampoline`, mirroring how `crates/build/src/api.rs`'s
//! `Fetcher`/`Connectors` issue trampoline tasks. Used to exercise the
//! host-side trampoline server's correlation (S4) and cancellation (S5)
//! behavior end-to-end.

use abi::{In1, In16, In4, Out, RawChannel};
use std::cell::RefCell;
use std::rc::Rc;

use crate::ffi::{self, frame_of};

pub mod code {
    /// Start a new trampolined task; payload is the task's label/body.
    pub const START: u32 = 0;
    /// Drain pending starts into TRAMPOLINE frames and collect resolutions.
    pub const POLL: u32 = 1;
    /// Resolve a previously-started task: `task_id:u64le || ok:u8 || body`.
    pub const RESOLVE: u32 = 2;

    /// An outbound trampoline task request: `task_id:u64le || task_code:u32le || payload`.
    pub const TRAMPOLINE: u32 = 100;
    /// No tasks are queued or outstanding.
    pub const DONE: u32 = 101;
    /// A previously-started task resolved successfully.
    pub const ECHO_OK: u32 = 102;
    /// A previously-started task resolved with an error.
    pub const ECHO_ERR: u32 = 103;

    /// The task_code every dispatched task carries; this fixture only has one kind.
    pub const TASK_CODE: u32 = 1;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {}

type Outcome = (Vec<u8>, Result<Vec<u8>, String>);

#[derive(Clone)]
pub struct Trampoline {
    inner: Rc<cgo::Trampoline>,
    results: Rc<RefCell<Vec<Outcome>>>,
}

impl cgo::Service for Trampoline {
    type Error = Error;

    fn create() -> Self {
        Self {
            inner: Rc::new(cgo::Trampoline::new()),
            results: Default::default(),
        }
    }

    fn invoke(
        &mut self,
        op_code: u32,
        data: &[u8],
        arena: &mut Vec<u8>,
        out: &mut Vec<Out>,
    ) -> Result<(), Self::Error> {
        match op_code {
            code::START => {
                let label = data.to_vec();
                let payload = data.to_vec();
                let results = self.results.clone();

                self.inner.start_task(
                    code::TASK_CODE,
                    move |buf| buf.extend_from_slice(&payload),
                    move |result: Result<&[u8], anyhow::Error>| {
                        results.borrow_mut().push((
                            label,
                            result.map(|b| b.to_vec()).map_err(|e| e.to_string()),
                        ));
                    },
                );
            }
            code::RESOLVE => {
                self.inner.resolve_task(data);
            }
            code::POLL => {
                self.inner.dispatch_tasks(code::TRAMPOLINE, arena, out);

                for (label, result) in self.results.borrow_mut().drain(..) {
                    let (out_code, body) = match result {
                        Ok(body) => (code::ECHO_OK, body),
                        Err(message) => (code::ECHO_ERR, message.into_bytes()),
                    };
                    let payload = serde_json::json!({
                        "label": String::from_utf8_lossy(&label),
                        "body": String::from_utf8_lossy(&body),
                    })
                    .to_string();

                    let begin = arena.len();
                    arena.extend(payload.into_bytes());
                    cgo::send_bytes(out_code, begin, arena, out);
                }

                if self.inner.is_empty() {
                    cgo::send_code(code::DONE, out);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// # Safety
/// `log_dest_fd` must be a valid fd owned exclusively by the callee, or -1.
#[no_mangle]
pub unsafe extern "C" fn trampoline_create(log_level: i32, log_dest_fd: i32) -> *mut RawChannel {
    ffi::create::<Trampoline>(log_level, log_dest_fd)
}

/// # Safety
/// `ch` must be a live channel created by [`trampoline_create`].
#[no_mangle]
pub unsafe extern "C" fn trampoline_invoke1(ch: *mut RawChannel, i: In1) {
    ffi::invoke::<Trampoline>(ch, &[frame_of(&i)]);
}

/// # Safety
/// `ch` must be a live channel created by [`trampoline_create`].
#[no_mangle]
pub unsafe extern "C" fn trampoline_invoke4(ch: *mut RawChannel, i: In4) {
    ffi::invoke::<Trampoline>(
        ch,
        &[
            frame_of(&i.in0),
            frame_of(&i.in1),
            frame_of(&i.in2),
            frame_of(&i.in3),
        ],
    );
}

/// # Safety
/// `ch` must be a live channel created by [`trampoline_create`].
#[no_mangle]
pub unsafe extern "C" fn trampoline_invoke16(ch: *mut RawChannel, i: In16) {
    ffi::invoke::<Trampoline>(
        ch,
        &[
            frame_of(&i.in0.in0),
            frame_of(&i.in0.in1),
            frame_of(&i.in0.in2),
            frame_of(&i.in0.in3),
            frame_of(&i.in1.in0),
            frame_of(&i.in1.in1),
            frame_of(&i.in1.in2),
            frame_of(&i.in1.in3),
            frame_of(&i.in2.in0),
            frame_of(&i.in2.in1),
            frame_of(&i.in2.in2),
            frame_of(&i.in2.in3),
            frame_of(&i.in3.in0),
            frame_of(&i.in3.in1),
            frame_of(&i.in3.in2),
            frame_of(&i.in3.in3),
        ],
    );
}

/// # Safety
/// `ch` must be a live channel created by [`trampoline_create`], not
/// previously dropped.
#[no_mangle]
pub unsafe extern "C" fn trampoline_drop(ch: *mut RawChannel) {
    ffi::drop_channel::<Trampoline>(ch);
}
