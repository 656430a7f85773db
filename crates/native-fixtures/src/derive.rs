//! Fixture service standing in for the native derive Service: a transaction
//! lifecycle over a JSON register, offloading some documents to the host
//! via `cgo::Trampoline` exactly like `crates/derive/src/derive_api.rs`'s
//! lambda invocation. Op codes match
//! `flow_bridge::handshakes::derive::code` -- host and fixture must agree
//! on the wire protocol since this is a two-way handshake, not a
//! request/response one.

use abi::{In1, In16, In4, Out, RawChannel};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::ffi::{self, frame_of};

pub mod code {
    pub const CONFIGURE: u32 = 0;
    pub const BEGIN_TRANSACTION: u32 = 1;
    pub const ADD_DOCUMENT: u32 = 2;
    pub const FLUSH_TRANSACTION: u32 = 3;
    pub const PREPARE_TO_COMMIT: u32 = 4;
    pub const RESTORE_CHECKPOINT: u32 = 5;
    pub const CLEAR_REGISTERS: u32 = 6;

    pub const TRAMPOLINE_INVOKE: u32 = 20;
    pub const FLUSHED_TRANSACTION: u32 = 21;

    pub const INVOKE_LAMBDA: u32 = 0;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("derive fixture used before CONFIGURE")]
    NotConfigured,
    #[error("malformed JSON document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized op code {0}")]
    UnknownCode(u32),
}

pub struct Derive {
    configured: bool,
    flushing: bool,
    register: Rc<RefCell<BTreeMap<String, Value>>>,
    last_checkpoint: Vec<u8>,
    trampoline: cgo::Trampoline,
}

impl Derive {
    fn add_document(
        &mut self,
        data: &[u8],
        arena: &mut Vec<u8>,
        out: &mut Vec<Out>,
    ) -> Result<(), Error> {
        if !self.configured {
            return Err(Error::NotConfigured);
        }
        let doc: Value = serde_json::from_slice(data)?;
        let key = doc["key"].as_str().unwrap_or_default().to_string();
        let value = doc["value"].clone();

        if doc["lambda"].as_bool().unwrap_or(false) {
            let register = self.register.clone();
            let payload = value.to_string().into_bytes();
            self.trampoline.start_task(
                code::INVOKE_LAMBDA,
                move |buf| buf.extend_from_slice(&payload),
                move |result: Result<&[u8], anyhow::Error>| {
                    let resolved = match result {
                        Ok(body) => Value::String(String::from_utf8_lossy(body).to_string()),
                        Err(err) => Value::String(format!("error: {err}")),
                    };
                    register.borrow_mut().insert(key, resolved);
                },
            );
            self.trampoline.dispatch_tasks(code::TRAMPOLINE_INVOKE, arena, out);
        } else {
            self.register.borrow_mut().insert(key, value);
        }
        Ok(())
    }

    fn maybe_flush_sentinel(&mut self, out: &mut Vec<Out>) {
        if self.flushing && self.trampoline.is_empty() {
            cgo::send_code(code::FLUSHED_TRANSACTION, out);
        }
    }
}

impl cgo::Service for Derive {
    type Error = Error;

    fn create() -> Self {
        Self {
            configured: false,
            flushing: false,
            register: Default::default(),
            last_checkpoint: Vec::new(),
            trampoline: cgo::Trampoline::new(),
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
            code::CONFIGURE => {
                self.configured = true;
            }
            code::BEGIN_TRANSACTION => {
                if !self.configured {
                    return Err(Error::NotConfigured);
                }
                self.flushing = false;
            }
            code::ADD_DOCUMENT => self.add_document(data, arena, out)?,
            code::FLUSH_TRANSACTION => {
                self.flushing = true;
                self.maybe_flush_sentinel(out);
            }
            code::TRAMPOLINE_INVOKE => {
                self.trampoline.resolve_task(data);
                self.maybe_flush_sentinel(out);
            }
            code::PREPARE_TO_COMMIT => {
                let checkpoint = Value::Object(
                    self.register
                        .borrow()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
                .to_string()
                .into_bytes();
                self.last_checkpoint = checkpoint.clone();

                let begin = arena.len();
                arena.extend(checkpoint);
                cgo::send_bytes(code::PREPARE_TO_COMMIT, begin, arena, out);
            }
            code::RESTORE_CHECKPOINT => {
                if !self.last_checkpoint.is_empty() {
                    if let Ok(Value::Object(map)) =
                        serde_json::from_slice::<Value>(&self.last_checkpoint)
                    {
                        *self.register.borrow_mut() = map.into_iter().collect();
                    }
                }
                let begin = arena.len();
                arena.extend(self.last_checkpoint.clone());
                cgo::send_bytes(code::RESTORE_CHECKPOINT, begin, arena, out);
            }
            code::CLEAR_REGISTERS => {
                self.register.borrow_mut().clear();
            }
            other => return Err(Error::UnknownCode(other)),
        }
        Ok(())
    }
}

/// # Safety
/// `log_dest_fd` must be a valid fd owned exclusively by the callee, or -1.
#[no_mangle]
pub unsafe extern "C" fn derive_create(log_level: i32, log_dest_fd: i32) -> *mut RawChannel {
    ffi::create::<Derive>(log_level, log_dest_fd)
}

/// # Safety
/// `ch` must be a live channel created by [`derive_create`].
#[no_mangle]
pub unsafe extern "C" fn derive_invoke1(ch: *mut RawChannel, i: In1) {
    ffi::invoke::<Derive>(ch, &[frame_of(&i)]);
}

/// # Safety
/// `ch` must be a live channel created by [`derive_create`].
#[no_mangle]
pub unsafe extern "C" fn derive_invoke4(ch: *mut RawChannel, i: In4) {
    ffi::invoke::<Derive>(
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
/// `ch` must be a live channel created by [`derive_create`].
#[no_mangle]
pub unsafe extern "C" fn derive_invoke16(ch: *mut RawChannel, i: In16) {
    ffi::invoke::<Derive>(
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
/// `ch` must be a live channel created by [`derive_create`], not previously
/// dropped.
#[no_mangle]
pub unsafe extern "C" fn derive_drop(ch: *mut RawChannel) {
    ffi::drop_channel::<Derive>(ch);
}

#[cfg(test)]
mod test {
    use super::*;
    use cgo::Service as _;

    #[test]
    fn test_derive_fixture_lambda_round_trip() {
        let mut svc = Derive::create();
        let mut arena = Vec::new();
        let mut out = Vec::new();

        svc.invoke(code::CONFIGURE, &[], &mut arena, &mut out).unwrap();
        svc.invoke(code::BEGIN_TRANSACTION, &[], &mut arena, &mut out).unwrap();

        let doc = serde_json::json!({"key": "a", "lambda": true, "value": "hi"});
        svc.invoke(code::ADD_DOCUMENT, doc.to_string().as_bytes(), &mut arena, &mut out)
            .unwrap();
        assert_eq!(out.last().unwrap().code, code::TRAMPOLINE_INVOKE);

        // Resolve the dispatched task directly, as the host would after
        // running its lambda handler: task_id:u64le || ok:u8 || body.
        let dispatched = &arena[out.last().unwrap().begin as usize..out.last().unwrap().end as usize];
        let task_id = u64::from_le_bytes(dispatched[0..8].try_into().unwrap());
        let mut reply = task_id.to_le_bytes().to_vec();
        reply.push(1);
        reply.extend_from_slice(b"HI");
        svc.invoke(code::TRAMPOLINE_INVOKE, &reply, &mut arena, &mut out).unwrap();

        svc.invoke(code::FLUSH_TRANSACTION, &[], &mut arena, &mut out).unwrap();
        assert_eq!(out.last().unwrap().code, code::FLUSHED_TRANSACTION);

        svc.invoke(code::PREPARE_TO_COMMIT, &[], &mut arena, &mut out).unwrap();
        let frame = out.last().unwrap();
        let checkpoint: Value =
            serde_json::from_slice(&arena[frame.begin as usize..frame.end as usize]).unwrap();
        assert_eq!(checkpoint["a"], "HI");
    }
}
