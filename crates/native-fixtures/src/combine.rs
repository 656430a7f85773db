//! Fixture service standing in for the native combine Service: reduces and
//! combines keyed JSON documents, then drains them as
//! `(document, key, fields)` triples followed by a trailing stats frame.
//! Grounded on `crates/derive/src/combine_api.rs`'s `Code` and drain shape
//! (including its `test_combine_api` assertion that drain output is
//! triples-plus-one, which resolved the distilled spec's open question
//! about whether a trailing stats frame is emitted).

use abi::{In1, In16, In4, Out, RawChannel};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ffi::{self, frame_of};

pub mod code {
    pub const CONFIGURE: u32 = 0;
    pub const REDUCE_LEFT: u32 = 1;
    pub const COMBINE_RIGHT: u32 = 2;
    pub const DRAIN: u32 = 3;

    pub const DRAINED_REDUCED_DOCUMENT: u32 = 10;
    pub const DRAINED_COMBINED_DOCUMENT: u32 = 11;
    pub const DRAINED_KEY: u32 = 12;
    pub const DRAINED_FIELDS: u32 = 13;
    pub const DRAINED_STATS: u32 = 14;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("combine fixture used before CONFIGURE")]
    NotConfigured,
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized op code {0}")]
    UnknownCode(u32),
}

#[derive(serde::Deserialize)]
struct Configure {
    key_ptr: Vec<String>,
    field_ptrs: Vec<String>,
}

struct Entry {
    doc: Value,
    reduced: bool,
}

#[derive(Default)]
pub struct Combine {
    config: Option<Configure>,
    entries: BTreeMap<String, Entry>,
}

impl Combine {
    fn key_of(&self, doc: &Value) -> String {
        let config = self.config.as_ref().expect("configured");
        let parts: Vec<String> = config
            .key_ptr
            .iter()
            .map(|ptr| doc.pointer(ptr).cloned().unwrap_or(Value::Null).to_string())
            .collect();
        parts.join("\u{1e}")
    }

    fn merge(left: &mut Value, right: Value) {
        let (Value::Object(left), Value::Object(right)) = (left, right) else {
            return;
        };
        for (k, rv) in right {
            match (left.get_mut(&k), &rv) {
                (Some(Value::Array(lv)), Value::Array(rv_arr)) => {
                    lv.extend(rv_arr.iter().cloned());
                }
                _ => {
                    left.insert(k, rv);
                }
            }
        }
    }

    fn reduce(&mut self, doc: Value, is_left: bool) {
        let key = self.key_of(&doc);
        match self.entries.get_mut(&key) {
            Some(entry) => {
                Self::merge(&mut entry.doc, doc);
                entry.reduced |= is_left;
            }
            None => {
                self.entries.insert(
                    key,
                    Entry {
                        doc,
                        reduced: is_left,
                    },
                );
            }
        }
    }

    fn drain(&mut self, arena: &mut Vec<u8>, out: &mut Vec<Out>) {
        let config = self.config.as_ref().expect("configured");
        let mut stats = serde_json::Map::new();
        let mut left_count = 0u64;
        let mut right_count = 0u64;

        for (_, entry) in std::mem::take(&mut self.entries) {
            let doc_code = if entry.reduced {
                left_count += 1;
                code::DRAINED_REDUCED_DOCUMENT
            } else {
                right_count += 1;
                code::DRAINED_COMBINED_DOCUMENT
            };

            let key_fields: Vec<Value> = config
                .key_ptr
                .iter()
                .map(|ptr| entry.doc.pointer(ptr).cloned().unwrap_or(Value::Null))
                .collect();
            let projected_fields: Vec<Value> = config
                .field_ptrs
                .iter()
                .map(|ptr| entry.doc.pointer(ptr).cloned().unwrap_or(Value::Null))
                .collect();

            let begin = arena.len();
            arena.extend(entry.doc.to_string().into_bytes());
            cgo::send_bytes(doc_code, begin, arena, out);

            let begin = arena.len();
            arena.extend(Value::Array(key_fields).to_string().into_bytes());
            cgo::send_bytes(code::DRAINED_KEY, begin, arena, out);

            let begin = arena.len();
            arena.extend(Value::Array(projected_fields).to_string().into_bytes());
            cgo::send_bytes(code::DRAINED_FIELDS, begin, arena, out);
        }

        stats.insert("left".into(), left_count.into());
        stats.insert("right".into(), right_count.into());
        let begin = arena.len();
        arena.extend(Value::Object(stats).to_string().into_bytes());
        cgo::send_bytes(code::DRAINED_STATS, begin, arena, out);
    }
}

impl cgo::Service for Combine {
    type Error = Error;

    fn create() -> Self {
        Self::default()
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
                self.config = Some(serde_json::from_slice(data)?);
                self.entries.clear();
            }
            code::REDUCE_LEFT => {
                if self.config.is_none() {
                    return Err(Error::NotConfigured);
                }
                self.reduce(serde_json::from_slice(data)?, true);
            }
            code::COMBINE_RIGHT => {
                if self.config.is_none() {
                    return Err(Error::NotConfigured);
                }
                self.reduce(serde_json::from_slice(data)?, false);
            }
            code::DRAIN => {
                if self.config.is_none() {
                    return Err(Error::NotConfigured);
                }
                self.drain(arena, out);
            }
            other => return Err(Error::UnknownCode(other)),
        }
        Ok(())
    }
}

/// # Safety
/// `log_dest_fd` must be a valid fd owned exclusively by the callee, or -1.
#[no_mangle]
pub unsafe extern "C" fn combine_create(log_level: i32, log_dest_fd: i32) -> *mut RawChannel {
    ffi::create::<Combine>(log_level, log_dest_fd)
}

/// # Safety
/// `ch` must be a live channel created by [`combine_create`].
#[no_mangle]
pub unsafe extern "C" fn combine_invoke1(ch: *mut RawChannel, i: In1) {
    ffi::invoke::<Combine>(ch, &[frame_of(&i)]);
}

/// # Safety
/// `ch` must be a live channel created by [`combine_create`].
#[no_mangle]
pub unsafe extern "C" fn combine_invoke4(ch: *mut RawChannel, i: In4) {
    ffi::invoke::<Combine>(
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
/// `ch` must be a live channel created by [`combine_create`].
#[no_mangle]
pub unsafe extern "C" fn combine_invoke16(ch: *mut RawChannel, i: In16) {
    ffi::invoke::<Combine>(
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
/// `ch` must be a live channel created by [`combine_create`], not previously
/// dropped.
#[no_mangle]
pub unsafe extern "C" fn combine_drop(ch: *mut RawChannel) {
    ffi::drop_channel::<Combine>(ch);
}

#[cfg(test)]
mod test {
    use super::*;
    use cgo::Service as _;
    use serde_json::json;

    #[test]
    fn test_combine_fixture_drains_triples_and_trailing_stats() {
        let mut svc = Combine::create();
        let mut arena = Vec::new();
        let mut out = Vec::new();

        let configure = json!({"key_ptr": ["/i"], "field_ptrs": ["/s/1", "/i"]});
        cgo::Service::invoke(
            &mut svc,
            code::CONFIGURE,
            configure.to_string().as_bytes(),
            &mut arena,
            &mut out,
        )
        .unwrap();

        for (op, doc) in [
            (code::REDUCE_LEFT, json!({"i": 42, "s": ["two"]})),
            (code::COMBINE_RIGHT, json!({"i": 32, "s": ["one"]})),
            (code::COMBINE_RIGHT, json!({"i": 42, "s": ["three"]})),
            (code::COMBINE_RIGHT, json!({"i": 32, "s": ["four"]})),
        ] {
            cgo::Service::invoke(&mut svc, op, doc.to_string().as_bytes(), &mut arena, &mut out)
                .unwrap();
        }

        cgo::Service::invoke(&mut svc, code::DRAIN, &[], &mut arena, &mut out).unwrap();

        assert_eq!((out.len() - 1) % 3, 0, "drain emits triples plus trailing stats");
        assert_eq!(out.last().unwrap().code, code::DRAINED_STATS);

        let doc_at = |i: &Out| -> Value {
            serde_json::from_slice(&arena[i.begin as usize..i.end as usize]).unwrap()
        };

        let docs: Vec<Value> = out[0..6].iter().step_by(3).map(doc_at).collect();
        assert_eq!(docs.len(), 2);
        assert!(docs.contains(&json!({"i": 32, "s": ["one", "four"]})));
        assert!(docs.contains(&json!({"i": 42, "s": ["two", "three"]})));
    }
}
