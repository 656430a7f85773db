//! Fixture service standing in for the native library's simplest possible
//! Service: it upper-cases its input and, on the magic payload `"whoops"`,
//! raises a channel error. Grounded on `crates/bindings/src/upper_case.rs`.

use crate::ffi::{self, frame_of};
use abi::{In1, In16, In4, Out, RawChannel};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Whoops(String),
}

/// Running total of bytes processed, echoed back as the output code so
/// callers can assert codes increase monotonically across a vectorized
/// batch (see scenario S1).
#[derive(Default)]
pub struct UpperCase {
    sum_length: u32,
}

impl cgo::Service for UpperCase {
    type Error = Error;

    fn create() -> Self {
        Self::default()
    }

    fn invoke(
        &mut self,
        _code: u32,
        data: &[u8],
        arena: &mut Vec<u8>,
        out: &mut Vec<Out>,
    ) -> Result<(), Self::Error> {
        if data == b"whoops" {
            return Err(Error::Whoops("whoops".to_string()));
        }

        self.sum_length += data.len() as u32;

        let begin = arena.len();
        arena.extend(data.iter().map(u8::to_ascii_uppercase));
        cgo::send_bytes(self.sum_length, begin, arena, out);

        Ok(())
    }
}

/// # Safety
/// `log_dest_fd` must be a valid fd owned exclusively by the callee, or -1.
#[no_mangle]
pub unsafe extern "C" fn upper_case_create(log_level: i32, log_dest_fd: i32) -> *mut RawChannel {
    ffi::create::<UpperCase>(log_level, log_dest_fd)
}

/// # Safety
/// `ch` must be a live channel created by [`upper_case_create`].
#[no_mangle]
pub unsafe extern "C" fn upper_case_invoke1(ch: *mut RawChannel, i: In1) {
    ffi::invoke::<UpperCase>(ch, &[frame_of(&i)]);
}

/// # Safety
/// `ch` must be a live channel created by [`upper_case_create`].
#[no_mangle]
pub unsafe extern "C" fn upper_case_invoke4(ch: *mut RawChannel, i: In4) {
    ffi::invoke::<UpperCase>(
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
/// `ch` must be a live channel created by [`upper_case_create`].
#[no_mangle]
pub unsafe extern "C" fn upper_case_invoke16(ch: *mut RawChannel, i: In16) {
    ffi::invoke::<UpperCase>(
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
/// `ch` must be a live channel created by [`upper_case_create`], not
/// previously dropped.
#[no_mangle]
pub unsafe extern "C" fn upper_case_drop(ch: *mut RawChannel) {
    ffi::drop_channel::<UpperCase>(ch);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_upper_case_fixture_directly() {
        let mut svc = <UpperCase as cgo::Service>::create();
        let mut arena = Vec::new();
        let mut out = Vec::new();

        cgo::Service::invoke(&mut svc, 0, b"hello", &mut arena, &mut out).unwrap();
        cgo::Service::invoke(&mut svc, 0, b"world", &mut arena, &mut out).unwrap();

        assert_eq!(&arena[..], b"HELLOWORLD");
        assert_eq!(out[0].code, 5);
        assert_eq!(out[1].code, 10);

        let err = cgo::Service::invoke(&mut svc, 0, b"whoops", &mut arena, &mut out).unwrap_err();
        assert_eq!(err.to_string(), "whoops");
    }
}
