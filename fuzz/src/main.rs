//! AFL fuzz target for the frame codec.
//!
//! Reads test cases from standard input and feeds them to
//! [`pjrmi::frame::codec::FrameCodec::decode`] in a loop compatible with
//! AFL's persistent mode, draining every complete frame the buffer yields
//! before refilling. The decoder never panics by contract (malformed
//! input is a `FrameError`, not a crash); this target exists to catch
//! violations of that contract, same role as the teacher's
//! `parse_transaction` fuzz target for its own fixed-header frame.
unsafe extern "C" {
    fn __AFL_LOOP(cnt: u32) -> i32;
}
use std::io::{self, Read};

use bytes::BytesMut;
use pjrmi::frame::HEADER_LEN;
use pjrmi::frame::codec::FrameCodec;
use tokio_util::codec::Decoder;

const MAX_PAYLOAD: u32 = 4096;
const MAX_CASE_LEN: u64 = (HEADER_LEN + MAX_PAYLOAD as usize) as u64;

fn main() {
    let mut data = Vec::with_capacity(MAX_CASE_LEN as usize);
    loop {
        if unsafe { __AFL_LOOP(1000) } == 0 {
            break;
        }
        data.clear();
        if io::stdin().take(MAX_CASE_LEN).read_to_end(&mut data).is_err() {
            return;
        }

        let mut codec = FrameCodec::with_max_payload(MAX_PAYLOAD);
        let mut buf = BytesMut::from(&data[..]);
        // Panic on a codec bug so AFL can detect the crash; a malformed
        // frame is an `Err`, not a panic, and is simply dropped.
        while let Ok(Some(_frame)) = codec.decode(&mut buf) {}
    }
}
