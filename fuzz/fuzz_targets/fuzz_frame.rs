#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use peerlink::core::codec::FrameCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary stream bytes must decode to frames or an error, never panic
    let mut codec = FrameCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
