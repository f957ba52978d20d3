#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use peerlink::negotiation::NegotiationMessage;

fuzz_target!(|data: &[u8]| {
    let message = Bytes::copy_from_slice(data);
    if let Some(decoded) = NegotiationMessage::decode(&message) {
        // Everything but a reasonless Abort re-encodes to the same bytes
        let encoded = decoded.encode();
        assert_eq!(encoded[0], message[0]);
    }
});
