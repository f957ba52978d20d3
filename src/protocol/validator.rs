use crate::negotiation::Validator;
use bytes::Bytes;

/// Checks that both peers built the same protocol.
///
/// The challenge is the protocol fingerprint, the answer is the fingerprint
/// reversed. Any difference in message set, ids or type shapes fails the
/// challenge.
#[derive(Debug, Clone)]
pub struct ProtocolValidator {
    fingerprint: Bytes,
    reversed: Bytes,
}

impl ProtocolValidator {
    pub fn new(fingerprint: Bytes) -> Self {
        let mut reversed = fingerprint.to_vec();
        reversed.reverse();
        Self {
            fingerprint,
            reversed: Bytes::from(reversed),
        }
    }
}

impl Validator for ProtocolValidator {
    fn challenge(&self) -> Bytes {
        self.fingerprint.clone()
    }

    fn answer(&self) -> Bytes {
        self.reversed.clone()
    }

    fn validate_challenge(&self, challenge: &[u8]) -> bool {
        challenge == self.fingerprint.as_ref()
    }

    fn validate_answer(&self, answer: &[u8]) -> bool {
        answer == self.reversed.as_ref()
    }
}
