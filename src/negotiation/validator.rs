use crate::serialization::one_at_a_time;
use bytes::Bytes;

/// One compatibility check performed during negotiation.
///
/// The authorizing side sends [`challenge`](Validator::challenge); the other
/// side checks it with [`validate_challenge`](Validator::validate_challenge)
/// and replies with [`answer`](Validator::answer), which the authorizer
/// checks with [`validate_answer`](Validator::validate_answer). Both peers
/// must run the same validators in the same order.
///
/// Validators are stateless; the same instance may serve many sessions.
pub trait Validator: Send + Sync {
    fn challenge(&self) -> Bytes;

    fn answer(&self) -> Bytes;

    fn validate_challenge(&self, challenge: &[u8]) -> bool;

    fn validate_answer(&self, answer: &[u8]) -> bool;
}

/// Checks that both peers agreed on the same code word.
///
/// The challenge is the hash of the word and the answer the hash of the
/// word reversed, so echoing the challenge back fails.
#[derive(Debug, Clone)]
pub struct NameValidator {
    challenge: Bytes,
    answer: Bytes,
}

impl NameValidator {
    pub fn new(code_word: &str) -> Self {
        let reversed: String = code_word.chars().rev().collect();
        Self {
            challenge: Bytes::copy_from_slice(&one_at_a_time(code_word.as_bytes()).to_le_bytes()),
            answer: Bytes::copy_from_slice(&one_at_a_time(reversed.as_bytes()).to_le_bytes()),
        }
    }
}

impl Validator for NameValidator {
    fn challenge(&self) -> Bytes {
        self.challenge.clone()
    }

    fn answer(&self) -> Bytes {
        self.answer.clone()
    }

    fn validate_challenge(&self, challenge: &[u8]) -> bool {
        challenge == &self.challenge[..]
    }

    fn validate_answer(&self, answer: &[u8]) -> bool {
        answer == &self.answer[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_word_agrees() {
        let left = NameValidator::new("peerlink");
        let right = NameValidator::new("peerlink");
        assert!(right.validate_challenge(&left.challenge()));
        assert!(left.validate_answer(&right.answer()));
    }

    #[test]
    fn test_echo_is_not_an_answer() {
        let validator = NameValidator::new("peerlink");
        assert!(!validator.validate_answer(&validator.challenge()));
    }

    #[test]
    fn test_different_words_disagree() {
        let left = NameValidator::new("alpha");
        let right = NameValidator::new("beta");
        assert!(!right.validate_challenge(&left.challenge()));
        assert!(!left.validate_answer(&right.answer()));
    }
}
