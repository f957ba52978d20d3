use crate::error::ValidationFailure;
use bytes::{BufMut, Bytes, BytesMut};

/// First byte of every negotiation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NegotiationTag {
    Abort = 0,
    Success = 1,
    Challenge = 2,
    Answer = 3,
}

/// One handshake message.
///
/// ```text
/// Abort:     [0] [reason]
/// Success:   [1]
/// Challenge: [2] [payload...]
/// Answer:    [3] [payload...]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationMessage {
    Abort(ValidationFailure),
    Success,
    Challenge(Bytes),
    Answer(Bytes),
}

impl NegotiationMessage {
    pub fn tag(&self) -> NegotiationTag {
        match self {
            Self::Abort(_) => NegotiationTag::Abort,
            Self::Success => NegotiationTag::Success,
            Self::Challenge(_) => NegotiationTag::Challenge,
            Self::Answer(_) => NegotiationTag::Answer,
        }
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = match self {
            Self::Challenge(payload) | Self::Answer(payload) => payload.len(),
            Self::Abort(_) => 1,
            Self::Success => 0,
        };
        let mut buf = BytesMut::with_capacity(1 + payload_len);
        buf.put_u8(self.tag() as u8);
        match self {
            Self::Abort(reason) => buf.put_u8(reason.as_byte()),
            Self::Challenge(payload) | Self::Answer(payload) => buf.extend_from_slice(payload),
            Self::Success => {}
        }
        buf.freeze()
    }

    /// `None` for an empty message or an unknown tag.
    ///
    /// An Abort without a reason byte decodes as `Abort(Unknown)`.
    pub fn decode(message: &Bytes) -> Option<Self> {
        let (&tag, _) = message.split_first()?;
        let payload = message.slice(1..);
        match tag {
            0 => Some(Self::Abort(
                payload
                    .first()
                    .map(|b| ValidationFailure::from_byte(*b))
                    .unwrap_or(ValidationFailure::Unknown),
            )),
            1 => Some(Self::Success),
            2 => Some(Self::Challenge(payload)),
            3 => Some(Self::Answer(payload)),
            _ => None,
        }
    }
}
