//! Control messages multiplexed over one doorbell event.
//!
//! A doorbell carries a single 32-bit scalar, so each message is framed as
//! two consecutive signals: a header word and a value word.
//!
//! ```text
//! header = 0xC7 << 24 | tag << 16 | seq
//! value  = payload scalar
//! ```
//!
//! `seq` counts messages per sender and wraps at 16 bits. A receiver feeds
//! words into a [`FrameDecoder`] and the resulting messages into a
//! [`PhaseAssembler`], which groups them by handshake phase and reports any
//! gap, reordering or unexpected tag as a [`Desync`].

use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;

/// High byte of every header word.
pub const FRAME_MAGIC: u32 = 0xC7;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlTag {
    /// Co-processor finished its own setup.
    Ready = 1,
    /// Remote address of the shared buffer.
    BufferAddr = 2,
    /// Length of the shared buffer in bytes.
    BufferLen = 3,
    /// Side length of the square matrices.
    MatrixSize = 4,
    /// Buffer is packed and owned by the co-processor.
    Go = 5,
    /// Kernel finished; value is the status.
    Done = 6,
    /// Leave the run loop.
    Stop = 7,
}

impl ControlTag {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => ControlTag::Ready,
            2 => ControlTag::BufferAddr,
            3 => ControlTag::BufferLen,
            4 => ControlTag::MatrixSize,
            5 => ControlTag::Go,
            6 => ControlTag::Done,
            7 => ControlTag::Stop,
            _ => return None,
        })
    }
}

impl fmt::Display for ControlTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    pub tag: ControlTag,
    pub seq: u16,
    pub value: u32,
}

impl ControlMessage {
    pub fn header(&self) -> u32 {
        FRAME_MAGIC << 24 | (self.tag as u32) << 16 | u32::from(self.seq)
    }

    /// The two doorbell payloads for this message, in send order.
    pub fn words(&self) -> [u32; 2] {
        [self.header(), self.value]
    }
}

/// Stamps outgoing messages with consecutive sequence numbers.
#[derive(Debug, Default)]
pub struct ControlSender {
    next_seq: u16,
}

impl ControlSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&mut self, tag: ControlTag, value: u32) -> ControlMessage {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        ControlMessage { tag, seq, value }
    }
}

/// Ways the receiver can tell the stream is out of step with the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Desync {
    #[error("word {0:#010x} is not a control header")]
    BadHeader(u32),

    #[error("unknown control tag {0}")]
    UnknownTag(u8),

    #[error("sequence gap: expected message {expected}, got {found}")]
    Sequence { expected: u16, found: u16 },

    #[error("phase {phase} expected {expected}, got {found}")]
    UnexpectedTag {
        phase: &'static str,
        expected: ControlTag,
        found: ControlTag,
    },
}

/// Reassembles header/value word pairs into messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Option<(ControlTag, u16)>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one doorbell payload; yields a message once its value arrives.
    pub fn push(&mut self, word: u32) -> Result<Option<ControlMessage>, Desync> {
        if let Some((tag, seq)) = self.pending.take() {
            return Ok(Some(ControlMessage {
                tag,
                seq,
                value: word,
            }));
        }
        if word >> 24 != FRAME_MAGIC {
            return Err(Desync::BadHeader(word));
        }
        let raw = (word >> 16) as u8;
        let tag = ControlTag::from_u8(raw).ok_or(Desync::UnknownTag(raw))?;
        self.pending = Some((tag, word as u16));
        Ok(None)
    }

    /// Whether a header is waiting for its value word.
    pub fn mid_frame(&self) -> bool {
        self.pending.is_some()
    }
}

/// A group of messages the receiver expects back to back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Phase {
    pub name: &'static str,
    pub tags: &'static [ControlTag],
}

impl Phase {
    pub const fn new(name: &'static str, tags: &'static [ControlTag]) -> Self {
        Self { name, tags }
    }
}

pub type PhaseFields = SmallVec<[ControlMessage; 4]>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseEvent {
    /// More fields are needed before the current phase completes.
    Pending,
    Complete {
        phase: &'static str,
        fields: PhaseFields,
    },
    /// The sender asked to stop between phases.
    Stop,
}

/// Tracks which phase the handshake is in and how many of its fields have
/// arrived. The last phase of the plan repeats indefinitely.
#[derive(Debug)]
pub struct PhaseAssembler {
    plan: Vec<Phase>,
    phase: usize,
    fields: PhaseFields,
    expected_seq: u16,
}

impl PhaseAssembler {
    /// `plan` must contain at least one phase, each with at least one tag.
    pub fn new(plan: Vec<Phase>) -> Self {
        debug_assert!(!plan.is_empty() && plan.iter().all(|p| !p.tags.is_empty()));
        Self {
            plan,
            phase: 0,
            fields: SmallVec::new(),
            expected_seq: 0,
        }
    }

    pub fn current(&self) -> Option<&Phase> {
        self.plan.get(self.phase)
    }

    /// Fields received so far in the current phase.
    pub fn received(&self) -> usize {
        self.fields.len()
    }

    pub fn push(&mut self, message: ControlMessage) -> Result<PhaseEvent, Desync> {
        if message.seq != self.expected_seq {
            return Err(Desync::Sequence {
                expected: self.expected_seq,
                found: message.seq,
            });
        }
        self.expected_seq = self.expected_seq.wrapping_add(1);

        let Some(phase) = self.plan.get(self.phase).copied() else {
            return Err(Desync::BadHeader(message.header()));
        };
        let expected = phase.tags[self.fields.len()];

        if message.tag == ControlTag::Stop && self.fields.is_empty() {
            return Ok(PhaseEvent::Stop);
        }
        if message.tag != expected {
            return Err(Desync::UnexpectedTag {
                phase: phase.name,
                expected,
                found: message.tag,
            });
        }

        self.fields.push(message);
        if self.fields.len() < phase.tags.len() {
            return Ok(PhaseEvent::Pending);
        }
        self.phase = (self.phase + 1).min(self.plan.len() - 1);
        Ok(PhaseEvent::Complete {
            phase: phase.name,
            fields: std::mem::take(&mut self.fields),
        })
    }
}
