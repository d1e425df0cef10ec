//! Per-side handshake state reachable from the notification callback.
//!
//! The callback decodes doorbell words into complete phases and queues them;
//! the orchestration thread pops the queue, blocking on the rendezvous while
//! it is empty. The rendezvous only wakes the waiter, so a coalesced post
//! never loses a message.

use std::collections::VecDeque;

use parking_lot::Mutex;
use transport::{NotifyEndpoint, PostOutcome, ProcessorId, Rendezvous, RendezvousMode};
use transport_codecs::control::{
    ControlSender, ControlTag, Desync, FrameDecoder, Phase, PhaseAssembler, PhaseEvent,
    PhaseFields,
};

use crate::OffloadResult;

/// What the waiting side can receive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Phase {
        phase: &'static str,
        fields: PhaseFields,
    },
    Stop,
    /// The stream went out of step; nothing after this is delivered.
    Desync(Desync),
}

struct Framing {
    decoder: FrameDecoder,
    assembler: PhaseAssembler,
    failed: bool,
}

impl Framing {
    fn feed(&mut self, word: u32) -> Result<Option<PhaseEvent>, Desync> {
        match self.decoder.push(word)? {
            Some(message) => self.assembler.push(message).map(Some),
            None => Ok(None),
        }
    }
}

pub struct LinkContext {
    owner: ProcessorId,
    framing: Mutex<Framing>,
    inbox: Mutex<VecDeque<Inbound>>,
    rendezvous: Rendezvous,
}

impl LinkContext {
    pub fn new(owner: ProcessorId, plan: Vec<Phase>, mode: RendezvousMode) -> Self {
        Self {
            owner,
            framing: Mutex::new(Framing {
                decoder: FrameDecoder::new(),
                assembler: PhaseAssembler::new(plan),
                failed: false,
            }),
            inbox: Mutex::new(VecDeque::new()),
            rendezvous: Rendezvous::new(mode),
        }
    }

    /// Notification callback: runs on the dispatcher thread.
    pub fn on_event(&self, payload: u32) {
        let inbound = {
            let mut framing = self.framing.lock();
            if framing.failed {
                tracing::warn!(processor = %self.owner, payload, "word after desync ignored");
                return;
            }
            match framing.feed(payload) {
                Ok(None) | Ok(Some(PhaseEvent::Pending)) => return,
                Ok(Some(PhaseEvent::Complete { phase, fields })) => {
                    tracing::debug!(processor = %self.owner, phase, "phase complete");
                    Inbound::Phase { phase, fields }
                }
                Ok(Some(PhaseEvent::Stop)) => Inbound::Stop,
                Err(desync) => {
                    framing.failed = true;
                    tracing::warn!(processor = %self.owner, %desync, "control stream desync");
                    Inbound::Desync(desync)
                }
            }
        };

        self.inbox.lock().push_back(inbound);
        if self.rendezvous.post() == PostOutcome::Coalesced {
            tracing::trace!(processor = %self.owner, "wakeup coalesced");
        }
    }

    /// Blocks until the next inbound item. No timeout.
    pub fn wait(&self) -> Inbound {
        loop {
            if let Some(inbound) = self.inbox.lock().pop_front() {
                return inbound;
            }
            self.rendezvous.wait_forever();
        }
    }

    pub fn try_next(&self) -> Option<Inbound> {
        self.inbox.lock().pop_front()
    }
}

/// Outgoing half: frames control messages onto one (channel, event) pair.
pub struct Doorbell {
    peer: ProcessorId,
    channel: u32,
    event: u32,
    sender: ControlSender,
}

impl Doorbell {
    pub fn new(peer: ProcessorId, channel: u32, event: u32) -> Self {
        Self {
            peer,
            channel,
            event,
            sender: ControlSender::new(),
        }
    }

    pub fn peer(&self) -> ProcessorId {
        self.peer
    }

    pub fn send(&mut self, notify: &NotifyEndpoint, tag: ControlTag, value: u32) -> OffloadResult<()> {
        let message = self.sender.frame(tag, value);
        for word in message.words() {
            notify.signal(self.peer, self.channel, self.event, word)?;
        }
        tracing::debug!(from = %notify.id(), to = %self.peer, %tag, value, seq = message.seq, "control sent");
        Ok(())
    }
}
