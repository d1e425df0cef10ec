use std::fmt;

/// Identifies one execution domain on the link.
///
/// Co-processors are numbered from zero; the host uses the reserved
/// [`ProcessorId::GPP`] value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorId(pub u8);

impl ProcessorId {
    /// The general-purpose host processor.
    pub const GPP: ProcessorId = ProcessorId(u8::MAX);

    /// Number of co-processors addressable on one link.
    pub const MAX_DSPS: u8 = 4;

    pub fn dsp(index: u8) -> Self {
        ProcessorId(index)
    }

    pub fn is_gpp(self) -> bool {
        self == Self::GPP
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_gpp() {
            f.write_str("gpp")
        } else {
            write!(f, "dsp{}", self.0)
        }
    }
}

/// A pool is scoped to one (host, co-processor) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub processor: ProcessorId,
    pub pool: u16,
}

impl PoolId {
    pub fn new(processor: ProcessorId, pool: u16) -> Self {
        Self { processor, pool }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/pool{}", self.processor, self.pool)
    }
}

/// Registration tuple for a doorbell callback, seen from the receiving side.
///
/// `peer` is the processor whose signals the callback wants to observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub peer: ProcessorId,
    pub channel: u32,
    pub event: u32,
}

impl EventKey {
    pub fn new(peer: ProcessorId, channel: u32, event: u32) -> Self {
        Self {
            peer,
            channel,
            event,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:ips{}:event{}", self.peer, self.channel, self.event)
    }
}
