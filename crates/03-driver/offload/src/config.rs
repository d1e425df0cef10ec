use std::path::PathBuf;

use transport::{align_up, PoolId, ProcessorId, BUF_ALIGN};
use transport_codecs::control::ControlTag;

use crate::protocol::{DEFAULT_BUFFER_SIZE, IPS_EVENTNO, IPS_ID, SAMPLE_POOL_ID};
use crate::{OffloadError, OffloadResult};

/// Host-side parameters of a transfer session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Co-processor image to load.
    pub executable: PathBuf,
    /// Decimal buffer size, rounded up to [`BUF_ALIGN`] before use. Passed
    /// verbatim to the image as its first argument; the pool, channel and
    /// event ids follow it.
    pub buffer_size: String,
    pub processor: ProcessorId,
    pub pool_id: u16,
    pub ips_id: u32,
    pub event_no: u32,
    /// Extra setup messages sent after the buffer address and length.
    pub setup_fields: Vec<(ControlTag, u32)>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            buffer_size: DEFAULT_BUFFER_SIZE.to_string(),
            processor: ProcessorId::dsp(0),
            pool_id: SAMPLE_POOL_ID,
            ips_id: IPS_ID,
            event_no: IPS_EVENTNO,
            setup_fields: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn buffer_size(mut self, size: impl Into<String>) -> Self {
        self.buffer_size = size.into();
        self
    }

    pub fn processor(mut self, processor: ProcessorId) -> Self {
        self.processor = processor;
        self
    }

    pub fn pool_id(mut self, pool_id: u16) -> Self {
        self.pool_id = pool_id;
        self
    }

    /// Channel and event number both sides use for control messages.
    pub fn event(mut self, ips_id: u32, event_no: u32) -> Self {
        self.ips_id = ips_id;
        self.event_no = event_no;
        self
    }

    pub fn setup_field(mut self, tag: ControlTag, value: u32) -> Self {
        self.setup_fields.push((tag, value));
        self
    }

    /// Buffer size in bytes after alignment.
    pub fn buffer_bytes(&self) -> OffloadResult<usize> {
        parse_buffer_size(&self.buffer_size)
    }

    pub fn pool(&self) -> PoolId {
        PoolId::new(self.processor, self.pool_id)
    }

    /// Arguments handed to the co-processor image, read back by
    /// [`TaskConfig::from_args`].
    pub fn image_args(&self) -> Vec<String> {
        vec![
            self.buffer_size.clone(),
            self.pool_id.to_string(),
            self.ips_id.to_string(),
            self.event_no.to_string(),
        ]
    }
}

/// Parses a decimal byte count and rounds it up to [`BUF_ALIGN`].
pub fn parse_buffer_size(raw: &str) -> OffloadResult<usize> {
    let bytes: usize = raw
        .trim()
        .parse()
        .map_err(|err| OffloadError::InvalidConfig(format!("buffer size {raw:?}: {err}")))?;
    if bytes == 0 {
        return Err(OffloadError::InvalidConfig(
            "buffer size must be non-zero".to_string(),
        ));
    }
    if bytes > u32::MAX as usize - BUF_ALIGN {
        return Err(OffloadError::InvalidConfig(format!(
            "buffer size {bytes} does not fit a 32-bit length"
        )));
    }
    Ok(align_up(bytes, BUF_ALIGN))
}

/// Co-processor-side parameters, mirrored from the host's constants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskConfig {
    pub buffer_size: usize,
    pub host: ProcessorId,
    pub pool_id: u16,
    pub ips_id: u32,
    pub event_no: u32,
}

impl TaskConfig {
    /// Reads `buffer_size [pool_id [ips_id [event_no]]]`. Missing ids fall
    /// back to the link constants.
    pub fn from_args(args: &[String]) -> OffloadResult<Self> {
        let raw = args.first().ok_or_else(|| {
            OffloadError::InvalidConfig("image expects the buffer size as its first argument".into())
        })?;
        Ok(Self {
            buffer_size: parse_buffer_size(raw)?,
            host: ProcessorId::GPP,
            pool_id: id_arg(args, 1, "pool id", SAMPLE_POOL_ID)?,
            ips_id: id_arg(args, 2, "channel id", IPS_ID)?,
            event_no: id_arg(args, 3, "event number", IPS_EVENTNO)?,
        })
    }
}

fn id_arg<T: std::str::FromStr>(
    args: &[String],
    index: usize,
    what: &str,
    default: T,
) -> OffloadResult<T>
where
    T::Err: std::fmt::Display,
{
    match args.get(index) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| OffloadError::InvalidConfig(format!("{what} {raw:?}: {err}"))),
        None => Ok(default),
    }
}
