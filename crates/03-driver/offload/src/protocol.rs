//! Constants and phase plans both sides of the link agree on.

use transport_codecs::control::{ControlTag, Phase};

/// Notification channel used for the handshake.
pub const IPS_ID: u32 = 0;
/// Event number carrying every control message.
pub const IPS_EVENTNO: u32 = 5;
pub const SAMPLE_POOL_ID: u16 = 0;
pub const DEFAULT_BUFFER_SIZE: &str = "800000";
/// Buffers in the sample pool.
pub const NUM_BUFS: u32 = 1;

pub const STATUS_OK: u32 = 0;
pub const STATUS_KERNEL_FAILED: u32 = 1;
/// The co-processor could not reach the shared buffer.
pub const STATUS_NO_BUFFER: u32 = 2;
/// The co-processor failed before it could run its kernel.
pub const STATUS_SETUP_FAILED: u32 = 3;
/// The co-processor lost track of the control stream and is exiting.
pub const STATUS_DESYNC: u32 = 4;

pub const BASE_SETUP_TAGS: &[ControlTag] = &[ControlTag::BufferAddr, ControlTag::BufferLen];
pub const MATMUL_SETUP_TAGS: &[ControlTag] = &[
    ControlTag::BufferAddr,
    ControlTag::BufferLen,
    ControlTag::MatrixSize,
];

const READY: Phase = Phase::new("ready", &[ControlTag::Ready]);
const RESULT: Phase = Phase::new("result", &[ControlTag::Done]);
const GO: Phase = Phase::new("go", &[ControlTag::Go]);

/// What the host expects: one `Ready`, then one `Done` per cycle.
pub fn host_plan() -> Vec<Phase> {
    vec![READY, RESULT]
}

/// What the co-processor expects: its setup fields, then one `Go` per cycle.
pub fn task_plan(setup_tags: &'static [ControlTag]) -> Vec<Phase> {
    vec![Phase::new("setup", setup_tags), GO]
}
