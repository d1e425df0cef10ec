//! Control-stream faults: the host must report a desync instead of
//! misreading a message, and must never be left waiting on a dead peer.

use std::sync::Arc;

use kernels::MATMUL_IMAGE;
use offload::protocol::{task_plan, BASE_SETUP_TAGS, IPS_EVENTNO, IPS_ID, STATUS_DESYNC};
use offload::{
    Inbound, LinkContext, MatMulJob, OffloadError, OffloadResult, SessionConfig, SetupStage,
    StepOutcome, TeardownStep, Workload,
};
use transport::{DspEnv, EventKey, ImageEntry, ProcessorId, RendezvousMode};
use transport_codecs::control::{ControlMessage, ControlSender, ControlTag, Desync};

use crate::support::{open, open_err, platform_with};

/// Peer that follows the handshake but misbehaves on the wire.
#[derive(Clone, Copy)]
enum Fault {
    /// Answers each `Go` with a `Done` whose sequence number skips one.
    SkipSequence,
    /// Sends `Done` where the host expects `Ready`.
    DoneBeforeReady,
}

fn rogue(env: DspEnv, fault: Fault) -> i32 {
    let context = Arc::new(LinkContext::new(
        env.processor,
        task_plan(BASE_SETUP_TAGS),
        RendezvousMode::Counting,
    ));
    let key = EventKey::new(ProcessorId::GPP, IPS_ID, IPS_EVENTNO);
    let Ok(handle) = env
        .notify
        .register(key, Arc::clone(&context), LinkContext::on_event)
    else {
        return 1;
    };
    let send = |message: ControlMessage| {
        for word in message.words() {
            let _ = env.notify.signal(ProcessorId::GPP, IPS_ID, IPS_EVENTNO, word);
        }
    };

    let mut sender = ControlSender::new();
    match fault {
        Fault::SkipSequence => send(sender.frame(ControlTag::Ready, 0)),
        Fault::DoneBeforeReady => send(sender.frame(ControlTag::Done, 0)),
    }
    loop {
        match context.wait() {
            Inbound::Phase { phase: "go", .. } => {
                let _skipped = sender.frame(ControlTag::Done, 0);
                send(sender.frame(ControlTag::Done, 0));
            }
            Inbound::Phase { .. } => {}
            Inbound::Stop => break,
            Inbound::Desync(_) => return 1,
        }
    }
    match env.notify.unregister(&handle) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn skip_sequence_image(env: DspEnv) -> i32 {
    rogue(env, Fault::SkipSequence)
}

fn done_before_ready_image(env: DspEnv) -> i32 {
    rogue(env, Fault::DoneBeforeReady)
}

/// A matmul payload that does not ask the host to check `MatrixSize`, so
/// it reaches peers that were never told the size.
struct Unchecked(MatMulJob);

impl Workload for Unchecked {
    type Output = Vec<i32>;

    fn required_bytes(&self) -> usize {
        self.0.required_bytes()
    }

    fn pack(&self, buf: &mut [u8]) -> OffloadResult<()> {
        self.0.pack(buf)
    }

    fn unpack(&self, buf: &[u8]) -> OffloadResult<Vec<i32>> {
        self.0.unpack(buf)
    }
}

fn job() -> Unchecked {
    Unchecked(MatMulJob::new(2, vec![1, 2, 3, 4], vec![1, 0, 0, 1]).expect("job"))
}

#[test]
fn sequence_gap_is_a_desync_and_poisons_the_session() {
    let platform = platform_with(&[("skip-sequence", skip_sequence_image as ImageEntry)]);
    let mut session = open(&platform, SessionConfig::new("skip-sequence"));

    let err = session.execute(&job()).expect_err("gap");
    assert!(matches!(
        err,
        OffloadError::ProtocolDesync(Desync::Sequence {
            expected: 1,
            found: 2
        })
    ));
    assert!(matches!(
        session.execute(&job()),
        Err(OffloadError::InvalidState(_))
    ));

    // The peer still honours Stop, so cleanup is complete.
    assert!(session.teardown().is_clean());
}

#[test]
fn wrong_first_message_fails_setup() {
    let platform = platform_with(&[(
        "done-before-ready",
        done_before_ready_image as ImageEntry,
    )]);
    let err = open_err(&platform, SessionConfig::new("done-before-ready"));
    assert_eq!(err.setup_stage(), Some(SetupStage::PeerReady));
    let OffloadError::Setup { source, .. } = err else {
        unreachable!()
    };
    assert!(matches!(
        *source,
        OffloadError::ProtocolDesync(Desync::UnexpectedTag {
            expected: ControlTag::Ready,
            found: ControlTag::Done,
            ..
        })
    ));
}

#[test]
fn missing_setup_field_is_reported_by_the_peer() {
    let platform = platform_with(&[]);
    // The matmul image expects a MatrixSize setup message that never comes.
    let mut session = open(&platform, SessionConfig::new(MATMUL_IMAGE));

    let err = session.execute(&job()).expect_err("peer desync");
    assert!(matches!(
        err,
        OffloadError::Kernel {
            status: STATUS_DESYNC
        }
    ));
    assert!(matches!(
        session.execute(&job()),
        Err(OffloadError::InvalidState(_))
    ));

    let report = session.teardown();
    assert!(matches!(
        report.outcome(TeardownStep::StopProcessor),
        Some(StepOutcome::Failed(_))
    ));
    assert_eq!(report.outcome(TeardownStep::ClosePool), Some(&StepOutcome::Done));
}
