use kernels::TRACKABILITY_IMAGE;
use offload::protocol::STATUS_SETUP_FAILED;
use offload::{
    run_image, Kernel, OffloadError, OffloadResult, SessionConfig, SetupStage, StepOutcome,
    TeardownStep, TransferSession, Workload,
};
use transport::{DspEnv, ImageEntry, PoolAddr, Side};
use transport_codecs::control::ControlMessage;

use crate::support::{open, open_err, platform, platform_with};

#[test]
fn second_teardown_reports_everything_released() {
    let platform = platform();
    let mut session = open(&platform, SessionConfig::new(TRACKABILITY_IMAGE));

    let first = session.teardown();
    assert!(first.is_clean(), "{first:?}");
    let order: Vec<TeardownStep> = first.steps().iter().map(|(step, _)| *step).collect();
    assert_eq!(
        order,
        vec![
            TeardownStep::SignalStop,
            TeardownStep::StopProcessor,
            TeardownStep::Unregister,
            TeardownStep::FreeBuffer,
            TeardownStep::ClosePool,
            TeardownStep::Detach,
            TeardownStep::Destroy,
        ]
    );
    assert!(first
        .steps()
        .iter()
        .all(|(_, outcome)| *outcome == StepOutcome::Done));

    let second = session.teardown();
    assert!(second.all_released());
    assert!(second.is_clean());
    assert!(matches!(
        session.execute(&offload::MatMulJob::new(1, vec![1], vec![1]).expect("job")),
        Err(OffloadError::InvalidState(_))
    ));
}

#[test]
fn dropping_a_session_releases_the_link() {
    let platform = platform();
    let config = SessionConfig::new(TRACKABILITY_IMAGE);
    let pool_id = config.pool();
    {
        let _session = open(&platform, config.clone());
        assert!(platform.pools().attach(pool_id).is_ok());
    }
    assert!(platform.pools().attach(pool_id).is_err());

    // Host endpoint, pool and processor are all free for the next session.
    let mut again = open(&platform, config);
    assert!(again.teardown().is_clean());
}

#[test]
fn failed_load_cleans_up_what_was_acquired() {
    let platform = platform();
    let config = SessionConfig::new("no-such-image");
    let pool_id = config.pool();

    let err = open_err(&platform, config);
    assert_eq!(err.setup_stage(), Some(SetupStage::ProcLoad));
    assert!(platform.pools().attach(pool_id).is_err());

    let mut session = open(&platform, SessionConfig::new(TRACKABILITY_IMAGE));
    assert!(session.teardown().is_clean());
}

struct Idle;

impl Kernel for Idle {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn run(&mut self, _buf: &mut [u8]) -> u32 {
        0
    }
}

/// Starts with an argument list the task cannot parse.
fn misconfigured_image(mut env: DspEnv) -> i32 {
    env.args = vec!["0".to_string()];
    run_image(env, Idle)
}

#[test]
fn peer_setup_failure_surfaces_at_ready() {
    let platform = platform_with(&[("misconfigured", misconfigured_image as ImageEntry)]);
    let link = platform.host_link().expect("link");
    let err = match TransferSession::create(link, SessionConfig::new("misconfigured")) {
        Ok(_) => panic!("peer failed before ready"),
        Err(err) => err,
    };
    match err {
        OffloadError::Setup { stage, source } => {
            assert_eq!(stage, SetupStage::PeerReady);
            assert!(matches!(
                *source,
                OffloadError::Kernel {
                    status: STATUS_SETUP_FAILED
                }
            ));
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut session = open(&platform, SessionConfig::new(TRACKABILITY_IMAGE));
    assert!(session.teardown().is_clean());
}

/// Accepts the buffer but rejects every setup it is given.
struct Unconfigurable;

impl Kernel for Unconfigurable {
    fn name(&self) -> &'static str {
        "unconfigurable"
    }

    fn configure(&mut self, _extra: &[ControlMessage]) -> OffloadResult<()> {
        Err(OffloadError::InvalidState("kernel refuses every configuration"))
    }

    fn run(&mut self, _buf: &mut [u8]) -> u32 {
        0
    }
}

fn unconfigurable_image(env: DspEnv) -> i32 {
    run_image(env, Unconfigurable)
}

struct Fill(u8);

impl Workload for Fill {
    type Output = ();

    fn required_bytes(&self) -> usize {
        64
    }

    fn pack(&self, buf: &mut [u8]) -> OffloadResult<()> {
        buf[..64].fill(self.0);
        Ok(())
    }

    fn unpack(&self, _buf: &[u8]) -> OffloadResult<()> {
        Ok(())
    }
}

#[test]
fn peer_setup_failure_after_ready_returns_the_buffer_and_ends_the_session() {
    let platform = platform_with(&[("unconfigurable", unconfigurable_image as ImageEntry)]);
    let config = SessionConfig::new("unconfigurable").buffer_size("256");
    let pool_id = config.pool();
    let mut session = open(&platform, config);

    assert!(matches!(
        session.execute(&Fill(1)),
        Err(OffloadError::Kernel {
            status: STATUS_SETUP_FAILED
        })
    ));
    let pool = platform.pools().attach(pool_id).expect("pool");
    let buffer = pool
        .buffer_at(PoolAddr::Remote(session.remote_addr()), session.buffer_size())
        .expect("buffer");
    assert_eq!(pool.owner(&buffer).expect("owner"), Side::Gpp);
    drop(pool);

    assert!(matches!(
        session.execute(&Fill(2)),
        Err(OffloadError::InvalidState(_))
    ));
    assert_eq!(session.cycles(), 1);
    assert!(session.teardown().is_clean());
}
