//! Co-processor side of the handshake.
//!
//! `create` attaches to the host's pool, registers for control messages,
//! announces `Ready` and waits for the buffer parameters. `execute` then
//! serves one `Go` per cycle until the host sends `Stop`:
//!
//! ```text
//! wait Go -> acquire (invalidate) -> kernel -> release (writeback) -> Done(status)
//! ```

use std::sync::Arc;

use transport::{
    Buffer, DspEnv, EventKey, NotifyEndpoint, PoolAddr, PoolId, ProcessorId, RegistrationHandle,
    RendezvousMode, SharedBufferPool, Side,
};
use transport_codecs::control::{ControlMessage, ControlTag};

use crate::config::TaskConfig;
use crate::context::{Doorbell, Inbound, LinkContext};
use crate::error::AtStage;
use crate::protocol::{
    task_plan, BASE_SETUP_TAGS, IPS_EVENTNO, IPS_ID, STATUS_DESYNC, STATUS_KERNEL_FAILED,
    STATUS_NO_BUFFER, STATUS_OK, STATUS_SETUP_FAILED,
};
use crate::teardown::{StepOutcome, TeardownReport, TeardownStep};
use crate::{OffloadError, OffloadResult, SetupStage};

/// Image exit code after a clean run.
pub const EXIT_OK: i32 = 0;
/// Image exit code when the task could not be created.
pub const EXIT_SETUP_FAILED: i32 = 1;
/// Image exit code when the run loop ended on an error.
pub const EXIT_RUN_FAILED: i32 = 2;
/// Image exit code when cleanup reported a failure.
pub const EXIT_TEARDOWN_FAILED: i32 = 3;

/// Computation a co-processor image runs on each `Go`.
pub trait Kernel {
    fn name(&self) -> &'static str;

    /// Setup messages expected after `Ready`. Must start with
    /// `BufferAddr, BufferLen`.
    fn setup_tags(&self) -> &'static [ControlTag] {
        BASE_SETUP_TAGS
    }

    /// Receives the setup messages beyond the buffer address and length.
    fn configure(&mut self, extra: &[ControlMessage]) -> OffloadResult<()> {
        let _ = extra;
        Ok(())
    }

    /// Processes the whole shared buffer in place and returns a status.
    fn run(&mut self, buf: &mut [u8]) -> u32;
}

pub struct ComputeTask<K> {
    processor: ProcessorId,
    config: TaskConfig,
    kernel: K,
    notify: NotifyEndpoint,
    context: Arc<LinkContext>,
    doorbell: Doorbell,
    registration: Option<RegistrationHandle>,
    pool: Option<Arc<SharedBufferPool>>,
    buffer: Option<Buffer>,
    setup_failed: bool,
    stopped: bool,
    cycles: u64,
}

impl<K: Kernel> ComputeTask<K> {
    /// Runs the co-processor half of INIT and WAIT_PEER_READY.
    ///
    /// Failures before `Ready` is sent are reported to the host as a
    /// non-zero `Ready` status. Failures after it leave the task answering
    /// every `Go` with a failure status, so the host never blocks on a
    /// missing `Done`.
    pub fn create(env: DspEnv, kernel: K) -> OffloadResult<Self> {
        let DspEnv {
            processor,
            args,
            pools,
            notify,
        } = env;

        let config = match TaskConfig::from_args(&args) {
            Ok(config) => config,
            Err(err) => {
                let ips_id = args.get(2).and_then(|raw| raw.parse().ok()).unwrap_or(IPS_ID);
                let event_no = args
                    .get(3)
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(IPS_EVENTNO);
                let mut doorbell = Doorbell::new(ProcessorId::GPP, ips_id, event_no);
                let _ = doorbell.send(&notify, ControlTag::Ready, STATUS_SETUP_FAILED);
                return Err(err);
            }
        };

        let context = Arc::new(LinkContext::new(
            processor,
            task_plan(kernel.setup_tags()),
            RendezvousMode::Counting,
        ));
        let mut task = Self {
            processor,
            doorbell: Doorbell::new(config.host, config.ips_id, config.event_no),
            config,
            kernel,
            notify,
            context,
            registration: None,
            pool: None,
            buffer: None,
            setup_failed: false,
            stopped: false,
            cycles: 0,
        };

        if let Err(err) = task.announce(&pools) {
            let _ = task
                .doorbell
                .send(&task.notify, ControlTag::Ready, STATUS_SETUP_FAILED);
            task.release();
            return Err(err);
        }

        match task.context.wait() {
            Inbound::Phase { fields, .. } => {
                if let Err(err) = task.accept_params(&fields) {
                    tracing::error!(processor = %processor, "setup failed after ready: {err}");
                    task.setup_failed = true;
                }
            }
            Inbound::Stop => {
                tracing::debug!(processor = %processor, "stopped before buffer parameters");
                task.stopped = true;
            }
            Inbound::Desync(desync) => {
                task.abandon();
                task.release();
                return Err(OffloadError::setup(SetupStage::AwaitParams, desync));
            }
        }
        Ok(task)
    }

    fn announce(&mut self, pools: &transport::PoolRegistry) -> OffloadResult<()> {
        let pool_id = PoolId::new(self.processor, self.config.pool_id);
        let pool = pools.attach(pool_id).at(SetupStage::PoolOpen)?;
        self.pool = Some(pool);

        let key = EventKey::new(self.config.host, self.config.ips_id, self.config.event_no);
        let registration = self
            .notify
            .register(key, Arc::clone(&self.context), LinkContext::on_event)
            .at(SetupStage::Register)?;
        self.registration = Some(registration);

        self.doorbell
            .send(&self.notify, ControlTag::Ready, STATUS_OK)
            .at(SetupStage::PeerReady)?;
        tracing::debug!(processor = %self.processor, kernel = self.kernel.name(), "ready sent");
        Ok(())
    }

    fn accept_params(&mut self, fields: &[ControlMessage]) -> OffloadResult<()> {
        let [addr, len, extra @ ..] = fields else {
            return Err(OffloadError::setup(
                SetupStage::AwaitParams,
                OffloadError::InvalidState("setup phase lacks buffer address and length"),
            ));
        };
        let len = len.value as usize;
        if len != self.config.buffer_size {
            tracing::warn!(
                processor = %self.processor,
                announced = len,
                expected = self.config.buffer_size,
                "buffer length differs from the image argument"
            );
        }

        let pool = self.pool.as_ref().ok_or(OffloadError::InvalidState("no pool attached"))?;
        let buffer = pool
            .buffer_at(PoolAddr::Remote(addr.value), len)
            .at(SetupStage::ResolveBuffer)?;
        self.buffer = Some(buffer);
        self.kernel.configure(extra)?;
        tracing::debug!(
            processor = %self.processor,
            remote = format_args!("{:#x}", addr.value),
            len,
            "buffer parameters received"
        );
        Ok(())
    }

    /// Serves `Go` messages until the host sends `Stop`. Returns the number
    /// of cycles run.
    pub fn execute(&mut self) -> OffloadResult<u64> {
        while !self.stopped {
            match self.context.wait() {
                Inbound::Phase { .. } => {
                    let status = self.run_once();
                    self.doorbell.send(&self.notify, ControlTag::Done, status)?;
                    self.cycles += 1;
                }
                Inbound::Stop => {
                    tracing::debug!(processor = %self.processor, cycles = self.cycles, "stop received");
                    self.stopped = true;
                }
                Inbound::Desync(desync) => {
                    self.abandon();
                    return Err(desync.into());
                }
            }
        }
        Ok(self.cycles)
    }

    /// Answers the host's outstanding `Go` so it does not wait forever on a
    /// task that is about to exit.
    fn abandon(&mut self) {
        if let Err(err) = self.doorbell.send(&self.notify, ControlTag::Done, STATUS_DESYNC) {
            tracing::warn!(processor = %self.processor, "could not report desync: {err}");
        }
        self.stopped = true;
    }

    fn run_once(&mut self) -> u32 {
        if self.setup_failed {
            self.hand_back();
            return STATUS_SETUP_FAILED;
        }
        let (Some(pool), Some(buffer)) = (self.pool.clone(), self.buffer) else {
            return STATUS_NO_BUFFER;
        };
        match self.run_kernel(&pool, &buffer) {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(processor = %self.processor, "kernel cycle failed: {err}");
                self.hand_back();
                STATUS_KERNEL_FAILED
            }
        }
    }

    /// Returns a buffer this side still owns to the host without running
    /// the kernel, so a failure `Done` never leaves it stranded here.
    fn hand_back(&self) {
        let (Some(pool), Some(buffer)) = (&self.pool, &self.buffer) else {
            return;
        };
        if !matches!(pool.owner(buffer), Ok(Side::Dsp)) {
            return;
        }
        let returned = pool
            .acquire(Side::Dsp, buffer)
            .and_then(|guard| guard.release_to(Side::Gpp));
        if let Err(err) = returned {
            tracing::warn!(processor = %self.processor, "could not return the buffer: {err}");
        }
    }

    fn run_kernel(&mut self, pool: &SharedBufferPool, buffer: &Buffer) -> OffloadResult<u32> {
        let mut guard = pool.acquire(Side::Dsp, buffer)?;
        let status = self.kernel.run(&mut guard);
        guard.release_to(Side::Gpp)?;
        tracing::trace!(processor = %self.processor, kernel = self.kernel.name(), status, "kernel ran");
        Ok(status)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Unregisters and drops the pool view.
    pub fn delete(mut self) -> TeardownReport {
        self.release()
    }

    fn release(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        let registration = self.registration.take();
        report.step(TeardownStep::Unregister, registration.is_some(), || {
            match &registration {
                Some(handle) => self.notify.unregister(handle),
                None => Ok(()),
            }
        });
        self.buffer = None;
        let outcome = match self.pool.take() {
            Some(_) => StepOutcome::Done,
            None => StepOutcome::AlreadyReleased,
        };
        report.record(TeardownStep::ReleasePoolView, outcome);
        report
    }
}

impl<K> Drop for ComputeTask<K> {
    fn drop(&mut self) {
        if let Some(handle) = self.registration.take() {
            if let Err(err) = self.notify.unregister(&handle) {
                tracing::warn!(processor = %self.processor, "unregister on drop failed: {err}");
            }
        }
    }
}

/// Image body: create, serve until stopped, delete. Returns the exit code.
pub fn run_image<K: Kernel>(env: DspEnv, kernel: K) -> i32 {
    let processor = env.processor;
    let mut task = match ComputeTask::create(env, kernel) {
        Ok(task) => task,
        Err(err) => {
            tracing::error!(%processor, "task setup failed: {err}");
            return EXIT_SETUP_FAILED;
        }
    };

    let mut exit = match task.execute() {
        Ok(cycles) => {
            tracing::debug!(%processor, cycles, "task finished");
            EXIT_OK
        }
        Err(err) => {
            tracing::error!(%processor, "task stopped on error: {err}");
            EXIT_RUN_FAILED
        }
    };

    let report = task.delete();
    if exit == EXIT_OK && !report.is_clean() {
        exit = EXIT_TEARDOWN_FAILED;
    }
    exit
}
