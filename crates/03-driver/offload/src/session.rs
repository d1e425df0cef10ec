//! Host side of the handshake.
//!
//! ```text
//! INIT -> WAIT_PEER_READY -> (ARM -> WAIT_RESULT -> CONSUME)* -> TEARDOWN
//! ```
//!
//! `create` runs INIT and WAIT_PEER_READY and sends the buffer parameters;
//! each `execute` is one ARM/WAIT_RESULT/CONSUME cycle; `teardown` releases
//! everything in reverse and is safe to call any number of times.

use std::sync::Arc;

use transport::{
    Buffer, EventKey, HostLink, NotifyEndpoint, PoolAddr, PoolAttrs, PoolRegistry,
    ProcessorLoader, RegistrationHandle, RendezvousMode, SharedBufferPool, Side,
};
use transport_codecs::control::ControlTag;

use crate::config::SessionConfig;
use crate::context::{Doorbell, Inbound, LinkContext};
use crate::error::AtStage;
use crate::protocol::{
    host_plan, NUM_BUFS, STATUS_DESYNC, STATUS_NO_BUFFER, STATUS_OK, STATUS_SETUP_FAILED,
};
use crate::teardown::{TeardownReport, TeardownStep};
use crate::workload::Workload;
use crate::{OffloadError, OffloadResult, SetupStage};

/// Everything `create` acquired and `teardown` must release.
#[derive(Default)]
struct Held {
    setup: bool,
    attached: bool,
    running: bool,
    pool: Option<Arc<SharedBufferPool>>,
    buffer: Option<Buffer>,
    registration: Option<RegistrationHandle>,
}

impl Held {
    fn is_empty(&self) -> bool {
        !self.setup
            && !self.attached
            && !self.running
            && self.pool.is_none()
            && self.buffer.is_none()
            && self.registration.is_none()
    }
}

pub struct TransferSession {
    config: SessionConfig,
    buffer_size: usize,
    remote_addr: u32,
    pools: Arc<PoolRegistry>,
    notify: NotifyEndpoint,
    loader: Box<dyn ProcessorLoader>,
    context: Arc<LinkContext>,
    doorbell: Doorbell,
    held: Held,
    cycles: u64,
    failed: bool,
}

impl TransferSession {
    /// Boots the co-processor and completes the initial handshake.
    ///
    /// On failure everything acquired so far is released before returning
    /// [`OffloadError::Setup`].
    pub fn create(link: HostLink, config: SessionConfig) -> OffloadResult<Self> {
        let buffer_size = config.buffer_bytes()?;
        let HostLink {
            pools,
            notify,
            loader,
        } = link;
        let mut session = Self {
            doorbell: Doorbell::new(config.processor, config.ips_id, config.event_no),
            context: Arc::new(LinkContext::new(
                notify.id(),
                host_plan(),
                RendezvousMode::Binary,
            )),
            config,
            buffer_size,
            remote_addr: 0,
            pools,
            notify,
            loader,
            held: Held::default(),
            cycles: 0,
            failed: false,
        };

        if let Err(err) = session.boot() {
            tracing::error!(processor = %session.config.processor, "session setup failed: {err}");
            let report = session.teardown();
            if let Some((step, reason)) = report.first_failure() {
                tracing::error!(%step, reason, "cleanup after failed setup was incomplete");
            }
            return Err(err);
        }
        Ok(session)
    }

    fn boot(&mut self) -> OffloadResult<()> {
        let processor = self.config.processor;

        self.loader.setup().at(SetupStage::ProcSetup)?;
        self.held.setup = true;
        self.loader.attach(processor).at(SetupStage::ProcAttach)?;
        self.held.attached = true;

        let pool = self
            .pools
            .open(self.config.pool(), &PoolAttrs::single(self.buffer_size, NUM_BUFS))
            .at(SetupStage::PoolOpen)?;
        self.held.pool = Some(Arc::clone(&pool));

        let buffer = pool
            .allocate(Side::Gpp, self.buffer_size)
            .at(SetupStage::BufferAlloc)?;
        self.held.buffer = Some(buffer);

        self.remote_addr = match pool.translate(buffer.local_addr()).at(SetupStage::Translate)? {
            PoolAddr::Remote(addr) => addr,
            PoolAddr::Local(_) => {
                return Err(OffloadError::setup(
                    SetupStage::Translate,
                    OffloadError::InvalidState("translation stayed in the host view"),
                ))
            }
        };

        let key = EventKey::new(processor, self.config.ips_id, self.config.event_no);
        let registration = self
            .notify
            .register(key, Arc::clone(&self.context), LinkContext::on_event)
            .at(SetupStage::Register)?;
        self.held.registration = Some(registration);

        let args = self.config.image_args();
        self.loader
            .load(processor, &self.config.executable, &args)
            .at(SetupStage::ProcLoad)?;
        self.loader.start(processor).at(SetupStage::ProcStart)?;
        self.held.running = true;
        tracing::debug!(%processor, image = %self.config.executable.display(), "co-processor started");

        let ready = match self.context.wait() {
            Inbound::Phase { fields, .. } if fields[0].value == STATUS_OK => Ok(()),
            Inbound::Phase { fields, .. } => Err(OffloadError::Kernel {
                status: fields[0].value,
            }),
            Inbound::Stop => Err(OffloadError::InvalidState("peer stopped before ready")),
            Inbound::Desync(desync) => Err(OffloadError::from(desync)),
        };
        ready.at(SetupStage::PeerReady)?;
        tracing::debug!(%processor, "peer ready");

        let mut params = vec![
            (ControlTag::BufferAddr, self.remote_addr),
            (ControlTag::BufferLen, self.buffer_size as u32),
        ];
        params.extend(self.config.setup_fields.iter().copied());
        for (tag, value) in params {
            self.doorbell
                .send(&self.notify, tag, value)
                .at(SetupStage::SendParams)?;
        }
        tracing::debug!(
            %processor,
            remote = format_args!("{:#x}", self.remote_addr),
            len = self.buffer_size,
            "buffer parameters sent"
        );
        Ok(())
    }

    /// Aligned size of the negotiated buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// The buffer's address in the co-processor's view.
    pub fn remote_addr(&self) -> u32 {
        self.remote_addr
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn notify(&self) -> &NotifyEndpoint {
        &self.notify
    }

    /// One ARM -> WAIT_RESULT -> CONSUME cycle.
    ///
    /// A payload that does not fit fails with `CapacityExceeded` before the
    /// buffer is touched and leaves the session usable.
    pub fn execute<W: Workload>(&mut self, job: &W) -> OffloadResult<W::Output> {
        if self.failed {
            return Err(OffloadError::InvalidState("session failed; tear it down"));
        }
        let (Some(pool), Some(buffer)) = (self.held.pool.clone(), self.held.buffer) else {
            return Err(OffloadError::InvalidState("session is torn down"));
        };
        if job.required_bytes() > self.buffer_size {
            return Err(OffloadError::CapacityExceeded {
                required: job.required_bytes(),
                available: self.buffer_size,
            });
        }
        self.check_setup_fields(job)?;

        let result = self.cycle(&pool, &buffer, job);
        // `cycle` may already have poisoned the session on a failed status.
        match &result {
            Err(OffloadError::Kernel {
                status: STATUS_DESYNC,
            }) => {
                tracing::error!(processor = %self.config.processor, "co-processor lost the control stream");
                self.failed = true;
            }
            Ok(_)
            | Err(
                OffloadError::Kernel { .. }
                | OffloadError::CapacityExceeded { .. }
                | OffloadError::SetupMismatch { .. }
                | OffloadError::Codec(_),
            ) => {}
            Err(err) => {
                tracing::error!(processor = %self.config.processor, "transfer failed: {err}");
                self.failed = true;
            }
        }
        result
    }

    /// Rejects a job whose setup values differ from the ones sent after
    /// `Ready`, before the buffer is touched.
    fn check_setup_fields<W: Workload>(&self, job: &W) -> OffloadResult<()> {
        for (tag, required) in job.setup_fields() {
            let negotiated = self
                .config
                .setup_fields
                .iter()
                .find(|(sent, _)| *sent == tag)
                .map(|(_, value)| *value);
            if negotiated != Some(required) {
                return Err(OffloadError::SetupMismatch {
                    tag,
                    required,
                    negotiated,
                });
            }
        }
        Ok(())
    }

    fn cycle<W: Workload>(
        &mut self,
        pool: &SharedBufferPool,
        buffer: &Buffer,
        job: &W,
    ) -> OffloadResult<W::Output> {
        let cycle = self.cycles;

        // ARM
        {
            let mut guard = pool.acquire(Side::Gpp, buffer)?;
            job.pack(&mut guard)?;
            guard.release_to(Side::Dsp)?;
        }
        self.doorbell.send(&self.notify, ControlTag::Go, cycle as u32)?;
        tracing::debug!(cycle, "armed");

        // WAIT_RESULT
        let status = match self.context.wait() {
            Inbound::Phase { fields, .. } => fields[0].value,
            Inbound::Desync(desync) => return Err(desync.into()),
            Inbound::Stop => return Err(OffloadError::InvalidState("peer sent stop")),
        };
        self.cycles += 1;
        if status != STATUS_OK {
            let owner = pool.owner(buffer)?;
            if owner != Side::Gpp || matches!(status, STATUS_SETUP_FAILED | STATUS_NO_BUFFER) {
                tracing::error!(cycle, status, %owner, "co-processor cannot serve further cycles");
                self.failed = true;
            }
            return Err(OffloadError::Kernel { status });
        }

        // CONSUME
        let guard = pool.acquire(Side::Gpp, buffer)?;
        let output = job.unpack(&guard)?;
        tracing::debug!(cycle, "results consumed");
        Ok(output)
    }

    /// Releases everything the session holds, in reverse acquisition order.
    ///
    /// Every step runs even if an earlier one fails. Calling it again
    /// reports each step as already released.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        let processor = self.config.processor;
        let running = self.held.running;

        report.step(TeardownStep::SignalStop, running, || {
            self.doorbell.send(&self.notify, ControlTag::Stop, 0)
        });

        report.step(TeardownStep::StopProcessor, running, || {
            self.held.running = false;
            match self.loader.stop(processor) {
                Ok(0) => Ok(()),
                Ok(exit) => Err(format!("co-processor image exited with {exit}")),
                Err(err) => Err(err.to_string()),
            }
        });

        let registration = self.held.registration.take();
        report.step(TeardownStep::Unregister, registration.is_some(), || {
            match &registration {
                Some(handle) => self.notify.unregister(handle),
                None => Ok(()),
            }
        });

        let pool = self.held.pool.take();
        let buffer = self.held.buffer.take();
        report.step(
            TeardownStep::FreeBuffer,
            pool.is_some() && buffer.is_some(),
            || match (&pool, &buffer) {
                (Some(pool), Some(buffer)) => pool.free(buffer),
                _ => Ok(()),
            },
        );
        report.step(TeardownStep::ClosePool, pool.is_some(), || {
            self.pools.close(self.config.pool())
        });
        drop(pool);

        let attached = std::mem::take(&mut self.held.attached);
        report.step(TeardownStep::Detach, attached, || self.loader.detach(processor));

        let setup = std::mem::take(&mut self.held.setup);
        report.step(TeardownStep::Destroy, setup, || self.loader.destroy());

        if let Some((step, reason)) = report.first_failure() {
            tracing::error!(%processor, %step, reason, "teardown finished with failures");
        } else {
            tracing::debug!(%processor, cycles = self.cycles, "session torn down");
        }
        report
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            tracing::warn!(processor = %self.config.processor, "session dropped without teardown");
            let _ = self.teardown();
        }
    }
}
