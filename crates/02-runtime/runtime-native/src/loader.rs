use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use transport::{
    DspEnv, ImageEntry, NotifyBus, PoolRegistry, ProcessorId, ProcessorLoader, TransportError,
    TransportResult,
};

use crate::platform::ImageTable;

enum ProcState {
    Attached,
    Loaded { entry: ImageEntry, args: Vec<String> },
    Running(JoinHandle<i32>),
    Stopped { exit: i32 },
}

impl ProcState {
    fn name(&self) -> &'static str {
        match self {
            ProcState::Attached => "attached",
            ProcState::Loaded { .. } => "loaded",
            ProcState::Running(_) => "running",
            ProcState::Stopped { .. } => "stopped",
        }
    }
}

/// Runs co-processor images on dedicated host threads.
///
/// Each started processor gets its own notify endpoint on the shared bus and
/// a view of the shared pool registry, handed to the image through
/// [`DspEnv`].
pub struct NativeLoader {
    pools: Arc<PoolRegistry>,
    bus: Arc<NotifyBus>,
    images: ImageTable,
    procs: HashMap<ProcessorId, ProcState>,
    ready: bool,
}

fn fail(id: ProcessorId, op: &'static str, reason: impl Into<String>) -> TransportError {
    TransportError::Processor {
        id,
        op,
        reason: reason.into(),
    }
}

impl NativeLoader {
    /// Creates a loader over the given registries.
    pub fn new(pools: Arc<PoolRegistry>, bus: Arc<NotifyBus>, images: ImageTable) -> Self {
        Self {
            pools,
            bus,
            images,
            procs: HashMap::new(),
            ready: false,
        }
    }

    fn state_mut(&mut self, id: ProcessorId, op: &'static str) -> TransportResult<&mut ProcState> {
        if !self.ready {
            return Err(fail(id, op, "loader is not set up"));
        }
        self.procs
            .get_mut(&id)
            .ok_or_else(|| fail(id, op, "processor is not attached"))
    }
}

impl ProcessorLoader for NativeLoader {
    fn setup(&mut self) -> TransportResult<()> {
        self.ready = true;
        tracing::debug!("native loader set up");
        Ok(())
    }

    fn attach(&mut self, id: ProcessorId) -> TransportResult<()> {
        if !self.ready {
            return Err(fail(id, "attach", "loader is not set up"));
        }
        if id.is_gpp() || id.0 >= ProcessorId::MAX_DSPS {
            return Err(fail(id, "attach", "no such co-processor"));
        }
        if self.procs.contains_key(&id) {
            return Err(fail(id, "attach", "already attached"));
        }
        self.procs.insert(id, ProcState::Attached);
        tracing::debug!(processor = %id, "attached");
        Ok(())
    }

    fn load(&mut self, id: ProcessorId, image: &Path, args: &[String]) -> TransportResult<()> {
        let entry = self.images.resolve(image).ok_or_else(|| {
            fail(
                id,
                "load",
                format!("no image registered for {}", image.display()),
            )
        })?;
        let state = self.state_mut(id, "load")?;
        if !matches!(state, ProcState::Attached | ProcState::Stopped { .. }) {
            return Err(fail(id, "load", format!("processor is {}", state.name())));
        }
        *state = ProcState::Loaded {
            entry,
            args: args.to_vec(),
        };
        tracing::debug!(processor = %id, image = %image.display(), ?args, "image loaded");
        Ok(())
    }

    fn start(&mut self, id: ProcessorId) -> TransportResult<()> {
        let pools = Arc::clone(&self.pools);
        let bus = Arc::clone(&self.bus);
        let state = self.state_mut(id, "start")?;
        if !matches!(state, ProcState::Loaded { .. }) {
            return Err(fail(id, "start", format!("processor is {}", state.name())));
        }

        let notify = bus.endpoint(id)?;
        let ProcState::Loaded { entry, args } = std::mem::replace(state, ProcState::Attached)
        else {
            return Err(fail(id, "start", "processor is not loaded"));
        };
        let env = DspEnv {
            processor: id,
            args,
            pools,
            notify,
        };
        let handle = thread::Builder::new()
            .name(format!("{id}"))
            .spawn(move || entry(env))
            .map_err(|err| fail(id, "start", err.to_string()))?;
        *state = ProcState::Running(handle);
        tracing::debug!(processor = %id, "started");
        Ok(())
    }

    /// Joins the image thread. Stopping an already stopped processor
    /// reports the exit code again.
    fn stop(&mut self, id: ProcessorId) -> TransportResult<i32> {
        let state = self.state_mut(id, "stop")?;
        if let ProcState::Stopped { exit } = state {
            tracing::debug!(processor = %id, exit = *exit, "already stopped");
            return Ok(*exit);
        }
        if !matches!(state, ProcState::Running(_)) {
            return Err(fail(id, "stop", format!("processor is {}", state.name())));
        }
        let ProcState::Running(handle) = std::mem::replace(state, ProcState::Stopped { exit: -1 })
        else {
            return Err(fail(id, "stop", "processor is not running"));
        };

        let exit = handle
            .join()
            .map_err(|_| fail(id, "stop", "image panicked"))?;
        *state = ProcState::Stopped { exit };
        tracing::debug!(processor = %id, exit, "stopped");
        Ok(exit)
    }

    fn detach(&mut self, id: ProcessorId) -> TransportResult<()> {
        let state = self.state_mut(id, "detach")?;
        if let ProcState::Running(_) = state {
            return Err(fail(id, "detach", "processor is still running"));
        }
        self.procs.remove(&id);
        tracing::debug!(processor = %id, "detached");
        Ok(())
    }

    fn destroy(&mut self) -> TransportResult<()> {
        if let Some((id, _)) = self
            .procs
            .iter()
            .find(|(_, state)| matches!(state, ProcState::Running(_)))
        {
            return Err(fail(*id, "destroy", "processor is still running"));
        }
        self.procs.clear();
        self.ready = false;
        tracing::debug!("native loader destroyed");
        Ok(())
    }
}

impl Drop for NativeLoader {
    fn drop(&mut self) {
        for (id, state) in self.procs.drain() {
            if let ProcState::Running(handle) = state {
                tracing::warn!(processor = %id, "loader dropped with a running image; detaching thread");
                drop(handle);
            }
        }
    }
}
