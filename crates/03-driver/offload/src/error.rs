use std::fmt;

use thiserror::Error;
use transport::TransportError;
use transport_codecs::control::{ControlTag, Desync};
use transport_codecs::CodecError;

/// Result alias for session and task operations.
pub type OffloadResult<T, E = OffloadError> = Result<T, E>;

/// Boot step that failed while a session or task was being created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupStage {
    ProcSetup,
    ProcAttach,
    PoolOpen,
    BufferAlloc,
    Translate,
    Register,
    ProcLoad,
    ProcStart,
    PeerReady,
    SendParams,
    AwaitParams,
    ResolveBuffer,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::ProcSetup => "processor setup",
            SetupStage::ProcAttach => "processor attach",
            SetupStage::PoolOpen => "pool open",
            SetupStage::BufferAlloc => "buffer allocation",
            SetupStage::Translate => "address translation",
            SetupStage::Register => "callback registration",
            SetupStage::ProcLoad => "image load",
            SetupStage::ProcStart => "processor start",
            SetupStage::PeerReady => "waiting for peer ready",
            SetupStage::SendParams => "sending buffer parameters",
            SetupStage::AwaitParams => "waiting for buffer parameters",
            SetupStage::ResolveBuffer => "buffer lookup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum OffloadError {
    /// Fatal boot failure. Whatever was acquired has been released.
    #[error("setup failed during {stage}: {source}")]
    Setup {
        stage: SetupStage,
        #[source]
        source: Box<OffloadError>,
    },

    /// The payload does not fit the negotiated buffer; nothing was written.
    #[error("payload needs {required} bytes but the shared buffer holds {available}")]
    CapacityExceeded { required: usize, available: usize },

    /// The job needs a setup value the session did not negotiate; nothing
    /// was written.
    #[error("job needs {tag} = {required} but the session negotiated {negotiated:?}")]
    SetupMismatch {
        tag: ControlTag,
        required: u32,
        negotiated: Option<u32>,
    },

    #[error("protocol desync: {0}")]
    ProtocolDesync(#[from] Desync),

    /// The co-processor reported a non-zero completion status.
    #[error("co-processor kernel failed with status {status}")]
    Kernel { status: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(CodecError),
}

impl From<CodecError> for OffloadError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::CapacityExceeded {
                required,
                available,
            } => OffloadError::CapacityExceeded {
                required,
                available,
            },
            other => OffloadError::Codec(other),
        }
    }
}

impl OffloadError {
    pub fn setup(stage: SetupStage, source: impl Into<OffloadError>) -> Self {
        OffloadError::Setup {
            stage,
            source: Box::new(source.into()),
        }
    }

    /// Stage of a setup failure, if this is one.
    pub fn setup_stage(&self) -> Option<SetupStage> {
        match self {
            OffloadError::Setup { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Tags a failing boot step with its stage.
pub(crate) trait AtStage<T> {
    fn at(self, stage: SetupStage) -> OffloadResult<T>;
}

impl<T, E: Into<OffloadError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: SetupStage) -> OffloadResult<T> {
        self.map_err(|err| OffloadError::setup(stage, err))
    }
}
