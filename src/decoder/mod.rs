// Video decoder module
// Hardware decode sessions with asynchronous, out-of-order completions
//
// The hardware runtime is abstracted behind `DecoderRuntime`/`DecoderSession`.
// Completions travel over a channel from the runtime's own thread into the
// engine, so the engine logic runs the same against real hardware or the
// loopback runtime used in tests.

pub mod engine;
pub mod loopback;

pub use engine::{DecodeEngine, EngineStats, FrameRequest};

use crate::source::Sample;
use crate::source::avcc::{AvccError, CodecConfig};
use bytes::Bytes;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque correlation token linking a submission to its completion.
///
/// Tokens come from a per-engine sequence counter, so they stay unique even
/// when presentation times repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pixel layout requested from the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Bi-planar 4:2:0, the native hardware layout
    #[default]
    Nv12,
    /// Packed BGRA for direct upload
    Bgra,
}

impl OutputFormat {
    /// Bytes needed for one picture
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            OutputFormat::Nv12 => pixels + pixels / 2,
            OutputFormat::Bgra => pixels * 4,
        }
    }
}

/// Decoded picture produced by the runtime
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub data: Bytes,
}

impl DecodedImage {
    pub fn new(width: u32, height: u32, format: OutputFormat, data: Bytes) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }
}

/// Everything a runtime needs to open a session
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub codec: CodecConfig,
    /// Initialization unit, handed over exactly once at session creation
    pub init: Sample,
    pub output_format: OutputFormat,
    /// Refuse to fall back to a non-accelerated decoder
    pub require_hardware: bool,
}

impl SessionDescriptor {
    pub fn width(&self) -> u32 {
        self.codec.width
    }

    pub fn height(&self) -> u32 {
        self.codec.height
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),
    #[error("Session creation failed: {0}")]
    CreateFailed(String),
    #[error("Sample rejected: {0}")]
    Rejected(String),
    #[error("Session invalidated: {0}")]
    SessionInvalid(String),
}

/// Decode error reported through a completion
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Decode failed ({code}): {reason}")]
pub struct DecodeFailure {
    /// Runtime specific status code
    pub code: i32,
    pub reason: String,
}

impl DecodeFailure {
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// One completion posted by the runtime
#[derive(Debug)]
pub struct Completion {
    pub token: Token,
    pub result: Result<DecodedImage, DecodeFailure>,
}

/// Runtime side of the completion channel.
///
/// Cloned into whatever thread the runtime delivers results on.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: Sender<Completion>,
}

impl CompletionSender {
    pub(crate) fn new(tx: Sender<Completion>) -> Self {
        Self { tx }
    }

    /// Post a completion. Returns false once the engine stopped listening.
    pub fn send(&self, completion: Completion) -> bool {
        self.tx.send(completion).is_ok()
    }

    pub fn decoded(&self, token: Token, image: DecodedImage) -> bool {
        self.send(Completion {
            token,
            result: Ok(image),
        })
    }

    pub fn failed(&self, token: Token, failure: DecodeFailure) -> bool {
        self.send(Completion {
            token,
            result: Err(failure),
        })
    }
}

/// Factory for decoder sessions (one per codec configuration)
pub trait DecoderRuntime: Send + Sync {
    /// Open a session. Completions for every accepted submission must be
    /// posted to `completions`, from any thread, in any order.
    fn create_session(
        &self,
        descriptor: &SessionDescriptor,
        completions: CompletionSender,
    ) -> Result<Box<dyn DecoderSession>, RuntimeError>;

    /// Get runtime info
    fn info(&self) -> &str;
}

/// A live decoder session bound to one codec configuration
pub trait DecoderSession: Send {
    /// Submit one access unit. The sample is only borrowed for the call.
    ///
    /// A rejected sample must not produce a completion.
    fn submit(&mut self, sample: &Sample, token: Token) -> Result<(), RuntimeError>;

    /// Ask the runtime to emit every completion it is still holding back
    fn flush(&mut self) -> Result<(), RuntimeError>;

    /// Whether the session can still accept samples
    fn is_valid(&self) -> bool;

    /// Destroy the session. No completion may be posted afterwards.
    fn close(&mut self);
}

/// Unrecoverable engine conditions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("Initialization failed: {0}")]
    Init(String),
    #[error("Surface pool exhausted while completing {token}")]
    PoolExhausted { token: Token },
    #[error("Drain timed out with {outstanding} completions outstanding")]
    DrainTimeout { outstanding: usize },
    #[error("Decoder session invalidated: {0}")]
    SessionInvalid(String),
}

/// Engine lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Submitting,
    AwaitingCompletion,
    Draining,
    Shutdown,
    Failed(FatalError),
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Shutdown | EngineState::Failed(_))
    }
}

#[derive(Error, Debug)]
pub enum InitError {
    #[error("Invalid codec configuration: {0}")]
    InvalidConfiguration(#[from] AvccError),
    #[error("Hardware decoder not available: {0}")]
    Unsupported(String),
    #[error("Decoder rejected configuration: {0}")]
    Rejected(String),
    #[error("Engine already initialized (state {0:?})")]
    InvalidState(EngineState),
    #[error("Outstanding completions did not settle before reconfiguration")]
    Busy,
    #[error("Failed to start completion thread: {0}")]
    Thread(String),
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Sample {token} rejected: {reason}")]
    Rejected { token: Token, reason: String },
    #[error("Engine not ready (state {0:?})")]
    NotReady(EngineState),
    #[error("Engine failed: {0}")]
    Fatal(FatalError),
    #[error("Drain failed: {0}")]
    Drain(#[from] EngineError),
}

impl SubmitError {
    /// Whether playback has to stop
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SubmitError::Rejected { .. })
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Drain timed out with {outstanding} completions outstanding")]
    DrainTimeout { outstanding: usize },
    #[error("Shutdown requested before drain ({outstanding} outstanding)")]
    NotDrained { outstanding: usize },
    #[error("Engine failed: {0}")]
    Failed(FatalError),
}

impl From<RuntimeError> for InitError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unsupported(msg) => InitError::Unsupported(msg),
            other => InitError::Rejected(other.to_string()),
        }
    }
}
