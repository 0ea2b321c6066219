// Hardware video decode pipeline
// Main library entry point
//
// Sample source -> decode engine -> surface pool -> frame consumer. The
// engine submits compressed samples to a decoder session, matches the
// session's asynchronous completions back to their submissions and hands
// decoded pictures to the consumer in pool slots it must release.

pub mod config;
pub mod consumer;
pub mod decoder;
pub mod driver;
pub mod pool;
pub mod source;

pub use config::{ConfigError, PipelineConfig};
pub use consumer::{
    ChannelConsumer, ConsumerMessage, DeliveredFrame, DropReason, FrameConsumer, FrameEvent,
    channel_consumer,
};
pub use decoder::loopback::{CompletionOrder, LoopbackConfig, LoopbackRuntime};
pub use decoder::{
    Completion, CompletionSender, DecodeEngine, DecodeFailure, DecodedImage, DecoderRuntime,
    DecoderSession, EngineError, EngineState, EngineStats, FatalError, FrameRequest, InitError,
    OutputFormat, RuntimeError, SessionDescriptor, SubmitError, Token,
};
pub use driver::{DriverError, PacedDriver};
pub use pool::{PoolStats, SlotHandle, SurfacePool};
pub use source::{MemorySource, Sample, SampleSource, SourceError};
