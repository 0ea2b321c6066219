//! Paced driver
//! Requests frames from a decode engine at a fixed interval on its own thread,
//! then drains and shuts the engine down at end of stream

use crate::decoder::{
    DecodeEngine, EngineError, EngineState, EngineStats, FrameRequest, InitError, SubmitError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Initialization failed: {0}")]
    Init(#[from] InitError),
    #[error("Submission failed: {0}")]
    Submit(#[from] SubmitError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Failed to spawn driver thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Driver thread panicked")]
    Panicked,
}

/// Handle to a running driver thread
pub struct PacedDriver {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<EngineStats, DriverError>>>,
}

impl PacedDriver {
    /// Start driving `engine`, one frame request per `frame_interval`.
    ///
    /// An uninitialized engine is started from its source's init sample.
    pub fn spawn(engine: DecodeEngine, frame_interval: Duration) -> Result<Self, DriverError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::Builder::new()
            .name("decode-driver".to_string())
            .spawn(move || {
                let result = drive(engine, frame_interval, &flag);
                flag.store(false, Ordering::SeqCst);
                result
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Ask the driver to stop submitting. Outstanding frames are still drained.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait for the driver to finish and return the final engine stats
    pub fn join(mut self) -> Result<EngineStats, DriverError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| DriverError::Panicked)?,
            None => Err(DriverError::Panicked),
        }
    }
}

impl Drop for PacedDriver {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
        }
    }
}

fn drive(
    mut engine: DecodeEngine,
    frame_interval: Duration,
    running: &AtomicBool,
) -> Result<EngineStats, DriverError> {
    if engine.state() == EngineState::Uninitialized {
        engine.start()?;
    }

    log::info!("Decode driver started ({:?} per frame)", frame_interval);
    let mut last_request = Instant::now();
    let mut first = true;

    while running.load(Ordering::SeqCst) {
        // Frame rate limiting
        let elapsed = last_request.elapsed();
        if !first && elapsed < frame_interval {
            std::thread::sleep(frame_interval - elapsed);
        }
        first = false;
        last_request = Instant::now();

        match engine.request_next_frame() {
            Ok(FrameRequest::Submitted(_)) | Ok(FrameRequest::Deferred) => {}
            Ok(FrameRequest::EndOfStream) => break,
            Err(e) if !e.is_fatal() => log::warn!("Skipping sample: {}", e),
            Err(e) => {
                log::error!("Decode driver stopping: {}", e);
                if let Err(shutdown) = engine.shutdown() {
                    log::error!("Shutdown after failure: {}", shutdown);
                }
                return Err(e.into());
            }
        }
    }

    finish(engine)
}

fn finish(mut engine: DecodeEngine) -> Result<EngineStats, DriverError> {
    let drained = engine.drain();
    let stats = engine.stats();
    let shutdown = engine.shutdown();
    drained?;
    shutdown?;

    log::info!(
        "Decode driver finished: {} submitted, {} delivered, {} failed, {} skipped",
        stats.submitted,
        stats.delivered,
        stats.failed,
        stats.skipped
    );
    Ok(stats)
}
