// Loopback decoder runtime
// Accepts samples like a hardware session would and answers every one of
// them from a worker thread with a blank picture. Nothing is decoded; the
// runtime exists to drive the engine through realistic completion timing
// and ordering.

use super::{
    CompletionSender, DecodeFailure, DecodedImage, DecoderRuntime, DecoderSession, RuntimeError,
    SessionDescriptor, Token,
};
use crate::source::Sample;
use crate::source::avcc::split_nal_units;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Status reported for injected failures (kVTVideoDecoderBadDataErr)
pub const BAD_DATA_STATUS: i32 = -12909;

/// Largest picture dimension a loopback session accepts
pub const MAX_DIMENSION: u32 = 8192;

/// Order in which completions leave the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionOrder {
    #[default]
    InOrder,
    /// Hold back `n` submissions, then complete them newest first.
    /// A flush releases a partial batch.
    ReversedBatches(usize),
}

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Delay before each completion is posted
    pub latency: Duration,
    pub order: CompletionOrder,
    /// Submissions that complete with a decode error
    pub fail_tokens: HashSet<Token>,
    /// Whether sessions report themselves as hardware accelerated
    pub hardware: bool,
    /// Reject samples whose length-prefixed framing does not parse
    pub validate_framing: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            order: CompletionOrder::InOrder,
            fail_tokens: HashSet::new(),
            hardware: true,
            validate_framing: true,
        }
    }
}

/// What a loopback session saw, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionEvent {
    Configured { width: u32, height: u32, init_size: usize },
    Submitted { token: Token, pts: i64, size: usize },
    Flushed,
    Closed,
}

/// Decoder runtime backed by worker threads instead of hardware
pub struct LoopbackRuntime {
    config: LoopbackConfig,
    events: Arc<Mutex<Vec<SubmissionEvent>>>,
    sessions: AtomicUsize,
    info: String,
}

impl LoopbackRuntime {
    pub fn new(config: LoopbackConfig) -> Self {
        let info = format!(
            "loopback ({}, {:?} latency)",
            if config.hardware { "hardware" } else { "software" },
            config.latency
        );
        Self {
            config,
            events: Arc::new(Mutex::new(Vec::new())),
            sessions: AtomicUsize::new(0),
            info,
        }
    }

    /// Every call made on this runtime's sessions so far
    pub fn events(&self) -> Vec<SubmissionEvent> {
        self.events.lock().clone()
    }

    /// Number of sessions created
    pub fn sessions_created(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }
}

impl DecoderRuntime for LoopbackRuntime {
    fn create_session(
        &self,
        descriptor: &SessionDescriptor,
        completions: CompletionSender,
    ) -> Result<Box<dyn DecoderSession>, RuntimeError> {
        if descriptor.require_hardware && !self.config.hardware {
            return Err(RuntimeError::Unsupported(
                "hardware decoding required but loopback runs in software mode".to_string(),
            ));
        }
        if descriptor.init.is_empty() {
            return Err(RuntimeError::CreateFailed("empty initialization sample".to_string()));
        }

        let (width, height) = (descriptor.width(), descriptor.height());
        if !(1..=MAX_DIMENSION).contains(&width) || !(1..=MAX_DIMENSION).contains(&height) {
            return Err(RuntimeError::Unsupported(format!(
                "{}x{} exceeds {}x{}",
                width, height, MAX_DIMENSION, MAX_DIMENSION
            )));
        }

        let id = self.sessions.fetch_add(1, Ordering::Relaxed);
        self.events.lock().push(SubmissionEvent::Configured {
            width,
            height,
            init_size: descriptor.init.size(),
        });

        // One shared picture for every completion of the session
        let format = descriptor.output_format;
        let picture = Bytes::from(vec![0x80u8; format.frame_size(width, height)]);
        let worker = Worker {
            completions,
            image: DecodedImage::new(width, height, format, picture),
            latency: self.config.latency,
            order: self.config.order,
            fail_tokens: self.config.fail_tokens.clone(),
        };

        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("loopback-decoder-{}", id))
            .spawn(move || worker.run(job_rx))
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        log::info!("Loopback session {} created: {}x{} {:?}", id, width, height, format);

        Ok(Box::new(LoopbackSession {
            jobs: Some(job_tx),
            worker: Some(handle),
            events: self.events.clone(),
            nal_length_size: descriptor.codec.nal_length_size,
            validate_framing: self.config.validate_framing,
            valid: true,
        }))
    }

    fn info(&self) -> &str {
        &self.info
    }
}

enum Job {
    Decode(Token),
    /// Emit everything held back, then acknowledge
    Flush(Sender<()>),
}

struct LoopbackSession {
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    events: Arc<Mutex<Vec<SubmissionEvent>>>,
    nal_length_size: u8,
    validate_framing: bool,
    valid: bool,
}

impl DecoderSession for LoopbackSession {
    fn submit(&mut self, sample: &Sample, token: Token) -> Result<(), RuntimeError> {
        let Some(jobs) = &self.jobs else {
            return Err(RuntimeError::SessionInvalid("session closed".to_string()));
        };

        if self.validate_framing {
            match split_nal_units(&sample.data, self.nal_length_size) {
                Ok(units) if !units.is_empty() => {}
                Ok(_) => return Err(RuntimeError::Rejected("sample carries no NAL units".to_string())),
                Err(e) => return Err(RuntimeError::Rejected(e.to_string())),
            }
        }

        // Logged before the worker can see the job, so the call log never
        // trails the completion
        let event = SubmissionEvent::Submitted {
            token,
            pts: sample.pts,
            size: sample.size(),
        };
        self.events.lock().push(event.clone());

        if jobs.send(Job::Decode(token)).is_err() {
            let mut events = self.events.lock();
            if events.last() == Some(&event) {
                events.pop();
            }
            drop(events);
            self.valid = false;
            return Err(RuntimeError::SessionInvalid("decoder worker exited".to_string()));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RuntimeError> {
        let Some(jobs) = &self.jobs else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if jobs.send(Job::Flush(ack_tx)).is_err() || ack_rx.recv().is_err() {
            self.valid = false;
            return Err(RuntimeError::SessionInvalid("decoder worker exited".to_string()));
        }
        self.events.lock().push(SubmissionEvent::Flushed);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.valid && self.jobs.is_some()
    }

    fn close(&mut self) {
        // Disconnecting the job channel stops the worker
        self.jobs = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("Loopback decoder worker panicked");
            }
            self.events.lock().push(SubmissionEvent::Closed);
        }
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    completions: CompletionSender,
    image: DecodedImage,
    latency: Duration,
    order: CompletionOrder,
    fail_tokens: HashSet<Token>,
}

impl Worker {
    fn run(self, jobs: Receiver<Job>) {
        let batch = match self.order {
            CompletionOrder::InOrder => 1,
            CompletionOrder::ReversedBatches(n) => n.max(1),
        };
        let mut held: Vec<Token> = Vec::with_capacity(batch);

        for job in jobs.iter() {
            match job {
                Job::Decode(token) => {
                    held.push(token);
                    if held.len() >= batch {
                        self.emit(&mut held);
                    }
                }
                Job::Flush(ack) => {
                    self.emit(&mut held);
                    let _ = ack.send(());
                }
            }
        }

        if !held.is_empty() {
            log::debug!("Loopback session closed with {} submissions unanswered", held.len());
        }
    }

    fn emit(&self, held: &mut Vec<Token>) {
        if self.order != CompletionOrder::InOrder {
            held.reverse();
        }
        for token in held.drain(..) {
            if !self.latency.is_zero() {
                std::thread::sleep(self.latency);
            }
            let posted = if self.fail_tokens.contains(&token) {
                self.completions
                    .failed(token, DecodeFailure::new(BAD_DATA_STATUS, "injected decode failure"))
            } else {
                self.completions.decoded(token, self.image.clone())
            };
            if !posted {
                log::debug!("Completion {} posted after the engine stopped listening", token);
            }
        }
    }
}
