//! Decode engine
//!
//! Drives one decoder session. The submission side (`request_next_frame`,
//! `drain`, `shutdown`) runs on the caller's thread and is the only code that
//! touches the session. Completions arrive on a dispatcher thread fed by the
//! runtime's completion channel; they are matched to their pending
//! submission by token, never by arrival order.
//!
//! Admission control: every submission reserves pool capacity first, so the
//! number of in-flight samples plus frames held by the consumer never exceeds
//! the pool. A completion always finds a Free slot; if it does not, the
//! contract was broken and the engine fails.

use super::{
    Completion, CompletionSender, DecoderRuntime, DecoderSession, EngineError, EngineState,
    FatalError, InitError, OutputFormat, RuntimeError, SessionDescriptor, SubmitError, Token,
};
use crate::config::PipelineConfig;
use crate::consumer::{DeliveredFrame, DropReason, FrameConsumer, FrameEvent};
use crate::pool::{Admission, PoolStats, SurfacePool};
use crate::source::avcc::CodecConfig;
use crate::source::{Sample, SampleSource};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Outcome of a frame request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRequest {
    /// A sample went to the decoder under this token
    Submitted(Token),
    /// No pool budget yet. The source was not advanced.
    Deferred,
    /// All samples were submitted and resolved
    EndOfStream,
}

/// Engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub submitted: u64,
    pub delivered: u64,
    /// Completions reporting a decode error
    pub failed: u64,
    /// Samples the session refused at submission
    pub skipped: u64,
    /// Completions with no matching pending submission
    pub unmatched: u64,
    pub in_flight: usize,
    pub pool: PoolStats,
}

#[derive(Debug, Clone, Copy)]
struct PendingRecord {
    pts: i64,
    duration: i64,
    submitted_at: Instant,
}

struct PendingSet {
    records: HashMap<Token, PendingRecord>,
    /// Completions removed from `records` but not yet delivered
    resolving: usize,
    /// Cleared once drained; later completions are ignored
    accepting: bool,
}

impl PendingSet {
    fn outstanding(&self) -> usize {
        self.records.len() + self.resolving
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    unmatched: AtomicU64,
}

/// State reachable from both the submission and the completion thread
struct EngineShared {
    state: Mutex<EngineState>,
    pending: Mutex<PendingSet>,
    /// Signalled when `pending.outstanding()` drops to zero
    settled: Condvar,
    pool: SurfacePool,
    consumer: Arc<dyn FrameConsumer>,
    counters: Counters,
}

impl EngineShared {
    fn state(&self) -> EngineState {
        self.state.lock().clone()
    }

    fn fatal(&self) -> Option<FatalError> {
        match &*self.state.lock() {
            EngineState::Failed(fatal) => Some(fatal.clone()),
            _ => None,
        }
    }

    fn outstanding(&self) -> usize {
        self.pending.lock().outstanding()
    }

    /// Move to `next` unless the current state forbids it.
    /// Terminal states only lead to Shutdown; Draining never goes back.
    fn transition(&self, next: EngineState) {
        let mut state = self.state.lock();
        let allowed = match (&*state, &next) {
            (EngineState::Shutdown, _) => false,
            (EngineState::Failed(_), EngineState::Shutdown) => true,
            (EngineState::Failed(_), _) => false,
            (EngineState::Draining, EngineState::Shutdown | EngineState::Failed(_)) => true,
            (EngineState::Draining, _) => false,
            _ => true,
        };
        if allowed && *state != next {
            log::debug!("Decode engine: {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// AwaitingCompletion -> Ready once nothing is in flight
    fn settle(&self) {
        let mut state = self.state.lock();
        if *state == EngineState::AwaitingCompletion && self.pending.lock().outstanding() == 0 {
            *state = EngineState::Ready;
        }
    }

    fn fail(&self, fatal: FatalError) {
        {
            let mut state = self.state.lock();
            if matches!(*state, EngineState::Failed(_) | EngineState::Shutdown) {
                return;
            }
            log::error!("Decode engine failed: {}", fatal);
            *state = EngineState::Failed(fatal.clone());
        }
        // Unblock a submitter waiting for pool budget
        self.pool.close();
        self.settled.notify_all();
        self.consumer.on_event(FrameEvent::Fatal(fatal));
    }

    /// Wait for every pending submission to resolve. `Err` carries the
    /// number still outstanding at the deadline.
    fn wait_settled(&self, timeout: Duration) -> Result<(), usize> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while pending.outstanding() > 0 {
            if self.settled.wait_until(&mut pending, deadline).timed_out() {
                return match pending.outstanding() {
                    0 => Ok(()),
                    outstanding => Err(outstanding),
                };
            }
        }
        Ok(())
    }

    fn stop_accepting(&self) {
        self.pending.lock().accepting = false;
    }

    fn on_decode_complete(&self, completion: Completion) {
        let Completion { token, result } = completion;

        let record = {
            let mut pending = self.pending.lock();
            if !pending.accepting {
                drop(pending);
                self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                log::warn!("Completion {} arrived after drain, ignored", token);
                return;
            }
            match pending.records.remove(&token) {
                Some(record) => {
                    pending.resolving += 1;
                    record
                }
                None => {
                    drop(pending);
                    self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                    log::warn!("No pending submission for completion {}, ignored", token);
                    return;
                }
            }
        };

        match result {
            Ok(image) => {
                log::debug!(
                    "Frame {} decoded in {:?}",
                    token,
                    record.submitted_at.elapsed()
                );
                self.deliver(token, record, image);
            }
            Err(failure) => {
                self.pool.cancel_reservation();
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Frame {} (pts {}) dropped: {}", token, record.pts, failure);
                self.consumer.on_event(FrameEvent::Dropped {
                    token,
                    pts: record.pts,
                    reason: DropReason::DecodeFailed(failure),
                });
            }
        }

        self.resolve_one();
    }

    fn deliver(&self, token: Token, record: PendingRecord, image: super::DecodedImage) {
        if self.fatal().is_some() {
            self.pool.cancel_reservation();
            log::debug!("Engine failed, discarding frame {}", token);
            return;
        }

        let Some(mut slot) = self.pool.acquire_reserved() else {
            self.pool.cancel_reservation();
            self.fail(FatalError::PoolExhausted { token });
            return;
        };

        slot.bind(image);
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.consumer
            .deliver(DeliveredFrame::new(token, record.pts, record.duration, slot));
    }

    fn resolve_one(&self) {
        {
            let mut pending = self.pending.lock();
            pending.resolving -= 1;
            if pending.outstanding() == 0 {
                self.settled.notify_all();
            }
        }
        self.settle();
    }

    /// Forget a submission the session refused. Returns false if a
    /// completion already claimed it.
    fn withdraw(&self, token: Token) -> bool {
        let removed = {
            let mut pending = self.pending.lock();
            let removed = pending.records.remove(&token).is_some();
            if pending.outstanding() == 0 {
                self.settled.notify_all();
            }
            removed
        };
        if removed {
            self.pool.cancel_reservation();
        }
        removed
    }
}

/// Thread standing in for the runtime's callback context
struct Dispatcher {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Dispatcher {
    fn spawn(shared: Arc<EngineShared>, completions: Receiver<Completion>) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("decode-completions".to_string())
            .spawn(move || {
                loop {
                    crossbeam_channel::select! {
                        recv(completions) -> msg => match msg {
                            Ok(completion) => shared.on_decode_complete(completion),
                            Err(_) => break,
                        },
                        recv(stop_rx) -> _ => break,
                    }
                }
                log::debug!("Completion dispatcher exited");
            })?;
        Ok(Self { stop_tx, handle })
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            log::error!("Completion dispatcher panicked");
        }
    }
}

/// Feeds samples from a source into a decoder session and routes decoded
/// frames to a consumer, bounded by a surface pool.
pub struct DecodeEngine {
    runtime: Arc<dyn DecoderRuntime>,
    source: Box<dyn SampleSource>,
    shared: Arc<EngineShared>,
    session: Option<Box<dyn DecoderSession>>,
    dispatcher: Option<Dispatcher>,
    codec: Option<CodecConfig>,
    output_format: OutputFormat,
    require_hardware: bool,
    drain_timeout: Duration,
    admission_timeout: Option<Duration>,
    next_token: u64,
    drained: bool,
}

impl DecodeEngine {
    /// # Panics
    ///
    /// Panics if `config.pool_capacity` is zero.
    pub fn new(
        runtime: Arc<dyn DecoderRuntime>,
        source: Box<dyn SampleSource>,
        consumer: Arc<dyn FrameConsumer>,
        config: &PipelineConfig,
    ) -> Self {
        let shared = Arc::new(EngineShared {
            state: Mutex::new(EngineState::Uninitialized),
            pending: Mutex::new(PendingSet {
                records: HashMap::new(),
                resolving: 0,
                accepting: true,
            }),
            settled: Condvar::new(),
            pool: SurfacePool::new(config.pool_capacity),
            consumer,
            counters: Counters::default(),
        });

        Self {
            runtime,
            source,
            shared,
            session: None,
            dispatcher: None,
            codec: None,
            output_format: config.output_format,
            require_hardware: config.require_hardware,
            drain_timeout: config.drain_timeout(),
            admission_timeout: config.admission_timeout(),
            next_token: 0,
            drained: false,
        }
    }

    /// Initialize from the source's own init sample
    pub fn start(&mut self) -> Result<(), InitError> {
        let init = self.source.init_sample();
        self.initialize(&init)
    }

    /// Parse the codec configuration and open the decoder session.
    ///
    /// On failure the engine is left in the Failed state.
    pub fn initialize(&mut self, init: &Sample) -> Result<(), InitError> {
        let state = self.shared.state();
        if state != EngineState::Uninitialized {
            return Err(InitError::InvalidState(state));
        }

        let result = CodecConfig::parse(&init.data)
            .map_err(InitError::from)
            .and_then(|codec| self.open_session(init, codec));
        match result {
            Ok(()) => {
                self.shared.transition(EngineState::Ready);
                Ok(())
            }
            Err(err) => {
                self.shared.fail(FatalError::Init(err.to_string()));
                Err(err)
            }
        }
    }

    fn open_session(&mut self, init: &Sample, codec: CodecConfig) -> Result<(), InitError> {
        let descriptor = SessionDescriptor {
            codec: codec.clone(),
            init: init.clone(),
            output_format: self.output_format,
            require_hardware: self.require_hardware,
        };

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = self
            .runtime
            .create_session(&descriptor, CompletionSender::new(tx))?;

        let dispatcher = match Dispatcher::spawn(self.shared.clone(), rx) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                session.close();
                return Err(InitError::Thread(e.to_string()));
            }
        };

        log::info!(
            "Decoder session opened via {}: {}x{} profile {} level {}, output {:?}, pool of {}",
            self.runtime.info(),
            codec.width,
            codec.height,
            codec.profile,
            codec.level,
            self.output_format,
            self.shared.pool.capacity()
        );

        self.session = Some(session);
        self.dispatcher = Some(dispatcher);
        self.codec = Some(codec);
        Ok(())
    }

    /// Replace the session if `init` describes a different stream.
    ///
    /// Waits for in-flight samples before tearing the old session down.
    /// Returns whether a new session was created.
    pub fn reconfigure(&mut self, init: &Sample) -> Result<bool, InitError> {
        match self.shared.state() {
            EngineState::Uninitialized => return self.initialize(init).map(|_| true),
            EngineState::Ready | EngineState::Submitting | EngineState::AwaitingCompletion => {}
            other => return Err(InitError::InvalidState(other)),
        }

        let codec = CodecConfig::parse(&init.data)?;
        if let Some(current) = &self.codec {
            if current.same_parameter_sets(&codec) {
                return Ok(false);
            }
            log::info!(
                "Codec configuration changed ({}x{} -> {}x{}), recreating session",
                current.width,
                current.height,
                codec.width,
                codec.height
            );
        }

        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.flush() {
                log::warn!("Decoder flush before reconfiguration failed: {}", e);
            }
        }
        if let Err(outstanding) = self.shared.wait_settled(self.drain_timeout) {
            log::warn!("Reconfiguration blocked by {} outstanding completions", outstanding);
            return Err(InitError::Busy);
        }
        self.close_session();

        if let Err(err) = self.open_session(init, codec) {
            self.shared.fail(FatalError::Init(err.to_string()));
            return Err(err);
        }
        self.shared.transition(EngineState::Ready);
        Ok(true)
    }

    /// Submit the next sample, blocking until the pool has budget for it.
    ///
    /// When the source is exhausted this drains the session and returns
    /// `EndOfStream`.
    pub fn request_next_frame(&mut self) -> Result<FrameRequest, SubmitError> {
        let deadline = self.admission_timeout.map(|timeout| Instant::now() + timeout);
        self.next_frame(deadline)
    }

    /// Like [`request_next_frame`](Self::request_next_frame) but returns
    /// `Deferred` instead of blocking.
    pub fn try_request_next_frame(&mut self) -> Result<FrameRequest, SubmitError> {
        self.next_frame(Some(Instant::now()))
    }

    fn next_frame(&mut self, deadline: Option<Instant>) -> Result<FrameRequest, SubmitError> {
        match self.shared.state() {
            EngineState::Uninitialized => return Err(SubmitError::NotReady(EngineState::Uninitialized)),
            EngineState::Failed(fatal) => return Err(SubmitError::Fatal(fatal)),
            EngineState::Draining | EngineState::Shutdown => return Ok(FrameRequest::EndOfStream),
            _ => {}
        }

        match self.shared.pool.reserve(deadline) {
            Admission::Granted => {}
            Admission::TimedOut => return Ok(FrameRequest::Deferred),
            Admission::Closed => {
                return Err(match self.shared.fatal() {
                    Some(fatal) => SubmitError::Fatal(fatal),
                    None => SubmitError::NotReady(self.shared.state()),
                });
            }
        }

        // A completion may have failed the engine while we were blocked
        if let Some(fatal) = self.shared.fatal() {
            self.shared.pool.cancel_reservation();
            return Err(SubmitError::Fatal(fatal));
        }

        let Some(sample) = self.source.next_sample() else {
            self.shared.pool.cancel_reservation();
            log::info!(
                "Sample source exhausted after {} submissions",
                self.shared.counters.submitted.load(Ordering::Relaxed)
            );
            self.drain()?;
            return Ok(FrameRequest::EndOfStream);
        };

        self.submit(sample)
    }

    fn submit(&mut self, sample: Sample) -> Result<FrameRequest, SubmitError> {
        let Some(session) = self.session.as_mut().filter(|s| s.is_valid()) else {
            self.shared.pool.cancel_reservation();
            let fatal = FatalError::SessionInvalid("session no longer accepts samples".to_string());
            self.shared.fail(fatal.clone());
            return Err(SubmitError::Fatal(fatal));
        };

        let token = Token(self.next_token);
        self.next_token += 1;

        // Recorded before the call: the completion can beat `submit` back
        self.shared.pending.lock().records.insert(
            token,
            PendingRecord {
                pts: sample.pts,
                duration: sample.duration,
                submitted_at: Instant::now(),
            },
        );
        self.shared.transition(EngineState::Submitting);

        match session.submit(&sample, token) {
            Ok(()) => {
                self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                self.shared.transition(EngineState::AwaitingCompletion);
                self.shared.settle();
                Ok(FrameRequest::Submitted(token))
            }
            Err(RuntimeError::Rejected(reason)) => {
                self.shared.withdraw(token);
                self.shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Sample {} (pts {}) rejected: {}", token, sample.pts, reason);
                self.shared.consumer.on_event(FrameEvent::Dropped {
                    token,
                    pts: sample.pts,
                    reason: DropReason::Rejected(reason.clone()),
                });
                self.shared.transition(EngineState::AwaitingCompletion);
                self.shared.settle();
                Err(SubmitError::Rejected { token, reason })
            }
            Err(err) => {
                self.shared.withdraw(token);
                let fatal = FatalError::SessionInvalid(err.to_string());
                self.shared.fail(fatal.clone());
                Err(SubmitError::Fatal(fatal))
            }
        }
    }

    /// Completion entry point. Safe to call from any thread.
    pub fn on_decode_complete(&self, completion: Completion) {
        self.shared.on_decode_complete(completion);
    }

    /// Block until every submitted sample has been delivered or dropped.
    ///
    /// Afterwards no completion is processed any more. Gives up after the
    /// configured drain timeout, failing the engine.
    pub fn drain(&mut self) -> Result<(), EngineError> {
        if self.drained {
            return Ok(());
        }
        match self.shared.state() {
            EngineState::Shutdown => return Ok(()),
            EngineState::Failed(_) => {}
            _ => self.shared.transition(EngineState::Draining),
        }

        log::info!("Draining decoder, {} outstanding", self.shared.outstanding());
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.flush() {
                log::warn!("Decoder flush failed: {}", e);
            }
        }

        if let Err(outstanding) = self.shared.wait_settled(self.drain_timeout) {
            self.shared.fail(FatalError::DrainTimeout { outstanding });
            return Err(EngineError::DrainTimeout { outstanding });
        }
        self.shared.stop_accepting();
        self.drained = true;

        if let Some(fatal) = self.shared.fatal() {
            return Err(EngineError::Failed(fatal));
        }

        let stats = self.stats();
        log::info!(
            "Decoder drained: {} submitted, {} delivered, {} failed, {} skipped",
            stats.submitted,
            stats.delivered,
            stats.failed,
            stats.skipped
        );
        self.shared.consumer.on_event(FrameEvent::EndOfStream);
        Ok(())
    }

    /// Destroy the session and tear down the pool.
    ///
    /// Requires a completed drain unless nothing is in flight or the engine
    /// has failed.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        let state = self.shared.state();
        if state == EngineState::Shutdown {
            return Ok(());
        }

        if !self.drained {
            if matches!(state, EngineState::Failed(_)) {
                // Callbacks must not outlive the session
                if let Err(outstanding) = self.shared.wait_settled(self.drain_timeout) {
                    log::error!(
                        "Destroying failed session with {} completions outstanding",
                        outstanding
                    );
                }
            } else {
                let outstanding = self.shared.outstanding();
                if outstanding > 0 {
                    return Err(EngineError::NotDrained { outstanding });
                }
            }
            self.shared.stop_accepting();
        }

        self.close_session();
        let held = self.shared.pool.teardown();
        if held > 0 {
            log::info!("Surface pool torn down, {} slots still held by the consumer", held);
        }
        self.shared.transition(EngineState::Shutdown);
        log::info!("Decode engine shut down");
        Ok(())
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.stop();
        }
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Submitted samples not yet delivered or dropped
    pub fn in_flight(&self) -> usize {
        self.shared.outstanding()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn pool(&self) -> &SurfacePool {
        &self.shared.pool
    }

    pub fn codec_config(&self) -> Option<&CodecConfig> {
        self.codec.as_ref()
    }

    pub fn runtime_info(&self) -> &str {
        self.runtime.info()
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        EngineStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            unmatched: counters.unmatched.load(Ordering::Relaxed),
            in_flight: self.shared.outstanding(),
            pool: self.shared.pool.stats(),
        }
    }
}

impl Drop for DecodeEngine {
    fn drop(&mut self) {
        if self.session.is_none() && self.dispatcher.is_none() {
            return;
        }

        log::warn!("Decode engine dropped without shutdown, tearing down");
        if let Some(session) = self.session.as_mut() {
            let _ = session.flush();
        }
        if let Err(outstanding) = self.shared.wait_settled(self.drain_timeout) {
            log::error!("Dropping session with {} completions outstanding", outstanding);
        }
        self.shared.stop_accepting();
        self.close_session();
        self.shared.pool.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerMessage, channel_consumer};
    use crate::decoder::loopback::{CompletionOrder, LoopbackConfig, LoopbackRuntime};
    use crate::source::synthetic::SyntheticStream;
    use crate::source::{MemorySource, SampleSource};

    fn config(capacity: usize) -> PipelineConfig {
        PipelineConfig {
            pool_capacity: capacity,
            drain_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    fn stream(frames: usize) -> MemorySource {
        SyntheticStream::new(320, 240, 30, frames).build().unwrap()
    }

    fn engine(
        frames: usize,
        capacity: usize,
        loopback: LoopbackConfig,
    ) -> (DecodeEngine, Receiver<ConsumerMessage>) {
        let (consumer, rx) = channel_consumer();
        let engine = DecodeEngine::new(
            Arc::new(LoopbackRuntime::new(loopback)),
            Box::new(stream(frames)),
            Arc::new(consumer),
            &config(capacity),
        );
        (engine, rx)
    }

    #[test]
    fn test_requests_before_initialize_are_refused() {
        let (mut engine, _rx) = engine(1, 2, LoopbackConfig::default());
        assert!(matches!(
            engine.request_next_frame(),
            Err(SubmitError::NotReady(EngineState::Uninitialized))
        ));
    }

    #[test]
    fn test_initialize_reads_codec_configuration() {
        let (mut engine, _rx) = engine(1, 2, LoopbackConfig::default());
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Ready);

        let codec = engine.codec_config().unwrap();
        assert_eq!((codec.width, codec.height), (320, 240));

        assert!(matches!(engine.start(), Err(InitError::InvalidState(EngineState::Ready))));
        engine.drain().unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_malformed_init_sample_fails_engine() {
        let (mut engine, _rx) = engine(1, 2, LoopbackConfig::default());
        let bad = Sample::new(vec![1, 66, 0, 31], 0, 0);
        assert!(matches!(
            engine.initialize(&bad),
            Err(InitError::InvalidConfiguration(_))
        ));
        assert!(matches!(engine.state(), EngineState::Failed(FatalError::Init(_))));
        assert!(matches!(engine.request_next_frame(), Err(SubmitError::Fatal(_))));
        engine.shutdown().unwrap();
        assert_eq!(engine.state(), EngineState::Shutdown);
    }

    #[test]
    fn test_hardware_requirement_is_enforced() {
        let (consumer, _rx) = channel_consumer();
        let mut config = config(2);
        config.require_hardware = true;
        let runtime = LoopbackRuntime::new(LoopbackConfig {
            hardware: false,
            ..Default::default()
        });
        let mut engine =
            DecodeEngine::new(Arc::new(runtime), Box::new(stream(1)), Arc::new(consumer), &config);
        assert!(matches!(engine.start(), Err(InitError::Unsupported(_))));
    }

    #[test]
    fn test_full_stream_is_delivered_then_drained() {
        let (mut engine, rx) = engine(12, 3, LoopbackConfig::default());
        engine.start().unwrap();

        let display = std::thread::spawn(move || {
            let mut pts = Vec::new();
            for message in rx.iter() {
                match message {
                    ConsumerMessage::Frame(frame) => {
                        pts.push(frame.pts);
                        frame.release();
                    }
                    ConsumerMessage::Event(FrameEvent::EndOfStream) => break,
                    ConsumerMessage::Event(other) => panic!("unexpected event {:?}", other),
                }
            }
            pts
        });

        let mut submitted = 0;
        loop {
            match engine.request_next_frame().unwrap() {
                FrameRequest::Submitted(_) => submitted += 1,
                FrameRequest::EndOfStream => break,
                FrameRequest::Deferred => unreachable!("blocking request never defers"),
            }
        }

        let pts = display.join().unwrap();
        assert_eq!(submitted, 12);
        assert_eq!(pts, (0..12).map(|i| i * 33_333).collect::<Vec<i64>>());
        assert!(engine.is_drained());
        assert_eq!(engine.state(), EngineState::Draining);

        let stats = engine.stats();
        assert_eq!(stats.delivered, 12);
        assert_eq!(stats.in_flight, 0);

        engine.shutdown().unwrap();
        assert_eq!(engine.state(), EngineState::Shutdown);
        assert_eq!(engine.request_next_frame().unwrap(), FrameRequest::EndOfStream);
    }

    #[test]
    fn test_try_request_defers_without_consuming_samples() {
        let (mut engine, rx) = engine(3, 1, LoopbackConfig::default());
        engine.start().unwrap();

        assert!(matches!(engine.try_request_next_frame(), Ok(FrameRequest::Submitted(_))));
        let frame = match rx.recv().unwrap() {
            ConsumerMessage::Frame(frame) => frame,
            other => panic!("expected frame, got {:?}", other),
        };

        // The single slot is held by the consumer
        assert_eq!(engine.try_request_next_frame().unwrap(), FrameRequest::Deferred);
        assert_eq!(engine.stats().submitted, 1);

        frame.release();
        assert!(matches!(engine.try_request_next_frame(), Ok(FrameRequest::Submitted(Token(1)))));
    }

    #[test]
    fn test_shutdown_requires_drain_while_in_flight() {
        let (mut engine, _rx) = engine(
            2,
            2,
            LoopbackConfig {
                order: CompletionOrder::ReversedBatches(4),
                ..Default::default()
            },
        );
        engine.start().unwrap();
        engine.request_next_frame().unwrap();

        assert!(matches!(
            engine.shutdown(),
            Err(EngineError::NotDrained { outstanding: 1 })
        ));
        engine.drain().unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_external_acquire_cannot_take_reserved_slot() {
        let (mut engine, rx) = engine(
            1,
            1,
            LoopbackConfig {
                order: CompletionOrder::ReversedBatches(2),
                ..Default::default()
            },
        );
        engine.start().unwrap();
        assert!(matches!(engine.request_next_frame(), Ok(FrameRequest::Submitted(_))));

        assert!(engine.pool().try_acquire().is_none());
        assert_eq!(engine.pool().stats().reserved, 1);

        engine.drain().unwrap();
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            ConsumerMessage::Frame(frame) => frame.release(),
            other => panic!("expected frame, got {:?}", other),
        }
        assert_eq!(engine.stats().delivered, 1);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_completion_without_free_slot_is_fatal() {
        let (mut engine, rx) = engine(
            3,
            1,
            LoopbackConfig {
                order: CompletionOrder::ReversedBatches(2),
                ..Default::default()
            },
        );
        engine.start().unwrap();
        assert!(matches!(engine.request_next_frame(), Ok(FrameRequest::Submitted(Token(0)))));

        // Break the admission invariant behind the engine's back
        let stolen = engine.pool().seize_free_slot().unwrap();

        assert!(matches!(
            engine.drain(),
            Err(EngineError::Failed(FatalError::PoolExhausted { token: Token(0) }))
        ));
        assert!(matches!(
            engine.state(),
            EngineState::Failed(FatalError::PoolExhausted { token: Token(0) })
        ));
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ConsumerMessage::Event(FrameEvent::Fatal(FatalError::PoolExhausted { .. }))
        ));
        assert!(matches!(
            engine.request_next_frame(),
            Err(SubmitError::Fatal(FatalError::PoolExhausted { .. }))
        ));

        let stats = engine.stats();
        assert_eq!((stats.delivered, stats.in_flight), (0, 0));
        assert_eq!(stats.pool.reserved, 0);

        stolen.release();
        engine.shutdown().unwrap();
        assert_eq!(engine.state(), EngineState::Shutdown);
    }

    #[test]
    fn test_reconfigure_with_same_parameters_keeps_session() {
        let (mut engine, _rx) = engine(1, 2, LoopbackConfig::default());
        engine.start().unwrap();
        let init = stream(1).init_sample();
        assert!(!engine.reconfigure(&init).unwrap());

        let other = SyntheticStream::new(640, 480, 30, 1).build().unwrap().init_sample();
        assert!(engine.reconfigure(&other).unwrap());
        assert_eq!(engine.codec_config().unwrap().width, 640);
        assert_eq!(engine.state(), EngineState::Ready);
        engine.drain().unwrap();
        engine.shutdown().unwrap();
    }
}
