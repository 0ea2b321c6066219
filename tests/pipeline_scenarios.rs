// End-to-end decode pipeline scenarios
// A scripted runtime lets each test decide when, in which order and with
// which outcome completions arrive.

use crossbeam_channel::Receiver;
use hwdecode_lib::decoder::loopback::SubmissionEvent;
use hwdecode_lib::source::synthetic::{SyntheticStream, build_avcc, build_pps, build_sps};
use hwdecode_lib::*;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(60);

#[derive(Default)]
struct Script {
    completions: Mutex<Option<CompletionSender>>,
    configured: AtomicUsize,
    submitted: Mutex<Vec<(Token, i64)>>,
    reject_pts: Mutex<HashSet<i64>>,
    invalid: AtomicBool,
    flushes: AtomicUsize,
    closed: AtomicBool,
}

impl Script {
    fn sender(&self) -> CompletionSender {
        self.completions.lock().clone().expect("no session created")
    }

    fn complete(&self, token: Token) {
        let image = DecodedImage::new(64, 64, OutputFormat::Nv12, vec![0u8; 6144].into());
        assert!(self.sender().decoded(token, image));
    }

    fn fail(&self, token: Token) {
        assert!(self.sender().failed(token, DecodeFailure::new(-12909, "bad data")));
    }

    fn submitted_tokens(&self) -> Vec<Token> {
        self.submitted.lock().iter().map(|(token, _)| *token).collect()
    }
}

struct ScriptedRuntime(Arc<Script>);

impl DecoderRuntime for ScriptedRuntime {
    fn create_session(
        &self,
        _descriptor: &SessionDescriptor,
        completions: CompletionSender,
    ) -> Result<Box<dyn DecoderSession>, RuntimeError> {
        self.0.configured.fetch_add(1, Ordering::SeqCst);
        *self.0.completions.lock() = Some(completions);
        Ok(Box::new(ScriptedSession(self.0.clone())))
    }

    fn info(&self) -> &str {
        "scripted"
    }
}

struct ScriptedSession(Arc<Script>);

impl DecoderSession for ScriptedSession {
    fn submit(&mut self, sample: &Sample, token: Token) -> Result<(), RuntimeError> {
        if self.0.invalid.load(Ordering::SeqCst) {
            return Err(RuntimeError::SessionInvalid("device lost".to_string()));
        }
        if self.0.reject_pts.lock().contains(&sample.pts) {
            return Err(RuntimeError::Rejected("corrupt slice header".to_string()));
        }
        self.0.submitted.lock().push((token, sample.pts));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RuntimeError> {
        self.0.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.0.closed.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.0.closed.store(true, Ordering::SeqCst);
        self.0.completions.lock().take();
    }
}

fn source_with_pts(pts: &[i64]) -> MemorySource {
    let init = Sample::new(build_avcc(&build_sps(64, 64), &build_pps(), 4), 0, 0);
    let samples = pts
        .iter()
        .map(|&pts| Sample::new(vec![0, 0, 0, 2, 0x65, 0x88], pts, 33_000))
        .collect();
    MemorySource::new(init, samples).unwrap()
}

fn config(capacity: usize) -> PipelineConfig {
    PipelineConfig {
        pool_capacity: capacity,
        drain_timeout_ms: 1_000,
        ..Default::default()
    }
}

fn scripted_engine(
    pts: &[i64],
    config: PipelineConfig,
) -> (DecodeEngine, Arc<Script>, Receiver<ConsumerMessage>) {
    let script = Arc::new(Script::default());
    let (consumer, rx) = channel_consumer();
    let mut engine = DecodeEngine::new(
        Arc::new(ScriptedRuntime(script.clone())),
        Box::new(source_with_pts(pts)),
        Arc::new(consumer),
        &config,
    );
    engine.start().unwrap();
    (engine, script, rx)
}

fn submit(engine: &mut DecodeEngine) -> Token {
    match engine.request_next_frame() {
        Ok(FrameRequest::Submitted(token)) => token,
        other => panic!("expected submission, got {:?}", other),
    }
}

fn next_frame(rx: &Receiver<ConsumerMessage>) -> DeliveredFrame {
    match rx.recv_timeout(WAIT).unwrap() {
        ConsumerMessage::Frame(frame) => frame,
        other => panic!("expected frame, got {:?}", other),
    }
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_reverse_order_completions_deliver_matching_pts() {
    let pts = [0, 33_000, 66_000, 99_000, 132_000];
    let (mut engine, script, rx) = scripted_engine(&pts, config(5));

    let tokens: Vec<Token> = (0..5).map(|_| submit(&mut engine)).collect();
    assert_eq!(engine.in_flight(), 5);

    for token in tokens.iter().rev() {
        script.complete(*token);
    }

    let mut delivered = Vec::new();
    for _ in 0..5 {
        let frame = next_frame(&rx);
        let index = tokens.iter().position(|t| *t == frame.token).unwrap();
        assert_eq!(frame.pts, pts[index]);
        delivered.push(frame.pts);
        frame.release();
    }
    assert_eq!(delivered, vec![132_000, 99_000, 66_000, 33_000, 0]);

    assert_eq!(engine.request_next_frame().unwrap(), FrameRequest::EndOfStream);
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), ConsumerMessage::Event(FrameEvent::EndOfStream)));
    assert_eq!(engine.stats().delivered, 5);
    engine.shutdown().unwrap();
}

#[test]
fn test_backpressure_blocks_until_a_slot_is_released() {
    let (mut engine, script, rx) = scripted_engine(&[0, 33_000, 66_000], config(2));
    let first = submit(&mut engine);
    submit(&mut engine);
    assert_eq!(engine.try_request_next_frame().unwrap(), FrameRequest::Deferred);

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let blocked = std::thread::spawn(move || {
        let result = engine.request_next_frame();
        done_tx.send(result.map_err(|e| e.to_string())).unwrap();
        engine
    });
    assert!(done_rx.recv_timeout(QUIET).is_err());

    // Completion lands in a slot; the consumer still holds it
    script.complete(first);
    let frame = next_frame(&rx);
    assert!(done_rx.recv_timeout(QUIET).is_err());

    frame.release();
    assert_eq!(
        done_rx.recv_timeout(WAIT).unwrap().unwrap(),
        FrameRequest::Submitted(Token(2))
    );

    let mut engine = blocked.join().unwrap();
    assert_eq!(script.submitted_tokens(), vec![Token(0), Token(1), Token(2)]);
    script.complete(Token(1));
    script.complete(Token(2));
    next_frame(&rx).release();
    next_frame(&rx).release();
    engine.drain().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_failed_completion_drops_only_that_frame() {
    let (mut engine, script, rx) = scripted_engine(&[0, 33_000, 66_000], config(3));
    let tokens: Vec<Token> = (0..3).map(|_| submit(&mut engine)).collect();

    script.complete(tokens[0]);
    script.fail(tokens[1]);
    script.complete(tokens[2]);

    let frame = next_frame(&rx);
    assert_eq!(frame.pts, 0);
    frame.release();

    match rx.recv_timeout(WAIT).unwrap() {
        ConsumerMessage::Event(FrameEvent::Dropped { token, pts, reason }) => {
            assert_eq!(token, tokens[1]);
            assert_eq!(pts, 33_000);
            assert!(matches!(reason, DropReason::DecodeFailed(f) if f.code == -12909));
        }
        other => panic!("expected drop, got {:?}", other),
    }

    let frame = next_frame(&rx);
    assert_eq!(frame.pts, 66_000);
    frame.release();

    let stats = engine.stats();
    assert_eq!((stats.delivered, stats.failed), (2, 1));
    assert_eq!(stats.pool.reserved, 0);
    assert_eq!(engine.request_next_frame().unwrap(), FrameRequest::EndOfStream);
    engine.shutdown().unwrap();
}

#[test]
fn test_samples_reach_session_in_source_order() {
    let pts: Vec<i64> = (0..8).map(|i| i * 33_000).collect();
    let (mut engine, script, rx) = scripted_engine(&pts, config(8));
    for _ in 0..8 {
        submit(&mut engine);
    }

    assert_eq!(script.configured.load(Ordering::SeqCst), 1);
    let seen: Vec<i64> = script.submitted.lock().iter().map(|(_, pts)| *pts).collect();
    assert_eq!(seen, pts);

    for token in script.submitted_tokens() {
        script.complete(token);
    }
    for _ in 0..8 {
        next_frame(&rx).release();
    }
    engine.drain().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_drain_waits_for_every_completion() {
    let (mut engine, script, rx) = scripted_engine(&[0, 33_000, 66_000], config(3));
    let tokens: Vec<Token> = (0..3).map(|_| submit(&mut engine)).collect();

    let completer = {
        let script = script.clone();
        let tokens = tokens.clone();
        std::thread::spawn(move || {
            for token in [tokens[1], tokens[2], tokens[0]] {
                std::thread::sleep(Duration::from_millis(20));
                script.complete(token);
            }
        })
    };

    engine.drain().unwrap();
    completer.join().unwrap();
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.state(), EngineState::Draining);
    assert!(script.flushes.load(Ordering::SeqCst) >= 1);

    // Late completions after the drain are ignored
    script.complete(tokens[0]);
    wait_for("late completion", || engine.stats().unmatched == 1);

    let mut frames = 0;
    while let Ok(message) = rx.recv_timeout(QUIET) {
        match message {
            ConsumerMessage::Frame(frame) => {
                frames += 1;
                frame.release();
            }
            ConsumerMessage::Event(event) => assert_eq!(event, FrameEvent::EndOfStream),
        }
    }
    assert_eq!(frames, 3);

    engine.shutdown().unwrap();
    assert!(script.closed.load(Ordering::SeqCst));
}

#[test]
fn test_drain_timeout_fails_the_engine() {
    let mut config = config(2);
    config.drain_timeout_ms = 40;
    let (mut engine, _script, rx) = scripted_engine(&[0, 33_000], config);
    submit(&mut engine);

    assert!(matches!(
        engine.drain(),
        Err(EngineError::DrainTimeout { outstanding: 1 })
    ));
    assert!(matches!(
        engine.state(),
        EngineState::Failed(FatalError::DrainTimeout { outstanding: 1 })
    ));
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        ConsumerMessage::Event(FrameEvent::Fatal(FatalError::DrainTimeout { .. }))
    ));
    assert!(matches!(engine.request_next_frame(), Err(SubmitError::Fatal(_))));

    engine.shutdown().unwrap();
    assert_eq!(engine.state(), EngineState::Shutdown);
}

#[test]
fn test_unknown_and_duplicate_tokens_are_ignored() {
    let (mut engine, script, rx) = scripted_engine(&[0, 33_000], config(2));
    let token = submit(&mut engine);

    script.complete(Token(42));
    script.complete(token);
    let frame = next_frame(&rx);
    assert_eq!(frame.token, token);

    script.complete(token);
    wait_for("duplicate completion", || engine.stats().unmatched == 2);
    assert!(rx.recv_timeout(QUIET).is_err());

    let stats = engine.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.pool.in_use, 1);

    frame.release();
    engine.drain().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_rejected_sample_is_skipped() {
    let (mut engine, script, rx) = scripted_engine(&[0, 33_000, 66_000], config(2));
    script.reject_pts.lock().insert(33_000);

    let first = submit(&mut engine);
    let err = engine.request_next_frame().unwrap_err();
    assert!(!err.is_fatal());
    assert!(matches!(err, SubmitError::Rejected { token: Token(1), .. }));
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        ConsumerMessage::Event(FrameEvent::Dropped { pts: 33_000, reason: DropReason::Rejected(_), .. })
    ));

    // The rejected sample gave its budget back
    let third = submit(&mut engine);
    assert_eq!(engine.pool().stats().reserved, 2);

    script.complete(first);
    script.complete(third);
    next_frame(&rx).release();
    next_frame(&rx).release();
    assert_eq!(engine.request_next_frame().unwrap(), FrameRequest::EndOfStream);

    let stats = engine.stats();
    assert_eq!((stats.submitted, stats.delivered, stats.skipped), (2, 2, 1));
    engine.shutdown().unwrap();
}

#[test]
fn test_invalidated_session_is_fatal() {
    let (mut engine, script, rx) = scripted_engine(&[0, 33_000], config(2));
    script.invalid.store(true, Ordering::SeqCst);

    assert!(matches!(
        engine.request_next_frame(),
        Err(SubmitError::Fatal(FatalError::SessionInvalid(_)))
    ));
    assert!(matches!(engine.state(), EngineState::Failed(_)));
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        ConsumerMessage::Event(FrameEvent::Fatal(FatalError::SessionInvalid(_)))
    ));
    assert!(engine.pool().is_closed());
    assert!(matches!(engine.request_next_frame(), Err(SubmitError::Fatal(_))));

    engine.shutdown().unwrap();
    assert!(script.closed.load(Ordering::SeqCst));
}

#[test]
fn test_reconfiguration_recreates_the_session() {
    let runtime = Arc::new(LoopbackRuntime::new(LoopbackConfig::default()));
    let (consumer, rx) = channel_consumer();
    let source = SyntheticStream::new(320, 240, 30, 4).build().unwrap();
    let mut engine = DecodeEngine::new(runtime.clone(), Box::new(source), Arc::new(consumer), &config(2));
    engine.start().unwrap();

    submit(&mut engine);
    next_frame(&rx).release();

    let wider = SyntheticStream::new(640, 360, 30, 1).build().unwrap().init_sample();
    assert!(engine.reconfigure(&wider).unwrap());
    submit(&mut engine);
    let frame = next_frame(&rx);
    assert_eq!(frame.image().map(|image| image.width), Some(640));
    frame.release();

    engine.drain().unwrap();
    engine.shutdown().unwrap();

    let events = runtime.events();
    let configured: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            SubmissionEvent::Configured { width, .. } => Some(*width),
            _ => None,
        })
        .collect();
    assert_eq!(configured, vec![320, 640]);
    assert_eq!(
        events.iter().filter(|event| **event == SubmissionEvent::Closed).count(),
        2
    );
    assert_eq!(runtime.sessions_created(), 2);
}

#[test]
fn test_pool_budget_holds_under_random_timing() {
    let capacity = 3;
    let runtime = LoopbackRuntime::new(LoopbackConfig {
        latency: Duration::from_millis(1),
        order: CompletionOrder::ReversedBatches(2),
        fail_tokens: HashSet::from([Token(7), Token(19)]),
        ..Default::default()
    });
    let source = SyntheticStream::new(160, 96, 30, 40).build().unwrap();
    let (consumer, rx) = channel_consumer();
    let engine = DecodeEngine::new(Arc::new(runtime), Box::new(source), Arc::new(consumer), &config(capacity));
    let pool = engine.pool().clone();

    let display = std::thread::spawn(move || {
        let mut rng = rand::thread_rng();
        let mut presented = Vec::new();
        for message in rx.iter() {
            match message {
                ConsumerMessage::Frame(frame) => {
                    let stats = pool.stats();
                    assert!(stats.in_use <= capacity);
                    assert!(stats.in_use + stats.reserved <= capacity);
                    std::thread::sleep(Duration::from_micros(rng.gen_range(0..1_500)));
                    presented.push(frame.token);
                    frame.release();
                }
                ConsumerMessage::Event(FrameEvent::EndOfStream) => break,
                ConsumerMessage::Event(FrameEvent::Fatal(e)) => panic!("fatal: {}", e),
                ConsumerMessage::Event(_) => {}
            }
        }
        presented
    });

    let stats = PacedDriver::spawn(engine, Duration::ZERO).unwrap().join().unwrap();
    let presented = display.join().unwrap();

    assert_eq!(stats.submitted, 40);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.delivered, 38);
    assert_eq!(presented.len(), 38);
    let unique: HashSet<Token> = presented.iter().copied().collect();
    assert_eq!(unique.len(), 38);
    assert!(!unique.contains(&Token(7)));
}
