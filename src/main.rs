// Decode pipeline demo
// Runs a synthetic stream through the loopback runtime and presents each
// frame for one frame interval before releasing it.
//
// Usage: hwdecode-demo [config.json]

use anyhow::{Context, Result};
use hwdecode_lib::source::synthetic::SyntheticStream;
use hwdecode_lib::{
    ConsumerMessage, DecodeEngine, FrameEvent, LoopbackConfig, LoopbackRuntime, PacedDriver,
    PipelineConfig, channel_consumer,
};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    let level = if cfg!(debug_assertions) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => PipelineConfig::default(),
    };
    config.validate()?;

    let source = SyntheticStream::new(1280, 720, config.fps, 90)
        .build()
        .context("building synthetic stream")?;
    let runtime = LoopbackRuntime::new(LoopbackConfig {
        latency: Duration::from_millis(4),
        hardware: true,
        ..Default::default()
    });

    let (consumer, frames) = channel_consumer();
    let engine = DecodeEngine::new(
        Arc::new(runtime),
        Box::new(source),
        Arc::new(consumer),
        &config,
    );

    let interval = config.frame_interval();
    let display = std::thread::Builder::new()
        .name("display".to_string())
        .spawn(move || {
            let mut presented = 0u64;
            for message in frames.iter() {
                match message {
                    ConsumerMessage::Frame(frame) => {
                        std::thread::sleep(interval);
                        presented += 1;
                        frame.release();
                    }
                    ConsumerMessage::Event(FrameEvent::Dropped { token, pts, reason }) => {
                        log::warn!("Frame {} at {}us dropped: {:?}", token, pts, reason);
                    }
                    ConsumerMessage::Event(FrameEvent::EndOfStream) => break,
                    ConsumerMessage::Event(FrameEvent::Fatal(e)) => {
                        log::error!("Playback aborted: {}", e);
                        break;
                    }
                }
            }
            presented
        })
        .context("spawning display thread")?;

    let driver = PacedDriver::spawn(engine, interval)?;
    let stats = driver.join()?;
    let presented = display
        .join()
        .map_err(|_| anyhow::anyhow!("display thread panicked"))?;

    log::info!(
        "Presented {} frames: {} submitted, {} delivered, {} failed, {} skipped, {} unmatched",
        presented,
        stats.submitted,
        stats.delivered,
        stats.failed,
        stats.skipped,
        stats.unmatched
    );
    Ok(())
}
