//! Surface relay demo: simulated camera → relay engine → simulated encoder

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use surface_relay::pipeline::{EncoderQueue, LoopbackRuntime, SimulatedCamera};
use surface_relay::relay::{Fence, QueueError, RelayEngine};
use surface_relay::{Config, EncoderConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("surface_relay=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Surface relay launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    surface_relay::CONFIG.store(Arc::new(config.clone()));

    let runtime = LoopbackRuntime::new(config.camera.buffer_count);
    let engine = RelayEngine::new(runtime, &config.relay);
    engine.initialize(config.relay.width, config.relay.height, config.relay.format)?;

    let encoder = EncoderQueue::new(config.encoder.queue_depth);
    engine.bind_downstream(Some(encoder.clone()))?;
    engine.set_metadata_callback(|frame, blob| {
        debug!(frame, len = blob.len(), "sensor metadata");
    });

    let producer = engine
        .upstream_handle()
        .ok_or_else(|| eyre!("camera surface unavailable"))?;

    let stop = Arc::new(AtomicBool::new(false));
    let encoder_task = {
        let stop = Arc::clone(&stop);
        let encoder = Arc::clone(&encoder);
        let encoder_config = config.encoder.clone();
        tokio::task::spawn_blocking(move || run_encoder(&encoder, &encoder_config, &stop))
    };

    let camera_task = {
        let stop = Arc::clone(&stop);
        let mut camera = SimulatedCamera::new(producer, config.camera.clone(), &config.relay);
        let frames = config.camera.frames;
        tokio::task::spawn_blocking(move || {
            let interval = camera.frame_interval();
            while camera.sequence() < frames && !stop.load(Ordering::Acquire) {
                match camera.capture_frame() {
                    Ok(_) => {}
                    Err(QueueError::NoBuffer) => warn!("camera pool exhausted, frame dropped"),
                    Err(e) => {
                        error!("Capture error: {}", e);
                        break;
                    }
                }
                std::thread::sleep(interval);
            }
        })
    };

    tokio::select! {
        res = camera_task => res?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    // let the encoder hand back what it still holds
    let deadline = Instant::now() + Duration::from_secs(2);
    while engine.in_flight() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stop.store(true, Ordering::Release);
    encoder_task.await?;

    let stats = engine.stats();
    engine.release();

    info!(
        forwarded = stats.frames_forwarded,
        returned = stats.buffers_returned,
        metadata = stats.metadata_frames,
        forward_failures = stats.forward_failures,
        return_failures = stats.return_failures,
        in_flight = stats.in_flight,
        "Surface relay shutting down"
    );
    Ok(())
}

fn run_encoder(encoder: &EncoderQueue, config: &EncoderConfig, stop: &AtomicBool) {
    let delay = Duration::from_millis(config.release_delay_ms);
    while !stop.load(Ordering::Acquire) {
        let Some(frame) = encoder.next_frame(Duration::from_millis(50)) else {
            continue;
        };
        // stands in for the time the hardware encoder holds the buffer
        std::thread::sleep(delay);
        debug!(buffer = %frame.buffer, timestamp = frame.timestamp, "encoded frame");
        if let Err(e) = encoder.release_frame(frame.buffer, Fence::none()) {
            error!("Failed to release frame: {}", e);
        }
    }
}
