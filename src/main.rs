use anyhow::{Context, Result};
use std::time::Duration;

use taiso_tracker::camera::{FrameSource, FrameSourceOptions, OpenCvGrabber, VideoSource};
use taiso_tracker::config::Config;
use taiso_tracker::exercise::{ExerciseEngine, ProfileSet};
use taiso_tracker::pose::MoveNetDetector;
use taiso_tracker::publish::{Topics, UdpPublisher};
use taiso_tracker::service::{fatal_slot, Service};

const CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    let config = Config::load_or_default(CONFIG_PATH);
    config.validate()?;
    let kind = config.exercise_kind()?;

    println!(
        "=== Taiso Tracker v{} ({}) ===",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_VERSION")
    );
    println!("Video source: {}", config.video.source);
    println!("Exercise: {}", kind.display_name());
    println!(
        "Publish: {} every {}ms (prefix: {})",
        config.publish.addr, config.publish.interval_ms, config.publish.topic_prefix
    );
    println!(
        "Detection: frame_skip={} max_width={} confidence={}",
        config.detection.frame_skip, config.detection.max_width, config.detection.confidence_threshold
    );
    println!();

    let profiles = match &config.detection.exercises_file {
        Some(path) => ProfileSet::load_from_file(path)?,
        None => ProfileSet::load_default()?,
    };
    let engine = ExerciseEngine::new(
        &profiles,
        kind,
        config.detection.smoothing_window,
        Duration::from_millis(config.detection.min_rep_interval_ms),
    );

    let detector = MoveNetDetector::new(&config.detection.model_path)
        .with_context(|| format!("failed to load model {}", config.detection.model_path))?;
    println!("Model loaded: {}", config.detection.model_path);

    let topics = Topics::new(&config.publish.topic_prefix, kind);
    let publisher = UdpPublisher::new(&config.publish.addr, topics)?;
    println!("Publisher ready: {}", config.publish.addr);

    let grabber = OpenCvGrabber::new(
        VideoSource::parse(&config.video.source),
        config.video.open_timeout_ms,
        config.video.read_timeout_ms,
    );
    let (fatal, on_error) = fatal_slot();
    let source = FrameSource::start(
        Box::new(grabber),
        FrameSourceOptions {
            reconnect_interval: Duration::from_secs(config.video.reconnect_interval_secs),
            max_reconnect_attempts: config.video.max_reconnect_attempts,
            max_read_errors: config.video.max_read_errors,
            read_interval: None,
            join_timeout: Duration::from_secs(5),
        },
        None,
        Some(on_error),
    );

    let mut service = Service::new(
        &config,
        engine,
        Box::new(detector),
        Box::new(publisher),
        source,
        fatal,
    );

    println!("Service started (Ctrl+C to stop)\n");
    service.run()?;
    println!("Shutting down...");
    Ok(())
}
