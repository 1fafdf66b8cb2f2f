//! Image-style workload over synthetic frames:
//!
//! load -> remove background -+-> save frame
//!                            +-> make thumbnail -> save thumbnail
//!
//! Run with `RUST_LOG=balanced_pipeline=debug` to watch workers move
//! between stages.

use balanced_pipeline::{BoxError, MapTransform, Pipeline, PipelineConfig, Rebalance};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

const FRAMES: u64 = 400;
const WIDTH: usize = 64;
const HEIGHT: usize = 48;
const THUMB_SCALE: usize = 4;

#[derive(Debug, Clone)]
struct Frame {
    id: u64,
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl Frame {
    fn synthetic(id: u64) -> Self {
        let pixels = (0..WIDTH * HEIGHT)
            .map(|i| ((i as u64 * 31 + id * 7) % 256) as u8)
            .collect();
        Self {
            id,
            width: WIDTH,
            height: HEIGHT,
            pixels,
        }
    }
}

fn remove_background(mut frame: Frame) -> Result<Frame, BoxError> {
    // Stands in for the expensive model call.
    thread::sleep(Duration::from_millis(4));
    for pixel in &mut frame.pixels {
        if *pixel < 96 {
            *pixel = 0;
        }
    }
    Ok(frame)
}

fn thumbnail(frame: Frame) -> Result<Frame, BoxError> {
    thread::sleep(Duration::from_millis(1));
    let width = frame.width / THUMB_SCALE;
    let height = frame.height / THUMB_SCALE;
    let mut pixels = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            pixels.push(frame.pixels[y * THUMB_SCALE * frame.width + x * THUMB_SCALE]);
        }
    }
    Ok(Frame {
        id: frame.id,
        width,
        height,
        pixels,
    })
}

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut pipeline = Pipeline::new(PipelineConfig::default())?;
    let loaded = pipeline.queue::<Frame>();
    let cleaned = pipeline.queue::<Frame>();
    let to_thumbnail = pipeline.queue::<Frame>();
    let thumbnails = pipeline.queue::<Frame>();

    pipeline.source("load", &loaded, |out| {
        for id in 0..FRAMES {
            thread::sleep(Duration::from_micros(500));
            out.emit(Frame::synthetic(id))?;
        }
        Ok(())
    });
    pipeline.stage(
        "remove-background",
        &loaded,
        &[&cleaned, &to_thumbnail],
        MapTransform::new("remove-background", remove_background),
    );
    pipeline.stage(
        "thumbnail",
        &to_thumbnail,
        &[&thumbnails],
        MapTransform::new("thumbnail", thumbnail),
    );

    let frame_bytes = Arc::new(AtomicU64::new(0));
    let thumb_bytes = Arc::new(AtomicU64::new(0));
    let written = Arc::clone(&frame_bytes);
    pipeline.sink("save-frame", &cleaned, move |item| {
        written.fetch_add(item.payload().pixels.len() as u64, Ordering::Relaxed);
        Ok(())
    });
    let written = Arc::clone(&thumb_bytes);
    let mut last_id = None;
    pipeline.sink("save-thumbnail", &thumbnails, move |item| {
        let frame = item.into_payload();
        if let Some(previous) = last_id {
            if frame.id != previous + 1 {
                return Err(format!("thumbnail {} arrived after {}", frame.id, previous).into());
            }
        }
        last_id = Some(frame.id);
        written.fetch_add(frame.pixels.len() as u64, Ordering::Relaxed);
        Ok(())
    });

    let stages = pipeline.stages().to_vec();
    let started = Instant::now();
    pipeline.run()?;
    let elapsed = started.elapsed();

    info!(
        frames = FRAMES,
        elapsed_ms = elapsed.as_millis() as u64,
        frame_bytes = frame_bytes.load(Ordering::Relaxed),
        thumbnail_bytes = thumb_bytes.load(Ordering::Relaxed),
        "done"
    );
    for stage in &stages {
        println!("{}: {}", stage.name(), stage.metrics().snapshot().format());
    }
    Ok(())
}
