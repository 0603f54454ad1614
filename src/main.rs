//! framepipe demo: a synthetic camera feeding the frame-processing pipeline

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use color_eyre::{eyre::bail, Result};
use tracing::{debug, error, info, warn};

use framepipe::capture::{Frame, SyntheticCamera};
use framepipe::pipeline::{Dispatcher, Enqueued, ErrorBridge, Processor, TargetFps};
use framepipe::plugin::{builtin, PluginArgs, PluginOptions, PluginRegistry};
use framepipe::{utils, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    utils::init_tracing("framepipe=debug");

    info!("framepipe launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    framepipe::CONFIG.store(Arc::new(config.clone()));

    // Plugins register before anything resolves them
    let registry = PluginRegistry::new();
    builtin::register_builtins(&registry);
    let mut luminance_options = PluginOptions::new();
    luminance_options.insert("step".into(), 16.into());
    let luminance = registry.resolve(builtin::LUMINANCE, &luminance_options)?;
    let frame_info = registry.resolve(builtin::FRAME_INFO, &PluginOptions::new())?;

    let (bridge, errors) = ErrorBridge::channel();
    let dispatcher = Arc::new(Dispatcher::with_worker(&config.pipeline, bridge)?);
    let snapshots = dispatcher.offload_queue("snapshots")?;

    let demo = config.demo.clone();
    let throttle = TargetFps::new(demo.offload_fps);
    dispatcher.set_processor(Some(Processor::new("demo", move |frame: &Frame| {
        let stats = luminance.call(frame, &PluginArgs::new())?;
        debug!(sequence = frame.sequence(), mean = %stats["mean"], "luminance");

        let info_plugin = frame_info.clone();
        let offload_ms = demo.offload_ms;
        let submitted = throttle
            .run(frame, || {
                snapshots.enqueue(frame, move |frame| {
                    let info = info_plugin.call(frame, &PluginArgs::new())?;
                    thread::sleep(Duration::from_millis(offload_ms));
                    info!(sequence = frame.sequence(), %info, "snapshot processed");
                    Ok(())
                })
            })?
            .transpose()?;
        if submitted == Some(Enqueued::Dropped) {
            debug!(sequence = frame.sequence(), "snapshot queue busy");
        }

        if demo.fail_every > 0 && frame.sequence() > 0 && frame.sequence() % demo.fail_every == 0 {
            bail!("synthetic failure on frame {}", frame.sequence());
        }
        thread::sleep(Duration::from_millis(demo.processor_ms));
        Ok(())
    })));

    // Controlling context: receive processing failures
    let error_task = tokio::spawn(errors.run(|e| {
        error!(kind = ?e.kind, source = %e.source, sequence = e.sequence, "{}", e.message);
    }));

    // Spawn capture on a blocking thread
    let mut camera = SyntheticCamera::new(config.capture.clone());
    let stop = camera.stop_handle();
    let capture_dispatcher = Arc::clone(&dispatcher);
    let frames = config.demo.frames;
    let mut capture_handle = tokio::task::spawn_blocking(move || {
        let report = camera.run(&capture_dispatcher, frames);
        (report, camera.pool().stats())
    });

    let (report, pool) = tokio::select! {
        joined = &mut capture_handle => joined?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping capture");
            stop.store(true, Ordering::Relaxed);
            capture_handle.await?
        }
    };

    info!(
        captured = report.captured,
        scheduled = report.scheduled,
        dropped = report.dropped(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Capture finished"
    );

    // Let in-flight work finish, then tear down so the error loop ends
    dispatcher.set_processor(None);
    while dispatcher.is_busy() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    info!(stats = ?dispatcher.stats(), pool = ?pool, "Pipeline stats");
    drop(dispatcher);

    if tokio::time::timeout(Duration::from_secs(2), error_task)
        .await
        .is_err()
    {
        warn!("Error handler did not shut down in time");
    }

    info!("framepipe shutting down");
    Ok(())
}
