use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use v4l_fanout::config::AppConfig;
use v4l_fanout::modules::{self, KernelModuleLoader, ModuleLoader};
use v4l_fanout::video::buffer_pool::Direction;
use v4l_fanout::video::format::PixelFormat;
use v4l_fanout::video::{DeviceHandle, Pipeline, Sink};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// v4l-fanout command line arguments
#[derive(Parser, Debug)]
#[command(name = "v4l-fanout")]
#[command(version, about = "Fan out one V4L2 capture device to loopback and encoder sinks", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Capture device (overrides config)
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<String>,

    /// Capture width (overrides config)
    #[arg(short = 'w', long)]
    width: Option<u32>,

    /// Capture height (overrides config)
    #[arg(short = 'H', long)]
    height: Option<u32>,

    /// Capture pixel format, UYVY or YUYV (overrides config)
    #[arg(short = 'f', long, value_name = "FOURCC")]
    format: Option<PixelFormat>,

    /// Log level
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v verbose, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting v4l-fanout v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    let loader = KernelModuleLoader;
    if config.loopback.enabled {
        modules::reload(
            &loader,
            &config.loopback.module_name,
            Path::new(&config.loopback.module_path),
            &config.loopback_params(),
        )?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                signal_stop.store(true, Ordering::Relaxed);
            }
            Err(e) => tracing::error!("Failed to install CTRL+C handler: {}", e),
        }
    });

    // The pipeline blocks on device ioctls, keep it off the async workers
    let pipeline_config = config.clone();
    let result =
        tokio::task::spawn_blocking(move || run_pipeline(&pipeline_config, &stop)).await?;

    if config.loopback.enabled {
        if let Err(e) = loader.unload(&config.loopback.module_name) {
            tracing::warn!("Failed to unload {}: {}", config.loopback.module_name, e);
        }
    }

    let frames = result.map_err(|e| {
        if e.is_startup() {
            tracing::error!("Startup failed: {}", e);
        }
        e
    })?;
    tracing::info!("Stopped after {} frames", frames);
    Ok(())
}

/// Open every device, stream until stopped, then release everything
fn run_pipeline(config: &AppConfig, stop: &AtomicBool) -> v4l_fanout::Result<u64> {
    let capture = DeviceHandle::open_configured(
        &config.capture.device,
        Direction::Capture,
        config.capture.resolution(),
        config.capture.format,
        config.capture.buffer_count,
    )?;
    let resolution = capture.resolution();

    let sinks = config
        .sinks
        .iter()
        .map(|sink| Sink::open(sink, resolution))
        .collect::<v4l_fanout::Result<Vec<_>>>()?;

    let mut pipeline = Pipeline::new(capture, sinks, config.capture.timeout())?;
    pipeline.start()?;

    let result = pipeline.run(stop);
    if let Err(e) = &result {
        tracing::error!("Pipeline failed: {}", e);
    }

    let stats = pipeline.stats();
    for (name, sink) in &stats.sinks {
        tracing::info!(
            "Sink {}: {} delivered, {} skipped, {} truncated",
            name,
            sink.delivered,
            sink.skipped,
            sink.truncated
        );
    }

    let shutdown = pipeline.shutdown();
    let frames = result?;
    shutdown?;
    Ok(frames)
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(device) = &args.device {
        config.capture.device = device.clone();
    }
    if let Some(width) = args.width {
        config.capture.width = width;
    }
    if let Some(height) = args.height {
        config.capture.height = height;
    }
    if let Some(format) = args.format {
        config.capture.format = format;
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "v4l_fanout=error",
        LogLevel::Warn => "v4l_fanout=warn",
        LogLevel::Info => "v4l_fanout=info",
        LogLevel::Verbose => "v4l_fanout=debug",
        LogLevel::Debug => "v4l_fanout=debug",
        LogLevel::Trace => "v4l_fanout=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
