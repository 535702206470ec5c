//! `dashrec` - CLI for the dashcam recorder
//!
//! This binary runs the recorder and provides maintenance commands for the
//! clip directory and configuration.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;

use dashrec::cli::{Cli, ClipsCommand, Command, ConfigCommand, RunCommand};
use dashrec::{init_logging, Config, Recorder, StorageManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    match cli.command {
        Command::Run(run_cmd) => handle_run(&config, &run_cmd).await,
        Command::Status(status_cmd) => handle_status(&config, status_cmd.json),
        Command::Clips(clips_cmd) => handle_clips(&config, &clips_cmd),
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
    }
}

fn storage(config: &Config) -> StorageManager {
    StorageManager::new(
        config.clips_dir(),
        config.clips.max_storage_bytes,
        config.clips.eviction_target_ratio,
    )
}

async fn handle_run(config: &Config, cmd: &RunCommand) -> anyhow::Result<()> {
    let recorder = Recorder::start(config, cmd.options()).context("starting recorder")?;
    let report = recorder.run_until_shutdown().await?;
    if !report.drained {
        eprintln!("warning: some clip extractions were abandoned at shutdown");
    }
    Ok(())
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let storage = storage(config);
    let stats = storage
        .stats()
        .with_context(|| format!("reading {}", storage.dir().display()))?;

    if json {
        let status = serde_json::json!({
            "clips_dir": storage.dir(),
            "storage": stats,
            "camera": {
                "backend": config.camera.backend.to_string(),
                "resolution": format!("{}x{}", config.camera.width, config.camera.height),
                "frame_rate": config.camera.frame_rate,
            },
            "buffer_frames": config.buffer_capacity(),
            "sensor_enabled": config.sensor.enabled,
            "upload_enabled": config.upload.enabled,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("dashrec status");
        println!("--------------");
        println!("Clip directory: {}", storage.dir().display());
        println!(
            "Clips:          {} ({} of {} bytes)",
            stats.clip_count, stats.total_bytes, stats.max_bytes
        );
        if let (Some(oldest), Some(newest)) = (stats.oldest_clip, stats.newest_clip) {
            println!("Oldest:         {}", oldest.format("%Y-%m-%d %H:%M:%S"));
            println!("Newest:         {}", newest.format("%Y-%m-%d %H:%M:%S"));
        }
        println!(
            "Camera:         {} {}x{} @ {} fps",
            config.camera.backend,
            config.camera.width,
            config.camera.height,
            config.camera.frame_rate
        );
        println!(
            "Buffer:         {} s ({} frames)",
            config.buffer.duration_seconds,
            config.buffer_capacity()
        );
        println!("Sensor:         {}", on_off(config.sensor.enabled));
        println!("Upload:         {}", on_off(config.upload.enabled));
    }
    Ok(())
}

fn handle_clips(config: &Config, cmd: &ClipsCommand) -> anyhow::Result<()> {
    let storage = storage(config);
    match cmd {
        ClipsCommand::List { json } => {
            let clips = storage.list_clips()?;
            if *json {
                let entries: Vec<_> = clips
                    .iter()
                    .map(|clip| {
                        serde_json::json!({
                            "path": clip.path,
                            "event_type": clip.name.event_type.to_string(),
                            "size_bytes": clip.size,
                            "modified": DateTime::<Utc>::from(clip.modified),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if clips.is_empty() {
                println!("No clips in {}", storage.dir().display());
            } else {
                for clip in &clips {
                    println!(
                        "{}  {:>12}  {}",
                        DateTime::<Utc>::from(clip.modified).format("%Y-%m-%d %H:%M:%S"),
                        clip.size,
                        clip.path.display()
                    );
                }
            }
        }
        ClipsCommand::Prune => {
            // Partial files may belong to a running recorder; only the
            // recorder's own startup sweeps them.
            let report = storage.enforce_quota()?;
            println!(
                "Removed {} clips ({} -> {} bytes)",
                report.deleted.len(),
                report.total_before,
                report.total_after
            );
            for path in &report.failed {
                eprintln!("could not remove {}", path.display());
            }
        }
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Camera]");
                println!("  Backend:            {}", config.camera.backend);
                println!("  Device:             {}", config.camera.device.display());
                println!(
                    "  Resolution:         {}x{}",
                    config.camera.width, config.camera.height
                );
                println!("  Frame rate:         {}", config.camera.frame_rate);
                println!();
                println!("[Buffer]");
                println!("  Duration (s):       {}", config.buffer.duration_seconds);
                println!();
                println!("[Clips]");
                println!("  Directory:          {}", config.clips_dir().display());
                println!("  Max bytes:          {}", config.clips.max_storage_bytes);
                println!(
                    "  Concurrent:         {}",
                    config.clips.max_concurrent_extractions
                );
                println!();
                println!("[Events]");
                for event_type in dashrec::clip::EventType::ALL {
                    let window = config.events.window(event_type);
                    println!(
                        "  {:<19} -{}s / +{}s",
                        format!("{event_type}:"),
                        window.seconds_before,
                        window.seconds_after
                    );
                }
                println!();
                println!("[Sensor]");
                println!("  Enabled:            {}", config.sensor.enabled);
                println!("  Port:               {}", config.sensor.port.display());
                println!();
                println!("[Upload]");
                println!("  Enabled:            {}", config.upload.enabled);
                println!(
                    "  Server:             {}",
                    config.upload.server_url.as_deref().unwrap_or("-")
                );
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}
