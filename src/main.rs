//! cambackend - Device Lister
//!
//! Lists attached cameras by family, optionally recording the session to a
//! log or replaying one.
//!
//! ```text
//! cambackend [standard]
//! cambackend record <log> [section] [best_quality|compressed|blank_frames]
//! cambackend playback <log> [section]
//! cambackend sections <log>
//! ```

use anyhow::{bail, Context as _};
use cambackend::{
    session::SessionLog, BackendMode, Context, CoreConfig, DeviceInfo, RecordingMode,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_recording_mode(value: &str) -> anyhow::Result<RecordingMode> {
    RecordingMode::all()
        .iter()
        .copied()
        .find(|mode| {
            serde_json::to_value(mode)
                .ok()
                .and_then(|v| v.as_str().map(|s| s == value))
                .unwrap_or(false)
        })
        .with_context(|| format!("unknown recording mode '{}'", value))
}

fn print_devices(devices: &[DeviceInfo]) {
    if devices.is_empty() {
        println!("No devices found");
        return;
    }
    for (index, device) in devices.iter().enumerate() {
        println!("{}: {}", index, device);
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cambackend=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("standard");

    if command == "sections" {
        let path = args.get(1).context("sections requires a log path")?;
        for name in SessionLog::sections(path)? {
            println!("{}", name);
        }
        return Ok(());
    }

    let mode = match command {
        "standard" => BackendMode::Standard,
        "record" => BackendMode::Record,
        "playback" => BackendMode::Playback,
        other => bail!("unknown command '{}'", other),
    };

    let mut builder = Context::builder(mode).config(CoreConfig::load_or_default());
    if mode.requires_log() {
        let path = args
            .get(1)
            .with_context(|| format!("{} requires a log path", mode))?;
        builder = builder.log_path(path);
        if let Some(section) = args.get(2) {
            builder = builder.section(section.as_str());
        }
        if let Some(value) = args.get(3) {
            builder = builder.recording_mode(parse_recording_mode(value)?);
        }
    }

    let ctx = builder.build().context("failed to create context")?;
    tracing::info!("Querying devices ({} mode)", ctx.mode());
    let devices = ctx.query_devices().context("device query failed")?;
    print_devices(&devices);

    Ok(())
}
