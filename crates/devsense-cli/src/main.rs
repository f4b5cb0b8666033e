//! Devsense - Main entry point
//!
//! Detects the host device from configured readings, loads capability
//! modules and prints the result as JSON.

mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use devsense_core::{
    DetectorEvent, DetectorEventKind, DeviceDetector, LoaderEvent, LoaderEventKind,
    ModuleLoader, ModuleRegistry, StaticEnvironment, TtlCache, Viewport,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "devsense")]
#[command(about = "Device detection and capability module loader")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "devsense.toml")]
    config: PathBuf,

    /// Write the default configuration to the config path and exit
    #[arg(long)]
    init_config: bool,

    /// Viewport width override
    #[arg(long)]
    width: Option<u32>,

    /// Viewport height override
    #[arg(long)]
    height: Option<u32>,

    /// User-agent override
    #[arg(short, long)]
    user_agent: Option<String>,

    /// Modules to load, replacing the configured list
    #[arg(short, long, value_delimiter = ',')]
    modules: Vec<String>,

    /// Simulated resizes applied after start, as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size)]
    resize: Vec<(u32, u32)>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_size(raw: &str) -> Result<(u32, u32)> {
    let Some((width, height)) = raw.split_once(['x', 'X']) else {
        bail!("expected WIDTHxHEIGHT, got {raw:?}");
    };
    let width = width.trim().parse().context("invalid width")?;
    let height = height.trim().parse().context("invalid height")?;
    Ok((width, height))
}

fn event_json(event: &DetectorEvent) -> Value {
    match event {
        DetectorEvent::DeviceChange(info) => json!({ "event": event.kind().as_str(), "device": info }),
        DetectorEvent::OrientationChange(orientation) => {
            json!({ "event": event.kind().as_str(), "orientation": orientation })
        }
        DetectorEvent::Resize { width, height } => {
            json!({ "event": event.kind().as_str(), "width": width, "height": height })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Devsense v{}", env!("CARGO_PKG_VERSION"));

    if args.init_config {
        config::save_default_config(&args.config)?;
        return Ok(());
    }

    let mut config = config::load_config(&args.config)?;

    if let Some(width) = args.width {
        config.host.width = width;
    }
    if let Some(height) = args.height {
        config.host.height = height;
    }
    if let Some(user_agent) = args.user_agent {
        config.host.user_agent = user_agent;
    }
    if !args.modules.is_empty() {
        config.host.modules = args.modules;
    }

    info!(
        width = config.host.width,
        height = config.host.height,
        modules = ?config.host.modules,
        "Configuration loaded"
    );

    let env = Arc::new(StaticEnvironment::new(
        Viewport {
            width: config.host.width,
            height: config.host.height,
            pixel_ratio: config.host.pixel_ratio,
        },
        config.host.user_agent.clone(),
    ));
    env.set_max_touch_points(config.host.max_touch_points);

    let loader = ModuleLoader::new(ModuleRegistry::builtin(), config.loader.clone());
    loader.events().on(LoaderEventKind::ModuleFailed, |event: &LoaderEvent| {
        if let LoaderEvent::ModuleFailed { name, error } = event {
            warn!(module = %name, %error, "Module failed to load");
        }
        Ok(())
    });

    let cache = Arc::new(TtlCache::from_config(&config.cache));
    let detector =
        DeviceDetector::with_parts(env.clone(), loader, cache, config.detector.clone());

    let events = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        DetectorEventKind::DeviceChange,
        DetectorEventKind::OrientationChange,
        DetectorEventKind::Resize,
    ] {
        let events = events.clone();
        detector.events().on(kind, move |event: &DetectorEvent| {
            events.lock().push(event_json(event));
            Ok(())
        });
    }

    let mut modules = Map::new();
    let mut errors = Map::new();
    for name in &config.host.modules {
        match detector.load_module::<Value>(name).await {
            Ok(data) => {
                modules.insert(name.clone(), data);
            }
            Err(err) => {
                errors.insert(name.clone(), Value::String(err.to_string()));
            }
        }
    }

    if !args.resize.is_empty() {
        for (width, height) in &args.resize {
            env.resize(*width, *height);
        }
        if config.detector.enable_resize {
            // Let the debounced refresh run
            tokio::time::sleep(config.detector.debounce_delay() * 2).await;
        } else {
            detector.refresh();
        }
    }

    let stats: Map<String, Value> = detector
        .loader()
        .all_loading_stats()
        .into_iter()
        .map(|(name, stats)| Ok((name, serde_json::to_value(stats)?)))
        .collect::<Result<_, serde_json::Error>>()?;

    let report = json!({
        "device": detector.device_info(),
        "events": *events.lock(),
        "modules": modules,
        "errors": errors,
        "loading_stats": stats,
        "cache": detector.cache().stats(),
    });

    detector.destroy().await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !errors.is_empty() {
        bail!("{} module(s) failed to load", errors.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("390x844").unwrap(), (390, 844));
        assert_eq!(parse_size("1024X768").unwrap(), (1024, 768));
        assert!(parse_size("1024").is_err());
        assert!(parse_size("wide x 10").is_err());
    }

    #[test]
    fn test_event_json() {
        let value = event_json(&DetectorEvent::Resize {
            width: 10,
            height: 20,
        });
        assert_eq!(value, json!({ "event": "resize", "width": 10, "height": 20 }));
    }

    #[test]
    fn test_args_split_modules() {
        let args = Args::parse_from(["devsense", "--modules", "platform,network", "--resize", "600x800"]);
        assert_eq!(args.modules, vec!["platform", "network"]);
        assert_eq!(args.resize, vec![(600, 800)]);
        assert!(!args.init_config);
    }
}
