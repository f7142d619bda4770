//! Headless driver for the load-cell acquisition engine.
//!
//! Connects to the sensor, runs one continuous acquisition until Ctrl+C or
//! the optional duration elapses, exports the histories and disconnects.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use loadcell_common::{LogFormat, LoggingConfig};
use loadcell_daq::mock::MockTransport;
use loadcell_daq::sinks::{DisplayFormat, DisplaySink};
use loadcell_daq::{DaqConfig, RegisterTransport, RunController, WorkerEvent};
use tracing::{error, info, warn};

/// Load-cell acquisition over Modbus RTU.
#[derive(Parser, Debug)]
#[command(name = "loadcell-daq")]
#[command(about = "Polls a Modbus RTU load cell and exports the run")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "loadcell.json5")]
    config: PathBuf,

    /// Serial port, overriding the configuration. Without a config file,
    /// defaults are used for everything else.
    #[arg(short, long)]
    port: Option<String>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Reference load for the friction ratio, overriding the configuration.
    #[arg(long)]
    reference_load: Option<f64>,

    /// Stop the run automatically after this many seconds.
    #[arg(short, long, value_parser = parse_duration)]
    duration: Option<Duration>,

    /// Take a single reading and exit.
    #[arg(long)]
    single: bool,

    /// Do not export the run.
    #[arg(long)]
    no_export: bool,

    /// Use a simulated sensor instead of the serial port.
    #[arg(long)]
    demo: bool,
}

fn parse_duration(value: &str) -> Result<Duration> {
    let secs: f64 = value
        .parse()
        .with_context(|| format!("'{}' is not a number of seconds", value))?;
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("'{}' is not a valid run duration", value))
}

fn load_config(args: &Args) -> Result<DaqConfig> {
    let mut config = match (&args.port, args.config.exists()) {
        (Some(port), false) => DaqConfig::for_port(port.clone()),
        (None, false) if args.demo => DaqConfig::for_port("demo"),
        _ => DaqConfig::load_from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?,
    };

    if let Some(port) = &args.port {
        config.serial.port = port.clone();
    }
    if let Some(load) = args.reference_load {
        config.session.reference_load = load;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    loadcell_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting loadcell-daq");

    let display = match config.logging.format {
        LogFormat::Text => DisplayFormat::Text,
        LogFormat::Json => DisplayFormat::Json,
    };

    if args.demo {
        info!("Using simulated sensor");
        let ctl = RunController::with_transport(MockTransport::demo(), &config)?;
        drive(ctl, &args, display).await
    } else {
        let ctl = RunController::connect(&config)
            .await
            .with_context(|| format!("Failed to connect to {}", config.serial.port))?;
        drive(ctl, &args, display).await
    }
}

async fn drive<T: RegisterTransport>(
    mut ctl: RunController<T>,
    args: &Args,
    display: DisplayFormat,
) -> Result<()> {
    ctl.add_sink(DisplaySink::new(std::io::stdout()).with_format(display));

    if args.single {
        ctl.read_once().await.context("Single read failed")?;
        ctl.disconnect().await?;
        return Ok(());
    }

    ctl.continue_run().await?;

    let deadline = async {
        match args.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut stopping = false;
    let mut failure = None;

    loop {
        tokio::select! {
            event = ctl.next_event() => match event {
                Some(WorkerEvent::Failed(e)) => failure = Some(e),
                Some(_) => {}
                None => break,
            },
            _ = &mut ctrl_c, if !stopping => {
                info!("Received shutdown signal");
                stopping = ctl.stop();
            }
            _ = &mut deadline, if !stopping => {
                info!("Run duration elapsed");
                stopping = ctl.stop();
            }
        }
    }

    ctl.wait_finished().await?;

    if !args.no_export {
        match ctl.save() {
            Ok(path) => info!(path = %path.display(), "Saved run"),
            Err(e) => warn!(error = %e, "Export skipped"),
        }
    }

    ctl.disconnect().await?;
    info!("loadcell-daq stopped");

    if let Some(e) = failure {
        error!(error = %e, "Run ended with an error");
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2.5").unwrap(), Duration::from_millis(2500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_rejects_out_of_range() {
        for value in ["inf", "NaN", "1e30", "-1", "soon"] {
            assert!(parse_duration(value).is_err(), "{} accepted", value);
        }
    }

    #[test]
    fn test_args_reject_infinite_duration() {
        assert!(Args::try_parse_from(["loadcell-daq", "--duration", "inf"]).is_err());

        let args = Args::try_parse_from(["loadcell-daq", "-d", "10", "--demo"]).unwrap();
        assert_eq!(args.duration, Some(Duration::from_secs(10)));
        assert!(args.demo);
    }
}
