//! Modbus adapter daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use common::logging::{self, LogConfig};
use modlinkd::blocks::build_device_map;
use modlinkd::model::RegisterType;
use modlinkd::{AdapterConfig, LinkError, LoggingSink, Master, Mode, Slave, ValueSink};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "modlinkd",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus master/slave adapter",
    long_about = None
)]
struct Args {
    /// Configuration file (yaml, json or toml)
    #[arg(short = 'c', long, env = "MODLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured mode
    #[arg(short = 'm', long, value_enum)]
    mode: Option<Mode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "MODLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Directory for daily rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Validation mode - only validate configuration without starting
    #[arg(long)]
    validate: bool,

    /// With --validate, print the resolved configuration as YAML
    #[arg(long, requires = "validate")]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AdapterConfig::load(args.config.as_deref())
        .with_context(|| format!("Failed to load configuration {:?}", args.config))?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(dir) = args.log_dir {
        config.logging.dir = Some(dir);
    }

    logging::init_with_config(LogConfig {
        level: config.logging.level.clone(),
        log_dir: config.logging.dir.clone(),
        enable_json: config.logging.json,
        ansi: !args.no_color,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let devices = build_device_map(&config).context("Invalid register configuration")?;

    if args.validate {
        for device in devices.values() {
            for register_type in RegisterType::ALL {
                let set = device.set(register_type);
                if !set.descriptors.is_empty() {
                    info!(
                        "Unit {} {}: {} points, {} blocks",
                        device.unit_id,
                        register_type,
                        set.descriptors.len(),
                        set.blocks.len()
                    );
                }
            }
        }
        if args.print_config {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        info!("Validation completed successfully");
        return Ok(());
    }

    info!(
        "modlinkd {} starting in {} mode",
        env!("CARGO_PKG_VERSION"),
        config.mode
    );
    let host: Arc<dyn ValueSink> = Arc::new(LoggingSink);
    let shutdown = common::shutdown::shutdown_token();

    let result = match config.mode {
        Mode::Master => {
            let master = Master::new(config, devices, host);
            let handle = master.handle();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                stop.cancelled().await;
                handle.stop();
            });
            master.run().await
        },
        Mode::Slave => Slave::new(config, &devices, host).run(shutdown).await,
    };

    if let Err(e) = result {
        error!("modlinkd stopped: {}", e);
        exit(&e);
    }
    info!("modlinkd stopped");
    Ok(())
}

fn exit(err: &LinkError) -> ! {
    std::process::exit(err.exit_code())
}
