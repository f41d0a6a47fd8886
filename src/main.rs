use std::fs::File;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, info};
use syslog::{BasicLogger, Facility, Formatter3164};

use i2c_boardd::{
    bus::{BusId, sim::SimulatedBus},
    cli::Cli,
    config::ConfigManager,
    daemon,
    manager::DeviceManager,
};

fn init_syslog(level: LevelFilter) -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "i2c_boardd".into(),
        pid: 0,
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|_| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn init_terminal_log(level: LevelFilter) -> Result<()> {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.try_init().context("Failed to initialize logger")
}

fn into_daemon() -> Result<()> {
    File::create("/var/tmp/i2c_boardd.log")
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.daemonize {
        init_syslog(cli.log_level())?;
    } else {
        init_terminal_log(cli.log_level())?;
    }

    // Resolved before forking: the daemon runs from `/`.
    let config = ConfigManager::load_or_default(cli.config.clone())?
        .get()
        .clone();

    if cli.daemonize {
        into_daemon()?;
    }

    let mut manager =
        DeviceManager::from_config(&config).with_forced_select(cli.force || config.bus.force);
    if cli.simulate {
        info!("Using simulated board on bus {}", config.bus.first);
        manager.attach_bus(BusId(config.bus.first), SimulatedBus::board("simulated"))?;
    } else {
        manager.scan_buses(config.bus.first..=config.bus.last);
    }

    if cli.scan {
        for (bus, addresses) in manager.scan_addresses(config.scan.start, config.scan.end) {
            let found: Vec<String> = addresses.iter().map(ToString::to_string).collect();
            println!("{bus}: {}", found.join(" "));
        }
        return Ok(());
    }

    manager.scan_devices();

    // Built after forking; the runtime's threads would not survive it.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?
        .block_on(daemon::run(manager, config))
}
