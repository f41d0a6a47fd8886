use clap::{ArgAction, Parser};
use log::LevelFilter;
use std::path::PathBuf;

/// i2c_boardd: daemon for PCA9685/HT16K33 peripheral boards on I2C
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: $I2C_BOARDD_CONFIG, ~/.config or /etc)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach and log to syslog
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Use an in-memory reference board instead of /dev/i2c-* nodes
    #[arg(long)]
    pub simulate: bool,

    /// Print responding addresses on every bus and exit
    #[arg(long)]
    pub scan: bool,

    /// Select chips even when a kernel driver has claimed them
    #[arg(long)]
    pub force: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_run_in_foreground() {
        let cli = Cli::try_parse_from(["i2c_boardd"]).unwrap();
        assert!(!cli.daemonize);
        assert!(!cli.simulate);
        assert!(!cli.scan);
        assert!(!cli.force);
        assert_eq!(cli.config, None);
        assert_eq!(cli.log_level(), LevelFilter::Info);
    }

    #[test]
    fn flags_are_parsed() {
        let cli = Cli::try_parse_from([
            "i2c_boardd",
            "-c",
            "/tmp/board.yml",
            "--simulate",
            "--force",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/board.yml")));
        assert!(cli.simulate);
        assert!(cli.force);
        assert_eq!(cli.log_level(), LevelFilter::Trace);
    }
}
