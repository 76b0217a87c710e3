use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::controller::Action;
use crate::device::DeviceRole;

#[derive(Parser, Debug)]
#[command(name = "garden-link", version, about = "MQTT garden sensor, automation and controller")]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Log level
    #[arg(long, value_enum, default_value_t = Verbosity::Info, global = true)]
    pub verbosity: Verbosity,

    /// Config file, defaults to ~/.config/garden-link/config.toml when present
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Broker host name
    #[arg(long)]
    pub endpoint: String,

    /// Broker port, overrides the config file
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Client certificate (PEM)
    #[arg(long, value_name = "FILE", global = true)]
    pub cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, value_name = "FILE", global = true)]
    pub key: Option<PathBuf>,

    /// Root CA used to verify the broker (PEM)
    #[arg(long = "root-ca", value_name = "FILE", global = true)]
    pub root_ca: Option<PathBuf>,

    #[arg(long = "client-id", default_value = "gardenClient", global = true)]
    pub client_id: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Publish telemetry and apply remote light/water commands
    Sensor {
        /// Seconds between control cycles, overrides the config file
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Sensor plus sun schedule and moisture rules
    Automated(AutomatedArgs),
    /// Send a single command and exit
    Controller {
        #[arg(long, value_enum, default_value_t = Action::Noop)]
        action: Action,

        /// Seconds to keep logging sensor data after the command
        #[arg(long = "listen-secs", default_value_t = 0)]
        listen_secs: u64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct AutomatedArgs {
    #[arg(long)]
    pub city: String,

    #[arg(long)]
    pub region: String,

    /// IANA timezone, e.g. America/New_York
    #[arg(long)]
    pub timezone: String,

    #[arg(long, allow_negative_numbers = true)]
    pub lat: f64,

    #[arg(long = "long", allow_negative_numbers = true)]
    pub longitude: f64,

    /// Seconds between control cycles, overrides the config file
    #[arg(long)]
    pub interval: Option<u64>,
}

impl Command {
    pub fn role(&self) -> DeviceRole {
        match self {
            Command::Sensor { .. } => DeviceRole::Sensor,
            Command::Automated(_) => DeviceRole::Automated,
            Command::Controller { .. } => DeviceRole::Controller,
        }
    }

    pub fn interval(&self) -> Option<u64> {
        match self {
            Command::Sensor { interval } => *interval,
            Command::Automated(args) => args.interval,
            Command::Controller { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Verbosity {
    NoLogs,
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<Verbosity> for LevelFilter {
    fn from(verbosity: Verbosity) -> Self {
        match verbosity {
            Verbosity::NoLogs => LevelFilter::OFF,
            // tracing has no separate fatal level
            Verbosity::Fatal | Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warn => LevelFilter::WARN,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}
