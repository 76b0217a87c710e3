pub mod actuation;
pub mod cli;
pub mod config;
pub mod controller;
pub mod device;
pub mod hardware;
pub mod mqtt;
pub mod sun;

use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use rppal::gpio::Gpio;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::actuation::Arbiter;
use crate::cli::{Cli, Command, ConnectionArgs};
use crate::config::GardenConfig;
use crate::device::telemetry::TelemetryPublisher;
use crate::device::GardenDevice;
use crate::hardware::{GpioRelay, SeesawSoilSensor};
use crate::mqtt::config::{MqttConfig, TlsCredentials};
use crate::mqtt::MqttSession;
use crate::sun::{AstronomicalCalculator, Location, SunSchedule};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbosity.into())?;

    let config = GardenConfig::load(cli.config.as_deref()).await?;
    let mqtt_config = get_mqtt_conf(&cli.connection, &config);
    let role = cli.command.role();

    match cli.command {
        Command::Controller {
            action,
            listen_secs,
        } => {
            let (session, events) = MqttSession::connect(&mqtt_config).await?;
            controller::run(
                Box::new(session),
                events,
                action,
                Duration::from_secs(listen_secs),
            )
            .await?;
            Ok(())
        }
        Command::Sensor { .. } | Command::Automated(_) => {
            let interval = cli
                .command
                .interval()
                .unwrap_or(config.telemetry.interval_secs);
            if interval == 0 {
                return Err(eyre!("--interval must be at least 1 second"));
            }

            let schedule = match &cli.command {
                Command::Automated(args) => {
                    let location = Location::new(
                        args.city.clone(),
                        args.region.clone(),
                        &args.timezone,
                        args.lat,
                        args.longitude,
                    )?;
                    info!("Sun schedule for {}", location);
                    Some(SunSchedule::new(
                        Box::new(AstronomicalCalculator),
                        location,
                        config.schedule.sun_refresh_ticks,
                    ))
                }
                _ => None,
            };

            // Relays are forced off before the broker is contacted.
            let (arbiter, telemetry) = setup_hardware(&config)?;

            let (session, events) = MqttSession::connect(&mqtt_config).await?;
            let status = session.status();
            let device = GardenDevice::new(
                role,
                session,
                arbiter,
                telemetry,
                schedule,
                Duration::from_secs(interval),
            )?;

            if let Err(e) = device.run(events).await {
                let status = status.borrow().clone();
                error!(
                    "Device stopped: {} (connection {:?}, last error {:?})",
                    e, status.connection_state, status.last_error
                );
                return Err(e.into());
            }
            Ok(())
        }
    }
}

fn setup(level: LevelFilter) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(level);
    Ok(())
}

fn setup_logging_env(level: LevelFilter) {
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // RUST_LOG wins over --verbosity when it is set.
    if std::env::var("RUST_LOG").is_ok() {
        builder.with_env_filter(EnvFilter::from_default_env()).init();
    } else {
        builder.init();
    }
}

fn setup_hardware(config: &GardenConfig) -> Result<(Arbiter, TelemetryPublisher)> {
    let gpio = Gpio::new()?;
    let light = GpioRelay::open(&gpio, config.hardware.light_pin, "light")?;
    let pump = GpioRelay::open(&gpio, config.hardware.pump_pin, "pump")?;
    let arbiter = Arbiter::new(Box::new(light), Box::new(pump), config.arbiter_settings());
    info!(
        "Relays ready (light GPIO {}, pump GPIO {})",
        config.hardware.light_pin, config.hardware.pump_pin
    );

    let sensor = SeesawSoilSensor::open(config.hardware.sensor_address)?;
    info!("Soil sensor ready at {:#04x}", config.hardware.sensor_address);

    Ok((arbiter, TelemetryPublisher::new(Box::new(sensor))))
}

fn get_mqtt_conf(args: &ConnectionArgs, config: &GardenConfig) -> MqttConfig {
    MqttConfig {
        endpoint: args.endpoint.clone(),
        port: args.port.unwrap_or(config.mqtt.port),
        client_id: args.client_id.clone(),
        tls: config.mqtt.tls,
        credentials: TlsCredentials {
            cert: args.cert.clone(),
            key: args.key.clone(),
            root_ca: args.root_ca.clone(),
        },
        keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
        clean_session: false,
        connect_timeout: config.mqtt.connect_timeout_secs.map(Duration::from_secs),
        reconnect: config.backoff_settings(),
        channel_capacity: config.mqtt.channel_capacity,
    }
}
