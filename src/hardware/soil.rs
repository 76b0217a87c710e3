use std::thread;
use std::time::Duration;

use rppal::i2c::I2c;
use tracing::debug;

/// Default I2C address of the Adafruit STEMMA soil sensor.
pub const DEFAULT_SENSOR_ADDRESS: u16 = 0x36;

const STATUS_BASE: u8 = 0x00;
const STATUS_TEMP: u8 = 0x04;
const TOUCH_BASE: u8 = 0x0F;
const TOUCH_CHANNEL_OFFSET: u8 = 0x10;
const CONVERSION_DELAY: Duration = Duration::from_millis(5);
const MOISTURE_ATTEMPTS: u32 = 3;
/// The touch peripheral answers 0xFFFF while a conversion is still running.
const MOISTURE_NOT_READY: u16 = u16::MAX;

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("I2C error: {0}")]
    I2c(#[from] rppal::i2c::Error),

    #[error("Short read from sensor: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("Moisture reading not ready after {0} attempts")]
    NotReady(u32),
}

/// Soil temperature and capacitive moisture probe.
pub trait SoilSensor: Send {
    fn read_temperature(&mut self) -> Result<f32, SensorError>;

    /// Raw capacitance; lower is drier.
    fn read_moisture(&mut self) -> Result<u16, SensorError>;
}

/// Seesaw-based soil sensor on the Pi's primary I2C bus.
pub struct SeesawSoilSensor {
    bus: I2c,
}

impl SeesawSoilSensor {
    pub fn open(address: u16) -> Result<Self, SensorError> {
        let mut bus = I2c::new()?;
        bus.set_slave_address(address)?;
        debug!("Opened soil sensor at I2C address {:#04x}", address);
        Ok(Self { bus })
    }

    fn read_register(&mut self, base: u8, function: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        self.bus.write(&[base, function])?;
        thread::sleep(CONVERSION_DELAY);
        let got = self.bus.read(buf)?;
        if got != buf.len() {
            return Err(SensorError::ShortRead {
                expected: buf.len(),
                got,
            });
        }
        Ok(())
    }
}

impl SoilSensor for SeesawSoilSensor {
    fn read_temperature(&mut self) -> Result<f32, SensorError> {
        let mut buf = [0u8; 4];
        self.read_register(STATUS_BASE, STATUS_TEMP, &mut buf)?;
        Ok(temperature_from_raw(buf))
    }

    fn read_moisture(&mut self) -> Result<u16, SensorError> {
        for attempt in 1..=MOISTURE_ATTEMPTS {
            let mut buf = [0u8; 2];
            self.read_register(TOUCH_BASE, TOUCH_CHANNEL_OFFSET, &mut buf)?;
            let value = u16::from_be_bytes(buf);
            if value != MOISTURE_NOT_READY {
                return Ok(value);
            }
            debug!("Moisture conversion not ready (attempt {})", attempt);
        }
        Err(SensorError::NotReady(MOISTURE_ATTEMPTS))
    }
}

/// 16.16 fixed point, top two bits reserved.
fn temperature_from_raw(raw: [u8; 4]) -> f32 {
    let value = u32::from_be_bytes(raw) & 0x3FFF_FFFF;
    value as f32 / 65536.0
}
