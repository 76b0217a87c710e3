//! Garden peripherals on the Raspberry Pi: the two relays on GPIO and the soil
//! probe on I2C. The arbiter and the telemetry publisher only see the
//! [`RelayDriver`] and [`SoilSensor`] traits.

pub mod relay;
pub mod soil;

pub use relay::{GpioRelay, RelayDriver, RelayError};
pub use soil::{SeesawSoilSensor, SensorError, SoilSensor};
