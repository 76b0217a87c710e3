use std::fmt;

use rppal::gpio::{Gpio, OutputPin};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("Relay {0} did not switch")]
    Stuck(String),
}

/// A single relay output.
pub trait RelayDriver: Send + fmt::Debug {
    fn set(&mut self, on: bool) -> Result<(), RelayError>;

    fn get(&self) -> bool;
}

/// Relay wired to a BCM-numbered GPIO pin, active high.
#[derive(Debug)]
pub struct GpioRelay {
    label: &'static str,
    pin: OutputPin,
}

impl GpioRelay {
    /// Claims the pin and drives it low.
    pub fn open(gpio: &Gpio, bcm_pin: u8, label: &'static str) -> Result<Self, RelayError> {
        let pin = gpio.get(bcm_pin)?.into_output_low();
        debug!("Claimed GPIO {} for the {} relay", bcm_pin, label);
        Ok(Self { label, pin })
    }
}

impl RelayDriver for GpioRelay {
    fn set(&mut self, on: bool) -> Result<(), RelayError> {
        if on {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        if self.pin.is_set_high() != on {
            return Err(RelayError::Stuck(self.label.to_string()));
        }
        Ok(())
    }

    fn get(&self) -> bool {
        self.pin.is_set_high()
    }
}
