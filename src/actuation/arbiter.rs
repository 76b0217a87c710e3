use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use super::Relay;
use crate::hardware::RelayDriver;
use crate::mqtt::messages::RelayStatus;

/// Where a relay request came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Remote,
    Local,
}

/// Outcome of a relay request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Switched { on: bool },
    Unchanged,
    /// Pump activation refused; `remaining` is what is left of the cooldown.
    Blocked { remaining: Duration },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArbiterSettings {
    pub moisture_threshold: u16,
    pub pump_cooldown: Duration,
}

impl Default for ArbiterSettings {
    fn default() -> Self {
        Self {
            moisture_threshold: 400,
            pump_cooldown: Duration::minutes(10),
        }
    }
}

/// Sole owner of relay state.
#[derive(Debug)]
pub struct Arbiter {
    light: Box<dyn RelayDriver>,
    pump: Box<dyn RelayDriver>,
    light_on: bool,
    pump_on: bool,
    pump_last_on: Option<DateTime<Utc>>,
    settings: ArbiterSettings,
}

impl Arbiter {
    /// Takes over both relays and switches them off.
    pub fn new(
        mut light: Box<dyn RelayDriver>,
        mut pump: Box<dyn RelayDriver>,
        settings: ArbiterSettings,
    ) -> Self {
        for (relay, driver) in [(Relay::Light, &mut light), (Relay::Pump, &mut pump)] {
            if let Err(e) = driver.set(false) {
                error!("Failed to switch {} relay off at startup: {}", relay, e);
            }
        }
        let light_on = light.get();
        let pump_on = pump.get();
        Self {
            light,
            pump,
            light_on,
            pump_on,
            pump_last_on: None,
            settings,
        }
    }

    pub fn settings(&self) -> &ArbiterSettings {
        &self.settings
    }

    pub fn is_on(&self, relay: Relay) -> bool {
        match relay {
            Relay::Light => self.light_on,
            Relay::Pump => self.pump_on,
        }
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus::new(self.light_on, self.pump_on)
    }

    pub fn pump_last_on(&self) -> Option<DateTime<Utc>> {
        self.pump_last_on
    }

    /// Time left before the pump may be switched on again, if any.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last_on = self.pump_last_on?;
        let remaining = self.settings.pump_cooldown - (now - last_on);
        (remaining > Duration::zero()).then_some(remaining)
    }

    /// Pump rule: water while the soil reads drier than the threshold.
    pub fn pump_desired(&self, capacitance: u16) -> bool {
        capacitance < self.settings.moisture_threshold
    }

    pub fn request(
        &mut self,
        relay: Relay,
        on: bool,
        source: Source,
        now: DateTime<Utc>,
    ) -> Transition {
        if self.is_on(relay) == on {
            debug!("{:?} request keeps {} {}", source, relay, on_off(on));
            return Transition::Unchanged;
        }

        if relay == Relay::Pump && on {
            if let Some(remaining) = self.cooldown_remaining(now) {
                info!(
                    "Pump timeout engaged; ignoring {:?} request ({}s left)",
                    source,
                    remaining.num_seconds()
                );
                return Transition::Blocked { remaining };
            }
        }

        let driver = match relay {
            Relay::Light => &mut self.light,
            Relay::Pump => &mut self.pump,
        };
        if let Err(e) = driver.set(on) {
            warn!("Failed to switch {} {}: {}", relay, on_off(on), e);
            return Transition::Unchanged;
        }

        match relay {
            Relay::Light => self.light_on = on,
            Relay::Pump => {
                self.pump_on = on;
                if on {
                    self.pump_last_on = Some(now);
                }
            }
        }
        info!("{} switched {} ({:?})", relay, on_off(on), source);
        Transition::Switched { on }
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}
