//! Relay arbitration for the garden device.
//!
//! ```text
//! remote command ──► FreshnessFilter ──┐
//!                                      ├──► Arbiter ──► RelayDriver
//! local rule (sun, moisture) ──────────┘      (cooldown guard)
//! ```
//!
//! Both sources pass the same freshness filter, so whichever command is newest
//! wins. The pump's cooldown applies to every source.

pub mod arbiter;
pub mod freshness;

use std::fmt;

pub use arbiter::{Arbiter, ArbiterSettings, Source, Transition};
pub use freshness::FreshnessFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Relay {
    Light,
    Pump,
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Relay::Light => f.write_str("light"),
            Relay::Pump => f.write_str("pump"),
        }
    }
}
