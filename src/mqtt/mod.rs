//! # MQTT Integration Module
//!
//! Everything the garden roles need from the broker:
//!
//! ```text
//! mqtt/
//! ├── config.rs       - Connection settings and TLS material
//! ├── messages.rs     - Topics and JSON payloads
//! ├── resubscribe.rs  - Restores the subscription set after a lost session
//! └── session.rs      - rumqttc event loop, reconnects and the event channel
//! ```
//!
//! The session is durable (clean session off), so the broker normally keeps our
//! subscriptions across reconnects. When it does not, the resubscription manager
//! reinstalls the full set and treats any refused topic as fatal.

pub mod config;
pub mod messages;
pub mod resubscribe;
pub mod session;

pub use session::{MqttSession, SessionError, SessionEvent, Transport};
