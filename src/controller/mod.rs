//! Manual controller role.
//!
//! A bounded run driven by a typestate machine:
//!
//! ```text
//! Connected ─subscribe─► Subscribed ─dispatch─► Dispatched ─finish─► (disconnected)
//!                                              (listen)
//! ```
//!
//! The controller subscribes to `garden/sensorData`, optionally publishes one
//! light or water command, and can stay around for a while to log the sensor
//! data that comes back.

pub mod lifecycle;

use std::time::Duration;

use chrono::Utc;
use clap::ValueEnum;
use tokio::sync::mpsc;
use tracing::info;

use crate::mqtt::messages::{SensorSnapshot, Topic};
use crate::mqtt::resubscribe::SubscriptionError;
use crate::mqtt::{SessionError, SessionEvent, Transport};
use lifecycle::ControllerRun;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("Failed to publish command: {0}")]
    Dispatch(SessionError),

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Session closed before the run completed")]
    SessionClosed,
}

/// Command the controller sends on its way through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Action {
    #[value(name = "light.on")]
    LightOn,
    #[value(name = "light.off")]
    LightOff,
    #[value(name = "water.on")]
    WaterOn,
    #[value(name = "water.off")]
    WaterOff,
    #[default]
    #[value(name = "noop")]
    Noop,
}

impl Action {
    /// Topic and desired relay state, `None` for [`Action::Noop`].
    pub fn command(&self) -> Option<(Topic, bool)> {
        match self {
            Action::LightOn => Some((Topic::LightStatus, true)),
            Action::LightOff => Some((Topic::LightStatus, false)),
            Action::WaterOn => Some((Topic::WaterStatus, true)),
            Action::WaterOff => Some((Topic::WaterStatus, false)),
            Action::Noop => None,
        }
    }
}

/// Runs the controller from an established session to its disconnect.
pub async fn run(
    transport: Box<dyn Transport>,
    events: mpsc::Receiver<SessionEvent>,
    action: Action,
    listen: Duration,
) -> Result<Vec<SensorSnapshot>, ControllerError> {
    info!("Running controller with action {:?}", action);
    let subscribed = ControllerRun::start(transport, events).subscribe().await?;
    let mut dispatched = subscribed.dispatch(action, Utc::now()).await?;
    let snapshots = dispatched.listen(listen).await?;
    dispatched.finish().await?;
    info!("Controller done, {} sensor reports received", snapshots.len());
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::RecordingTransport;
    use rumqttc::QoS;

    #[test]
    fn action_names_match_the_command_line() {
        let names: Vec<_> = Action::value_variants()
            .iter()
            .filter_map(|action| action.to_possible_value())
            .map(|value| value.get_name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["light.on", "light.off", "water.on", "water.off", "noop"]
        );
    }

    #[test]
    fn actions_map_to_their_topics() {
        assert_eq!(Action::WaterOn.command(), Some((Topic::WaterStatus, true)));
        assert_eq!(Action::LightOff.command(), Some((Topic::LightStatus, false)));
        assert_eq!(Action::Noop.command(), None);
    }

    #[tokio::test]
    async fn full_run_disconnects_at_the_end() {
        let transport = RecordingTransport::default();
        let (events_tx, events_rx) = mpsc::channel(8);
        events_tx
            .send(SessionEvent::SubscribeSent { pkid: 1 })
            .await
            .unwrap();
        events_tx
            .send(SessionEvent::SubscribeAck {
                pkid: 1,
                granted: vec![Some(QoS::AtLeastOnce)],
            })
            .await
            .unwrap();
        events_tx
            .send(SessionEvent::PublishAck { pkid: 2 })
            .await
            .unwrap();

        let snapshots = run(
            Box::new(transport.clone()),
            events_rx,
            Action::WaterOn,
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert!(snapshots.is_empty());
        assert_eq!(transport.published_to("garden/waterStatus").len(), 1);
        assert_eq!(transport.disconnects(), 1);
    }

    #[tokio::test]
    async fn unusable_transport_fails_before_dispatch() {
        let transport = RecordingTransport::failing();
        let (_events_tx, events_rx) = mpsc::channel(8);

        let result = run(
            Box::new(transport.clone()),
            events_rx,
            Action::LightOn,
            Duration::ZERO,
        )
        .await;

        assert!(matches!(
            result,
            Err(ControllerError::Subscription(SubscriptionError::Request(_)))
        ));
        assert_eq!(transport.disconnects(), 0);
    }
}
