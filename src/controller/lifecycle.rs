use std::time::Duration;

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use statum::{machine, state};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Action, ControllerError};
use crate::mqtt::messages::{CommandMessage, SensorSnapshot, Topic};
use crate::mqtt::resubscribe::ResubscriptionManager;
use crate::mqtt::{SessionEvent, Transport};

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

// Controller run states
#[state]
#[derive(Debug, Clone)]
pub enum ControllerPhase {
    Connected,
    Subscribed,
    Dispatched,
}

#[machine]
#[derive(Debug)]
pub struct ControllerRun<S: ControllerPhase> {
    transport: Box<dyn Transport>,
    events: mpsc::Receiver<SessionEvent>,
    subscriptions: ResubscriptionManager,
    awaiting_ack: bool,
}

impl<S: ControllerPhase> ControllerRun<S> {
    /// Handles bookkeeping events. Returns the snapshot when `event` carried telemetry.
    async fn on_event(
        &mut self,
        event: SessionEvent,
    ) -> Result<Option<SensorSnapshot>, ControllerError> {
        match event {
            SessionEvent::Message { topic, payload } => {
                if Topic::from_name(&topic) != Some(Topic::SensorData) {
                    debug!("Ignoring message on {}", topic);
                    return Ok(None);
                }
                match SensorSnapshot::decode(&payload) {
                    Ok(snapshot) => {
                        info!("Received message from topic '{}': {}", topic, snapshot);
                        Ok(Some(snapshot))
                    }
                    Err(e) => {
                        warn!("Malformed sensor data on {}: {}", topic, e);
                        Ok(None)
                    }
                }
            }
            SessionEvent::Resumed { session_present } => {
                self.subscriptions
                    .on_resumed(self.transport.as_ref(), session_present)
                    .await?;
                Ok(None)
            }
            SessionEvent::SubscribeSent { pkid } => {
                self.subscriptions.on_subscribe_sent(pkid);
                Ok(None)
            }
            SessionEvent::SubscribeAck { pkid, granted } => {
                self.subscriptions.on_subscribe_ack(pkid, &granted)?;
                Ok(None)
            }
            SessionEvent::PublishAck { pkid } => {
                debug!("Command acknowledged (PUBACK {})", pkid);
                self.awaiting_ack = false;
                Ok(None)
            }
            SessionEvent::Interrupted(e) => {
                warn!("Connection interrupted: {}", e);
                self.subscriptions.on_interrupted();
                Ok(None)
            }
            SessionEvent::Connected { .. } => Ok(None),
            SessionEvent::Disconnected => Err(ControllerError::SessionClosed),
        }
    }
}

impl ControllerRun<Connected> {
    pub fn start(transport: Box<dyn Transport>, events: mpsc::Receiver<SessionEvent>) -> Self {
        let subscriptions = ResubscriptionManager::new(
            vec![Topic::SensorData.as_str().to_string()],
            QoS::AtLeastOnce,
        );
        Self::new(transport, events, subscriptions, false)
    }

    /// Subscribes to telemetry and waits until the broker granted it.
    pub async fn subscribe(mut self) -> Result<ControllerRun<Subscribed>, ControllerError> {
        self.subscriptions
            .subscribe_all(self.transport.as_ref())
            .await?;

        while self.subscriptions.has_pending() {
            let event = self
                .events
                .recv()
                .await
                .ok_or(ControllerError::SessionClosed)?;
            self.on_event(event).await?;
        }

        debug!("Transitioning to Subscribed state");
        Ok(self.transition())
    }
}

impl ControllerRun<Subscribed> {
    /// Publishes the command for `action`, if it has one.
    pub async fn dispatch(
        mut self,
        action: Action,
        now: DateTime<Utc>,
    ) -> Result<ControllerRun<Dispatched>, ControllerError> {
        match action.command() {
            Some((topic, on)) => {
                let payload = CommandMessage::new(on, now).encode()?;
                info!(
                    "Publishing message to topic '{}': {}",
                    topic,
                    String::from_utf8_lossy(&payload)
                );
                self.transport
                    .publish(topic.as_str(), payload, QoS::AtLeastOnce)
                    .await
                    .map_err(ControllerError::Dispatch)?;
                self.awaiting_ack = true;
            }
            None => info!("No command to send"),
        }

        Ok(self.transition())
    }
}

impl ControllerRun<Dispatched> {
    /// Logs telemetry for `duration` and returns what arrived.
    pub async fn listen(
        &mut self,
        duration: Duration,
    ) -> Result<Vec<SensorSnapshot>, ControllerError> {
        let mut snapshots = Vec::new();
        if duration.is_zero() {
            return Ok(snapshots);
        }

        info!("Listening for sensor data for {:?}", duration);
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(snapshot) = self.on_event(event).await? {
                            snapshots.push(snapshot);
                        }
                    }
                    None => {
                        warn!("Session event channel closed while listening");
                        break;
                    }
                },
            }
        }
        Ok(snapshots)
    }

    /// Waits for the command's PUBACK, then disconnects.
    pub async fn finish(mut self) -> Result<(), ControllerError> {
        if self.awaiting_ack {
            debug!("Waiting for the broker to acknowledge the command");
            match tokio::time::timeout(ACK_TIMEOUT, self.wait_for_ack()).await {
                Ok(result) => result?,
                Err(_) => warn!("Command not acknowledged within {:?}", ACK_TIMEOUT),
            }
        }
        self.transport.disconnect().await?;
        Ok(())
    }

    async fn wait_for_ack(&mut self) -> Result<(), ControllerError> {
        while self.awaiting_ack {
            let event = self
                .events
                .recv()
                .await
                .ok_or(ControllerError::SessionClosed)?;
            self.on_event(event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::messages::RelayStatus;
    use crate::mqtt::resubscribe::SubscriptionError;
    use crate::mqtt::testing::RecordingTransport;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    async fn granted(events: &mpsc::Sender<SessionEvent>, pkid: u16, qos: Option<QoS>) {
        events.send(SessionEvent::SubscribeSent { pkid }).await.unwrap();
        events
            .send(SessionEvent::SubscribeAck {
                pkid,
                granted: vec![qos],
            })
            .await
            .unwrap();
    }

    fn snapshot_event(capacitance: u16) -> SessionEvent {
        let snapshot = SensorSnapshot {
            temperature: 20.0,
            capacitance,
            status: RelayStatus::new(true, false),
            sent: 1.0,
        };
        SessionEvent::Message {
            topic: "garden/sensorData".to_string(),
            payload: snapshot.encode().unwrap(),
        }
    }

    #[tokio::test]
    async fn subscribes_to_sensor_data_and_dispatches() {
        let transport = RecordingTransport::default();
        let (events_tx, events_rx) = mpsc::channel(8);
        granted(&events_tx, 1, Some(QoS::AtLeastOnce)).await;

        let run = ControllerRun::start(Box::new(transport.clone()), events_rx);
        let subscribed = run.subscribe().await.unwrap();
        let dispatched = subscribed.dispatch(Action::LightOn, now()).await.unwrap();
        events_tx
            .send(SessionEvent::PublishAck { pkid: 2 })
            .await
            .unwrap();
        dispatched.finish().await.unwrap();

        assert_eq!(
            transport.subscriptions(),
            vec![vec!["garden/sensorData".to_string()]]
        );
        let sent = transport.published_to("garden/lightStatus");
        assert_eq!(sent.len(), 1);
        assert_eq!(
            CommandMessage::decode(&sent[0]).unwrap(),
            CommandMessage::new(true, now())
        );
        assert_eq!(transport.disconnects(), 1);
    }

    #[tokio::test]
    async fn water_command_goes_to_water_topic() {
        let transport = RecordingTransport::default();
        let (events_tx, events_rx) = mpsc::channel(8);
        granted(&events_tx, 1, Some(QoS::AtLeastOnce)).await;

        let subscribed = ControllerRun::start(Box::new(transport.clone()), events_rx)
            .subscribe()
            .await
            .unwrap();
        subscribed.dispatch(Action::WaterOff, now()).await.unwrap();

        assert!(transport.published_to("garden/lightStatus").is_empty());
        let sent = transport.published_to("garden/waterStatus");
        assert!(!CommandMessage::decode(&sent[0]).unwrap().on);
    }

    #[tokio::test]
    async fn command_survives_interruption_before_its_ack() {
        let transport = RecordingTransport::default();
        let (events_tx, events_rx) = mpsc::channel(8);
        granted(&events_tx, 1, Some(QoS::AtLeastOnce)).await;
        let dispatched = ControllerRun::start(Box::new(transport.clone()), events_rx)
            .subscribe()
            .await
            .unwrap()
            .dispatch(Action::LightOff, now())
            .await
            .unwrap();

        let finished = tokio::spawn(dispatched.finish());
        for event in [
            SessionEvent::Interrupted("connection reset".to_string()),
            SessionEvent::Resumed {
                session_present: true,
            },
        ] {
            events_tx.send(event).await.unwrap();
        }
        tokio::task::yield_now().await;
        assert_eq!(transport.disconnects(), 0);

        events_tx
            .send(SessionEvent::PublishAck { pkid: 7 })
            .await
            .unwrap();
        finished.await.unwrap().unwrap();
        assert_eq!(transport.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_still_disconnects_after_timeout() {
        let transport = RecordingTransport::default();
        let (events_tx, events_rx) = mpsc::channel(8);
        granted(&events_tx, 1, Some(QoS::AtLeastOnce)).await;
        let dispatched = ControllerRun::start(Box::new(transport.clone()), events_rx)
            .subscribe()
            .await
            .unwrap()
            .dispatch(Action::WaterOn, now())
            .await
            .unwrap();

        dispatched.finish().await.unwrap();

        assert_eq!(transport.disconnects(), 1);
        drop(events_tx);
    }

    #[tokio::test]
    async fn noop_publishes_nothing() {
        let transport = RecordingTransport::default();
        let (events_tx, events_rx) = mpsc::channel(8);
        granted(&events_tx, 1, Some(QoS::AtLeastOnce)).await;

        let subscribed = ControllerRun::start(Box::new(transport.clone()), events_rx)
            .subscribe()
            .await
            .unwrap();
        subscribed.dispatch(Action::Noop, now()).await.unwrap();

        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn rejected_subscription_stops_the_run() {
        let (events_tx, events_rx) = mpsc::channel(8);
        granted(&events_tx, 1, None).await;

        let result = ControllerRun::start(Box::new(RecordingTransport::default()), events_rx)
            .subscribe()
            .await;

        assert!(matches!(
            result,
            Err(ControllerError::Subscription(SubscriptionError::Rejected { .. }))
        ));
    }

    #[tokio::test]
    async fn closed_session_before_suback_is_an_error() {
        let (events_tx, events_rx) = mpsc::channel(8);
        drop(events_tx);

        let result = ControllerRun::start(Box::new(RecordingTransport::default()), events_rx)
            .subscribe()
            .await;

        assert!(matches!(result, Err(ControllerError::SessionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn listen_collects_sensor_data_until_deadline() {
        let transport = RecordingTransport::default();
        let (events_tx, events_rx) = mpsc::channel(8);
        granted(&events_tx, 1, Some(QoS::AtLeastOnce)).await;
        events_tx.send(snapshot_event(350)).await.unwrap();
        events_tx
            .send(SessionEvent::Message {
                topic: "garden/lightStatus".to_string(),
                payload: b"{\"on\":true}".to_vec(),
            })
            .await
            .unwrap();
        events_tx.send(snapshot_event(420)).await.unwrap();

        let mut dispatched = ControllerRun::start(Box::new(transport.clone()), events_rx)
            .subscribe()
            .await
            .unwrap()
            .dispatch(Action::Noop, now())
            .await
            .unwrap();
        let snapshots = dispatched.listen(Duration::from_secs(5)).await.unwrap();
        dispatched.finish().await.unwrap();

        let capacitances: Vec<_> = snapshots.iter().map(|s| s.capacitance).collect();
        assert_eq!(capacitances, vec![350, 420]);
        assert_eq!(transport.disconnects(), 1);
        drop(events_tx);
    }

    #[tokio::test]
    async fn resumed_without_session_resubscribes_while_listening() {
        let transport = RecordingTransport::default();
        let (events_tx, events_rx) = mpsc::channel(8);
        granted(&events_tx, 1, Some(QoS::AtLeastOnce)).await;
        events_tx
            .send(SessionEvent::Resumed {
                session_present: false,
            })
            .await
            .unwrap();
        drop(events_tx);

        let mut dispatched = ControllerRun::start(Box::new(transport.clone()), events_rx)
            .subscribe()
            .await
            .unwrap()
            .dispatch(Action::Noop, now())
            .await
            .unwrap();
        dispatched.listen(Duration::from_secs(60)).await.unwrap();

        assert_eq!(transport.subscriptions().len(), 2);
    }
}
