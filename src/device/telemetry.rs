use chrono::{DateTime, Utc};
use rumqttc::QoS;
use tracing::{debug, info, warn};

use crate::hardware::SoilSensor;
use crate::mqtt::messages::{epoch_seconds, RelayStatus, SensorSnapshot, Topic};
use crate::mqtt::Transport;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorSample {
    pub temperature: f32,
    pub capacitance: u16,
    pub sampled_at: DateTime<Utc>,
}

/// Samples the soil probe and publishes best-effort snapshots.
pub struct TelemetryPublisher {
    sensor: Box<dyn SoilSensor>,
}

impl TelemetryPublisher {
    pub fn new(sensor: Box<dyn SoilSensor>) -> Self {
        Self { sensor }
    }

    /// Reads the probe. A failed read skips this cycle.
    pub fn sample(&mut self, now: DateTime<Utc>) -> Option<SensorSample> {
        let reading = self
            .sensor
            .read_temperature()
            .and_then(|temperature| Ok((temperature, self.sensor.read_moisture()?)));
        match reading {
            Ok((temperature, capacitance)) => {
                info!("Temp: {:.1} Capacitance: {}", temperature, capacitance);
                Some(SensorSample {
                    temperature,
                    capacitance,
                    sampled_at: now,
                })
            }
            Err(e) => {
                warn!("Sensor read failed, skipping this cycle: {}", e);
                None
            }
        }
    }

    /// Publishes one snapshot. Failures are logged and left for the next tick.
    pub async fn publish<T>(
        transport: &T,
        sample: &SensorSample,
        status: RelayStatus,
        now: DateTime<Utc>,
    ) -> bool
    where
        T: Transport + ?Sized,
    {
        let snapshot = SensorSnapshot {
            temperature: sample.temperature,
            capacitance: sample.capacitance,
            status,
            sent: epoch_seconds(now),
        };
        let payload = match snapshot.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode sensor snapshot: {}", e);
                return false;
            }
        };

        debug!("Publishing to topic {}...", Topic::SensorData);
        match transport
            .publish(Topic::SensorData.as_str(), payload, QoS::AtLeastOnce)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Telemetry publish failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::testing::ScriptedSensor;
    use crate::mqtt::testing::RecordingTransport;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn failed_read_skips_cycle() {
        let mut publisher = TelemetryPublisher::new(Box::new(ScriptedSensor::new([None])));
        assert_eq!(publisher.sample(now()), None);
    }

    #[tokio::test]
    async fn snapshot_reports_relays_and_time() {
        let transport = RecordingTransport::default();
        let mut publisher =
            TelemetryPublisher::new(Box::new(ScriptedSensor::new([Some((19.5, 612))])));

        let sample = publisher.sample(now()).unwrap();
        assert!(
            TelemetryPublisher::publish(&transport, &sample, RelayStatus::new(false, true), now())
                .await
        );

        let payloads = transport.published_to("garden/sensorData");
        assert_eq!(payloads.len(), 1);
        let snapshot = SensorSnapshot::decode(&payloads[0]).unwrap();
        assert_eq!(snapshot.capacitance, 612);
        assert_eq!(snapshot.temperature, 19.5);
        assert_eq!(snapshot.status, RelayStatus::new(false, true));
        assert_eq!(snapshot.sent, epoch_seconds(now()));
    }

    #[tokio::test]
    async fn publish_failure_is_contained() {
        let transport = RecordingTransport::failing();
        let sample = SensorSample {
            temperature: 20.0,
            capacitance: 500,
            sampled_at: now(),
        };

        assert!(
            !TelemetryPublisher::publish(&transport, &sample, RelayStatus::default(), now()).await
        );
    }
}
