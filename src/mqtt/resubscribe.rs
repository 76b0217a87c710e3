//! Keeps the broker's subscription set equal to the role's static topic list.
//!
//! Every SUBSCRIBE this module issues carries the whole set in one packet. The
//! session reports the packet id of each outgoing SUBSCRIBE in request order, so
//! pending requests are bound to packet ids first-in first-out, and a SUBACK is
//! matched back to its topics by position.
//!
//! The client does not replay SUBSCRIBE packets after a reconnect, so a request
//! still waiting for its SUBACK when the connection drops is issued again once
//! the connection is back, even when the broker kept the session.

use std::collections::{HashMap, VecDeque};

use rumqttc::QoS;
use tracing::{debug, info, warn};

use super::session::{SessionError, Transport};

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Server rejected subscription to topic: {topic}")]
    Rejected { topic: String },

    #[error("Subscription request failed: {0}")]
    Request(#[from] SessionError),
}

#[derive(Debug)]
pub struct ResubscriptionManager {
    topics: Vec<String>,
    qos: QoS,
    unbound: VecDeque<Vec<String>>,
    in_flight: HashMap<u16, Vec<String>>,
    reissue: bool,
    resubscriptions: usize,
}

impl ResubscriptionManager {
    pub fn new(topics: Vec<String>, qos: QoS) -> Self {
        Self {
            topics,
            qos,
            unbound: VecDeque::new(),
            in_flight: HashMap::new(),
            reissue: false,
            resubscriptions: 0,
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Number of resubscriptions issued after reconnects.
    pub fn resubscriptions(&self) -> usize {
        self.resubscriptions
    }

    /// True while any request still waits for its SUBACK or has to be issued again.
    pub fn has_pending(&self) -> bool {
        self.reissue || !self.unbound.is_empty() || !self.in_flight.is_empty()
    }

    /// Drops unacknowledged requests; they are issued again on the next resume.
    pub fn on_interrupted(&mut self) {
        let lost = self.unbound.len() + self.in_flight.len();
        if lost == 0 {
            return;
        }
        warn!("{} subscription request(s) unacknowledged at disconnect", lost);
        self.unbound.clear();
        self.in_flight.clear();
        self.reissue = true;
    }

    /// Requests the full topic set.
    pub async fn subscribe_all<T>(&mut self, transport: &T) -> Result<(), SubscriptionError>
    where
        T: Transport + ?Sized,
    {
        for topic in &self.topics {
            info!("Subscribing to topic {}...", topic);
        }
        transport.subscribe(&self.topics, self.qos).await?;
        self.unbound.push_back(self.topics.clone());
        Ok(())
    }

    /// Handles a resumed connection. Returns whether topics were re-requested.
    pub async fn on_resumed<T>(
        &mut self,
        transport: &T,
        session_present: bool,
    ) -> Result<bool, SubscriptionError>
    where
        T: Transport + ?Sized,
    {
        if session_present && !self.reissue {
            debug!("Broker kept the session, subscriptions are still in place");
            return Ok(false);
        }

        if session_present {
            info!("Issuing unacknowledged subscription again...");
        } else {
            info!("Session did not persist. Resubscribing to existing topics...");
        }
        self.subscribe_all(transport).await?;
        self.reissue = false;
        if !session_present {
            self.resubscriptions += 1;
        }
        Ok(true)
    }

    /// Binds the oldest unbound request to the packet id of an outgoing SUBSCRIBE.
    pub fn on_subscribe_sent(&mut self, pkid: u16) {
        match self.unbound.pop_front() {
            Some(topics) => {
                debug!("SUBSCRIBE {} carries {:?}", pkid, topics);
                self.in_flight.insert(pkid, topics);
            }
            None => warn!("Outgoing SUBSCRIBE {} was not requested by this client", pkid),
        }
    }

    /// Checks a SUBACK against its request.
    ///
    /// Returns the granted QoS per topic, or `None` when the packet id is unknown.
    /// Any topic the broker refused, or left without a return code, is an error.
    pub fn on_subscribe_ack(
        &mut self,
        pkid: u16,
        granted: &[Option<QoS>],
    ) -> Result<Option<Vec<(String, QoS)>>, SubscriptionError> {
        let Some(topics) = self.in_flight.remove(&pkid) else {
            warn!("SUBACK {} does not match any pending subscription", pkid);
            return Ok(None);
        };

        let mut results = Vec::with_capacity(topics.len());
        for (index, topic) in topics.into_iter().enumerate() {
            match granted.get(index).copied().flatten() {
                Some(qos) => {
                    info!("Subscribed to {} with {:?}", topic, qos);
                    results.push((topic, qos));
                }
                None => return Err(SubscriptionError::Rejected { topic }),
            }
        }
        Ok(Some(results))
    }
}
