//! Message records
//!
//! Every publish produces one [`Message`] in the broker-wide [`MessageLog`].
//! Subscriptions keep their own delivery state and only reach back into the
//! log to bump the shared delivery/ack counters and the modack audit trail,
//! which exist for test introspection rather than redelivery.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::PubsubMessage;
use crate::utils::error::Error;

/// Server-assigned identifier, strictly increasing per broker. Rendered as
/// `m<sequence>`; the rendered form doubles as the ack id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u64);

impl MessageId {
    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('m')
            .and_then(|n| n.parse::<u64>().ok())
            .map(MessageId)
            .ok_or_else(|| Error::InvalidArgument(format!("malformed message id {s:?}")))
    }
}

/// One ModifyAckDeadline call as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Modack {
    pub received_at: DateTime<Utc>,
    pub ack_id: String,
    pub ack_deadline: i32,
}

/// A message that was published to the broker, with its delivery history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
    pub ordering_key: String,
    pub publish_time: DateTime<Utc>,
    /// Deliveries across all subscriptions.
    pub deliveries: u32,
    /// Acknowledgements across all subscriptions.
    pub acks: u32,
    pub modacks: Vec<Modack>,
}

impl Message {
    pub(crate) fn published(topic: &str, msg: &PubsubMessage, publish_time: DateTime<Utc>) -> Self {
        Self {
            id: msg.message_id.clone(),
            topic: topic.to_string(),
            data: msg.data.clone(),
            attributes: msg.attributes.clone(),
            ordering_key: msg.ordering_key.clone(),
            publish_time,
            deliveries: 0,
            acks: 0,
            modacks: Vec::new(),
        }
    }

    /// Rebuilds the message as a subscriber would receive it.
    pub(crate) fn to_pubsub(&self) -> PubsubMessage {
        PubsubMessage {
            data: self.data.clone(),
            attributes: self.attributes.clone(),
            message_id: self.id.clone(),
            publish_time: Some(self.publish_time),
            ordering_key: self.ordering_key.clone(),
        }
    }
}

/// Broker-wide log of published messages, ordered by id.
#[derive(Debug, Default)]
pub(crate) struct MessageLog {
    records: BTreeMap<MessageId, Message>,
}

impl MessageLog {
    pub(crate) fn insert(&mut self, id: MessageId, message: Message) {
        self.records.insert(id, message);
    }

    pub(crate) fn get(&self, id: MessageId) -> Option<&Message> {
        self.records.get(&id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (MessageId, &Message)> {
        self.records.iter().map(|(id, m)| (*id, m))
    }

    pub(crate) fn record_delivery(&mut self, id: MessageId) {
        if let Some(m) = self.records.get_mut(&id) {
            m.deliveries += 1;
        }
    }

    pub(crate) fn record_ack(&mut self, id: MessageId) {
        if let Some(m) = self.records.get_mut(&id) {
            m.acks += 1;
        }
    }

    /// Appends to the audit trail of `ack_id` whether or not any subscription
    /// still has it pending. Ids that never named a message are dropped.
    pub(crate) fn record_modack(&mut self, ack_id: &str, ack_deadline: i32, received_at: DateTime<Utc>) {
        let Ok(id) = ack_id.parse::<MessageId>() else {
            return;
        };
        if let Some(m) = self.records.get_mut(&id) {
            m.modacks.push(Modack {
                received_at,
                ack_id: ack_id.to_string(),
                ack_deadline,
            });
        }
    }

    /// Drops records published before `cutoff`. Ids are issued in publish
    /// order, so the expired records form a prefix of the log.
    pub(crate) fn prune_before(&mut self, cutoff: DateTime<Utc>) {
        while let Some(entry) = self.records.first_entry() {
            if entry.get().publish_time >= cutoff {
                break;
            }
            entry.remove();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
