//! Subscription state
//!
//! A subscription keeps its own pending set, keyed by message id. Each entry
//! is either available or leased. A lease ends on acknowledgement (entry
//! removed), on a zero-second modack (entry available again) or when its
//! expiry passes and maintenance runs. Available entries older than the
//! retention duration are purged by the same maintenance pass.
//!
//! Delivery to open streams is round-robin over a stable-ordered list of
//! stream slots; see [`Subscription::deliver`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::message::{MessageId, MessageLog};
use crate::broker::stream::{StreamSlot, offer_round_robin};
use crate::protocol::{self, FieldMask, PubsubMessage, ReceivedMessage};
use crate::utils::error::{Error, Result};

pub const MAX_ACK_DEADLINE_SECS: i32 = 600;
pub const DEFAULT_ACK_DEADLINE_SECS: i32 = 10;
pub const MIN_RETENTION: Duration = Duration::from_secs(10 * 60);
pub const MAX_RETENTION: Duration = Duration::from_secs(168 * 60 * 60);
pub const DEFAULT_MAX_MESSAGES: usize = 1000;

/// Rejects deadlines outside `[min_secs, 600]` with `Unknown`, which is what
/// the real service reports.
pub(crate) fn check_ack_deadline(secs: i32, min_secs: i32) -> Result<()> {
    if secs < min_secs || secs > MAX_ACK_DEADLINE_SECS {
        return Err(Error::Unknown(format!("bad ack_deadline_seconds: {secs}")));
    }
    Ok(())
}

pub(crate) fn check_retention(retention: Option<Duration>) -> Result<()> {
    match retention {
        Some(d) if (MIN_RETENTION..=MAX_RETENTION).contains(&d) => Ok(()),
        other => Err(Error::InvalidArgument(format!(
            "bad message_retention_duration {other:?}"
        ))),
    }
}

pub(crate) fn secs(seconds: i32) -> TimeDelta {
    TimeDelta::seconds(i64::from(seconds))
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Per-subscription delivery state of one message.
#[derive(Debug, Clone)]
struct PendingMessage {
    message: PubsubMessage,
    publish_time: DateTime<Utc>,
    /// `Some` while leased.
    lease_expiry: Option<DateTime<Utc>>,
    deliveries: u32,
    /// Rotation position to start from on the next delivery attempt.
    stream_index: Option<usize>,
}

impl PendingMessage {
    fn new(message: PubsubMessage, publish_time: DateTime<Utc>) -> Self {
        Self {
            message,
            publish_time,
            lease_expiry: None,
            deliveries: 0,
            stream_index: None,
        }
    }

    fn is_leased(&self) -> bool {
        self.lease_expiry.is_some()
    }

    fn release(&mut self) {
        self.lease_expiry = None;
    }

    fn lease(&mut self, until: DateTime<Utc>) {
        self.lease_expiry = Some(until);
        self.deliveries += 1;
    }

    /// The message as the consumer sees it on its next delivery.
    fn next_delivery(&self, id: MessageId) -> ReceivedMessage {
        ReceivedMessage {
            ack_id: id.to_string(),
            message: self.message.clone(),
            delivery_attempt: i32::try_from(self.deliveries + 1).unwrap_or(i32::MAX),
        }
    }
}

#[derive(Debug)]
pub struct Subscription {
    pub(crate) proto: protocol::Subscription,
    ack_timeout: TimeDelta,
    pending: BTreeMap<MessageId, PendingMessage>,
    streams: Vec<StreamSlot>,
    /// Where first deliveries start in the stream rotation.
    next_stream: usize,
    shutdown: CancellationToken,
}

impl Subscription {
    /// Builds the state for an already validated subscription resource.
    pub fn new(proto: protocol::Subscription) -> Self {
        let ack_secs = match proto.ack_deadline_seconds {
            0 => DEFAULT_ACK_DEADLINE_SECS,
            n => n,
        };
        Self {
            proto,
            ack_timeout: secs(ack_secs),
            pending: BTreeMap::new(),
            streams: Vec::new(),
            next_stream: 0,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.proto.name
    }

    pub fn topic(&self) -> &str {
        &self.proto.topic
    }

    pub fn ack_timeout(&self) -> TimeDelta {
        self.ack_timeout
    }

    fn retention(&self) -> TimeDelta {
        to_delta(self.proto.message_retention_duration.unwrap_or(MAX_RETENTION))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn leased_len(&self) -> usize {
        self.pending.values().filter(|m| m.is_leased()).count()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops background delivery and ends every open stream.
    pub(crate) fn stop(&mut self) {
        self.shutdown.cancel();
        for stream in &self.streams {
            stream.close();
        }
    }

    pub(crate) fn enqueue(&mut self, id: MessageId, message: PubsubMessage, publish_time: DateTime<Utc>) {
        self.pending
            .insert(id, PendingMessage::new(message, publish_time));
    }

    /// Returns expired leases to the available pool and purges available
    /// messages older than the retention duration.
    pub(crate) fn maintain(&mut self, now: DateTime<Utc>) {
        let retention = self.retention();
        self.pending.retain(|_, m| {
            if m.lease_expiry.is_some_and(|expiry| now > expiry) {
                m.release();
            }
            m.is_leased() || now - m.publish_time <= retention
        });
    }

    /// Leases up to `max` available messages to a polling consumer.
    pub(crate) fn pull(&mut self, max: usize, now: DateTime<Utc>, log: &mut MessageLog) -> Vec<ReceivedMessage> {
        self.maintain(now);
        let expiry = now + self.ack_timeout;
        let mut out = Vec::new();
        for (id, m) in self.pending.iter_mut() {
            if out.len() >= max {
                break;
            }
            if m.is_leased() {
                continue;
            }
            let received = m.next_delivery(*id);
            m.lease(expiry);
            log.record_delivery(*id);
            out.push(received);
        }
        out
    }

    /// Hands available messages to open streams.
    ///
    /// A message that was delivered before starts at the stream after the one
    /// that last held it; a first delivery starts at the subscription's
    /// rotating cursor. Busy streams are skipped. Once no stream accepts a
    /// message the pass stops, since every stream is busy.
    pub(crate) fn deliver(&mut self, now: DateTime<Utc>, log: &mut MessageLog) -> usize {
        self.maintain(now);
        let Self {
            pending,
            streams,
            next_stream,
            ..
        } = self;

        let mut delivered = 0;
        for (id, m) in pending.iter_mut() {
            if m.is_leased() {
                continue;
            }
            let start = m.stream_index.unwrap_or(*next_stream);
            let Some((index, ack_timeout)) = offer_round_robin(streams, start, m.next_delivery(*id)) else {
                break;
            };
            if m.stream_index.is_none() {
                *next_stream = index + 1;
            }
            m.stream_index = Some(index + 1);
            m.lease(now + ack_timeout);
            log.record_delivery(*id);
            delivered += 1;
        }
        delivered
    }

    /// Acknowledges `ack_id`. Unknown or malformed ids are ignored.
    pub(crate) fn ack(&mut self, ack_id: &str, log: &mut MessageLog) {
        let Ok(id) = ack_id.parse::<MessageId>() else {
            return;
        };
        if self.pending.remove(&id).is_some() {
            log.record_ack(id);
        }
    }

    /// Zero seconds is a nack; anything else re-leases until `now + seconds`.
    pub(crate) fn modify_ack_deadline(&mut self, ack_id: &str, seconds: i32, now: DateTime<Utc>) {
        let Some(m) = ack_id
            .parse::<MessageId>()
            .ok()
            .and_then(|id| self.pending.get_mut(&id))
        else {
            return;
        };
        if seconds == 0 {
            m.release();
        } else {
            m.lease_expiry = Some(now + secs(seconds));
        }
    }

    /// Acks everything pending that was published before `target`, then
    /// re-offers every logged message of this subscription's topic published
    /// at or after it that is not already pending. Delivery attempts of
    /// re-offered messages restart at 1.
    pub(crate) fn seek(&mut self, target: DateTime<Utc>, log: &mut MessageLog) {
        self.pending.retain(|id, m| {
            if m.publish_time < target {
                log.record_ack(*id);
                false
            } else {
                true
            }
        });

        let topic = self.proto.topic.as_str();
        for (id, record) in log.iter() {
            if record.publish_time < target || record.topic != topic {
                continue;
            }
            self.pending
                .entry(id)
                .or_insert_with(|| PendingMessage::new(record.to_pubsub(), record.publish_time));
        }
    }

    pub(crate) fn register_stream(&mut self, slot: StreamSlot) {
        self.streams.push(slot);
    }

    /// Removes a stream, keeping the remaining ones in order so the rotation
    /// stays fair.
    pub(crate) fn deregister_stream(&mut self, id: Uuid) {
        if let Some(index) = self.streams.iter().position(|s| s.id == id) {
            self.streams.remove(index);
        }
    }

    pub(crate) fn set_stream_ack_deadline(&mut self, id: Uuid, seconds: i32) {
        if let Some(stream) = self.streams.iter_mut().find(|s| s.id == id) {
            stream.ack_timeout = secs(seconds);
        }
    }

    /// Applies the masked fields of `update`. Every path is validated before
    /// anything changes.
    pub(crate) fn apply_update(
        &mut self,
        update: &protocol::Subscription,
        mask: &FieldMask,
        min_ack_deadline_secs: i32,
    ) -> Result<()> {
        if mask.paths.is_empty() {
            return Err(Error::InvalidArgument("missing update_mask".to_string()));
        }
        for path in &mask.paths {
            match path.as_str() {
                "ack_deadline_seconds" => {
                    check_ack_deadline(update.ack_deadline_seconds, min_ack_deadline_secs)?
                }
                "message_retention_duration" => check_retention(update.message_retention_duration)?,
                "push_config" | "retain_acked_messages" | "labels" | "expiration_policy"
                | "dead_letter_policy" | "retry_policy" | "filter" => {}
                other => {
                    return Err(Error::InvalidArgument(format!("unknown field name {other:?}")));
                }
            }
        }

        for path in &mask.paths {
            let proto = &mut self.proto;
            match path.as_str() {
                "push_config" => proto.push_config = update.push_config.clone(),
                "ack_deadline_seconds" => {
                    proto.ack_deadline_seconds = update.ack_deadline_seconds;
                    self.ack_timeout = secs(update.ack_deadline_seconds);
                }
                "retain_acked_messages" => proto.retain_acked_messages = update.retain_acked_messages,
                "message_retention_duration" => {
                    proto.message_retention_duration = update.message_retention_duration
                }
                "labels" => proto.labels = update.labels.clone(),
                "expiration_policy" => proto.expiration_policy = update.expiration_policy.clone(),
                "dead_letter_policy" => proto.dead_letter_policy = update.dead_letter_policy.clone(),
                "retry_policy" => proto.retry_policy = update.retry_policy.clone(),
                _ => proto.filter = update.filter.clone(),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
