use super::*;
use crate::broker::message::Message;
use crate::broker::stream::OpenStream;
use crate::utils::error::Code;
use bytes::Bytes;

const TOPIC: &str = "projects/p/topics/t";

fn subscription(ack_secs: i32) -> Subscription {
    Subscription::new(
        protocol::Subscription::new("projects/p/subscriptions/s", TOPIC)
            .with_ack_deadline(ack_secs)
            .with_retention(MAX_RETENTION),
    )
}

fn publish(sub: &mut Subscription, log: &mut MessageLog, seq: u64, at: DateTime<Utc>) -> MessageId {
    let id = MessageId::new(seq);
    let mut msg = PubsubMessage::new(format!("payload-{seq}"));
    msg.message_id = id.to_string();
    msg.publish_time = Some(at);
    log.insert(id, Message::published(TOPIC, &msg, at));
    sub.enqueue(id, msg, at);
    id
}

#[test]
fn zero_ack_deadline_falls_back_to_default() {
    let sub = Subscription::new(protocol::Subscription::new("s", TOPIC));
    assert_eq!(sub.ack_timeout(), TimeDelta::seconds(10));
}

#[test]
fn ack_deadline_bounds_report_unknown() {
    assert!(check_ack_deadline(10, 10).is_ok());
    assert!(check_ack_deadline(600, 10).is_ok());
    let err = check_ack_deadline(601, 10).unwrap_err();
    assert_eq!(err.code(), Code::Unknown);
    assert_eq!(err.message(), "bad ack_deadline_seconds: 601");
    assert_eq!(check_ack_deadline(5, 10).unwrap_err().code(), Code::Unknown);
    assert!(check_ack_deadline(1, 1).is_ok());
}

#[test]
fn retention_bounds_report_invalid_argument() {
    assert!(check_retention(Some(MIN_RETENTION)).is_ok());
    assert!(check_retention(Some(MAX_RETENTION)).is_ok());
    for bad in [None, Some(Duration::from_secs(60)), Some(MAX_RETENTION + Duration::from_secs(1))] {
        assert_eq!(check_retention(bad).unwrap_err().code(), Code::InvalidArgument);
    }
}

#[test]
fn pull_leases_in_publish_order_up_to_max() {
    let mut sub = subscription(10);
    let mut log = MessageLog::default();
    let now = Utc::now();
    for seq in 0..3 {
        publish(&mut sub, &mut log, seq, now);
    }

    let first = sub.pull(2, now, &mut log);
    let ids: Vec<&str> = first.iter().map(|m| m.ack_id.as_str()).collect();
    assert_eq!(ids, ["m0", "m1"]);
    assert!(first.iter().all(|m| m.delivery_attempt == 1));
    assert_eq!(sub.leased_len(), 2);

    let rest = sub.pull(10, now, &mut log);
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].ack_id, "m2");
    assert!(sub.pull(10, now, &mut log).is_empty());
    assert_eq!(log.get(MessageId::new(0)).unwrap().deliveries, 1);
}

#[test]
fn expired_lease_is_redelivered_with_next_attempt() {
    let mut sub = subscription(10);
    let mut log = MessageLog::default();
    let t0 = Utc::now();
    publish(&mut sub, &mut log, 0, t0);

    assert_eq!(sub.pull(1, t0, &mut log).len(), 1);
    // the lease holds until its expiry has passed
    assert!(sub.pull(1, t0 + TimeDelta::seconds(10), &mut log).is_empty());

    let again = sub.pull(1, t0 + TimeDelta::seconds(11), &mut log);
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].delivery_attempt, 2);
    assert_eq!(log.get(MessageId::new(0)).unwrap().deliveries, 2);
}

#[test]
fn ack_removes_pending_and_ignores_unknown_ids() {
    let mut sub = subscription(10);
    let mut log = MessageLog::default();
    let now = Utc::now();
    let id = publish(&mut sub, &mut log, 0, now);
    sub.pull(1, now, &mut log);

    sub.ack("m0", &mut log);
    sub.ack("m0", &mut log);
    sub.ack("m77", &mut log);
    sub.ack("not-an-id", &mut log);

    assert_eq!(sub.pending_len(), 0);
    assert_eq!(log.get(id).unwrap().acks, 1);
}

#[test]
fn zero_second_modack_makes_message_available_again() {
    let mut sub = subscription(10);
    let mut log = MessageLog::default();
    let now = Utc::now();
    publish(&mut sub, &mut log, 0, now);
    sub.pull(1, now, &mut log);

    sub.modify_ack_deadline("m0", 0, now);
    assert_eq!(sub.leased_len(), 0);
    assert_eq!(sub.pull(1, now, &mut log).len(), 1);
}

#[test]
fn modack_extends_lease_from_now() {
    let mut sub = subscription(10);
    let mut log = MessageLog::default();
    let t0 = Utc::now();
    publish(&mut sub, &mut log, 0, t0);
    sub.pull(1, t0, &mut log);

    sub.modify_ack_deadline("m0", 60, t0 + TimeDelta::seconds(5));
    assert!(sub.pull(1, t0 + TimeDelta::seconds(30), &mut log).is_empty());
    assert_eq!(sub.pull(1, t0 + TimeDelta::seconds(66), &mut log).len(), 1);
}

#[test]
fn old_available_messages_are_purged_but_leased_ones_kept() {
    let mut sub = Subscription::new(
        protocol::Subscription::new("s", TOPIC).with_retention(MIN_RETENTION),
    );
    let mut log = MessageLog::default();
    let t0 = Utc::now();
    publish(&mut sub, &mut log, 0, t0);
    publish(&mut sub, &mut log, 1, t0);
    sub.pull(1, t0, &mut log);
    sub.modify_ack_deadline("m0", 600, t0 + TimeDelta::minutes(9));

    sub.maintain(t0 + TimeDelta::minutes(11));
    assert_eq!(sub.pending_len(), 1);
    assert!(sub.pending.contains_key(&MessageId::new(0)));
}

#[test]
fn seek_acks_the_past_and_reoffers_the_future() {
    let mut sub = subscription(10);
    let mut log = MessageLog::default();
    let t0 = Utc::now();
    publish(&mut sub, &mut log, 0, t0);
    publish(&mut sub, &mut log, 1, t0 + TimeDelta::seconds(5));
    // acked messages leave the pending set but stay in the log
    sub.pull(2, t0 + TimeDelta::seconds(5), &mut log);
    sub.ack("m1", &mut log);
    // a message of another topic never enters this subscription
    let mut other = PubsubMessage::new("elsewhere");
    other.message_id = "m2".to_string();
    log.insert(
        MessageId::new(2),
        Message::published("projects/p/topics/other", &other, t0 + TimeDelta::seconds(6)),
    );

    sub.seek(t0 + TimeDelta::seconds(1), &mut log);

    let ids: Vec<MessageId> = sub.pending.keys().copied().collect();
    assert_eq!(ids, [MessageId::new(1)]);
    assert_eq!(log.get(MessageId::new(0)).unwrap().acks, 1);
    let redelivered = sub.pull(10, t0 + TimeDelta::seconds(7), &mut log);
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].message.data, Bytes::from("payload-1"));
    // m1 was delivered once before the seek
    assert_eq!(redelivered[0].delivery_attempt, 1);
}

#[test]
fn seek_to_the_future_clears_everything() {
    let mut sub = subscription(10);
    let mut log = MessageLog::default();
    let t0 = Utc::now();
    publish(&mut sub, &mut log, 0, t0);
    publish(&mut sub, &mut log, 1, t0);

    sub.seek(t0 + TimeDelta::hours(1), &mut log);
    assert_eq!(sub.pending_len(), 0);
}

#[test]
fn deliver_rotates_across_streams() {
    let mut sub = subscription(10);
    let mut log = MessageLog::default();
    let now = Utc::now();
    let mut open = Vec::new();
    for _ in 0..2 {
        let (stream, slot) = OpenStream::new(sub.name().to_string(), sub.ack_timeout(), None);
        sub.register_stream(slot);
        open.push(stream);
    }
    for seq in 0..3 {
        publish(&mut sub, &mut log, seq, now);
    }

    // each stream holds at most one undelivered message
    assert_eq!(sub.deliver(now, &mut log), 2);
    assert_eq!(sub.leased_len(), 2);
    assert_eq!(sub.pending[&MessageId::new(0)].stream_index, Some(1));
    assert_eq!(sub.pending[&MessageId::new(1)].stream_index, Some(2));
    assert_eq!(sub.next_stream, 2);
    assert_eq!(sub.pending[&MessageId::new(2)].stream_index, None);
}

#[test]
fn deliver_without_streams_leases_nothing() {
    let mut sub = subscription(10);
    let mut log = MessageLog::default();
    let now = Utc::now();
    publish(&mut sub, &mut log, 0, now);
    assert_eq!(sub.deliver(now, &mut log), 0);
    assert_eq!(sub.leased_len(), 0);
}

#[test]
fn stop_closes_streams_and_cancels_delivery() {
    let mut sub = subscription(10);
    let (_stream, slot) = OpenStream::new(sub.name().to_string(), sub.ack_timeout(), None);
    let id = slot.id;
    sub.register_stream(slot);
    let shutdown = sub.shutdown_token();

    sub.stop();
    assert!(shutdown.is_cancelled());
    assert!(sub.streams.iter().all(|s| s.is_done()));

    sub.deregister_stream(id);
    assert_eq!(sub.stream_count(), 0);
}

#[test]
fn stream_ack_deadline_is_per_stream() {
    let mut sub = subscription(10);
    let (_a, slot_a) = OpenStream::new(sub.name().to_string(), sub.ack_timeout(), None);
    let (_b, slot_b) = OpenStream::new(sub.name().to_string(), sub.ack_timeout(), None);
    let a = slot_a.id;
    sub.register_stream(slot_a);
    sub.register_stream(slot_b);

    sub.set_stream_ack_deadline(a, 45);
    assert_eq!(sub.streams[0].ack_timeout, TimeDelta::seconds(45));
    assert_eq!(sub.streams[1].ack_timeout, TimeDelta::seconds(10));
}

#[test]
fn update_validates_every_path_before_applying() {
    let mut sub = subscription(10);
    let mut update = protocol::Subscription::new("s", TOPIC).with_ack_deadline(30);
    update.labels.insert("env".into(), "test".into());

    let err = sub
        .apply_update(&update, &FieldMask::new(["labels", "topic"]), 10)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(sub.proto.labels.is_empty());

    let err = sub
        .apply_update(&update.clone().with_ack_deadline(900), &FieldMask::new(["ack_deadline_seconds"]), 10)
        .unwrap_err();
    assert_eq!(err.code(), Code::Unknown);

    sub.apply_update(&update, &FieldMask::new(["labels", "ack_deadline_seconds"]), 10)
        .unwrap();
    assert_eq!(sub.proto.ack_deadline_seconds, 30);
    assert_eq!(sub.ack_timeout(), TimeDelta::seconds(30));
    assert_eq!(sub.proto.labels.get("env").unwrap(), "test");
}

#[test]
fn update_requires_a_mask() {
    let mut sub = subscription(10);
    let update = protocol::Subscription::new("s", TOPIC);
    let err = sub.apply_update(&update, &FieldMask::default(), 10).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[test]
fn update_retention_out_of_bounds_is_rejected() {
    let mut sub = subscription(10);
    let update = protocol::Subscription::new("s", TOPIC).with_retention(Duration::from_secs(5));
    let err = sub
        .apply_update(&update, &FieldMask::new(["message_retention_duration"]), 10)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(sub.proto.message_retention_duration, Some(MAX_RETENTION));
}
