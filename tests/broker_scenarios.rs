use std::collections::HashMap;
use std::time::Duration;

use chrono::TimeDelta;
use pubsim::broker::{Broker, MessageId};
use pubsim::protocol::{
    self, AcknowledgeRequest, DeleteSubscriptionRequest, PublishRequest, PubsubMessage,
    PullRequest, ReceivedMessage, SeekRequest, SeekTarget, StreamingPullRequest,
    StreamingPullResponse,
};
use pubsim::utils::clock::{Clock, ManualClock};
use pubsim::{CallContext, Code, Method, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

const TOPIC: &str = "projects/demo/topics/t";
const SUB: &str = "projects/demo/subscriptions/s";
const WAIT: Duration = Duration::from_secs(2);

struct TestStream {
    requests: mpsc::Sender<Result<StreamingPullRequest>>,
    responses: mpsc::Receiver<StreamingPullResponse>,
    handle: JoinHandle<Result<()>>,
}

impl TestStream {
    fn open(broker: &Broker, first: StreamingPullRequest) -> Self {
        let (requests, request_rx) = mpsc::channel(16);
        let (response_tx, responses) = mpsc::channel(16);
        requests.try_send(Ok(first)).unwrap();
        let broker = broker.clone();
        let handle = tokio::spawn(async move {
            broker
                .streaming_pull(ReceiverStream::new(request_rx), response_tx)
                .await
        });
        Self {
            requests,
            responses,
            handle,
        }
    }

    async fn next(&mut self) -> ReceivedMessage {
        let mut response = timeout(WAIT, self.responses.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended");
        assert_eq!(response.received_messages.len(), 1);
        response.received_messages.remove(0)
    }

    async fn finish(self) -> Result<()> {
        timeout(WAIT, self.handle)
            .await
            .expect("stream did not end")
            .unwrap()
    }
}

fn first_request() -> StreamingPullRequest {
    StreamingPullRequest {
        subscription: SUB.to_string(),
        ..Default::default()
    }
}

fn setup(clock: Option<ManualClock>) -> Broker {
    let mut builder = Broker::builder();
    if let Some(clock) = clock {
        builder = builder.clock(clock);
    }
    let broker = builder.build().unwrap();
    broker.create_topic(protocol::Topic::new(TOPIC)).unwrap();
    broker
        .create_subscription(protocol::Subscription::new(SUB, TOPIC))
        .unwrap();
    broker
}

fn publish(broker: &Broker, n: usize) -> Vec<String> {
    broker
        .publish(PublishRequest {
            topic: TOPIC.to_string(),
            messages: (0..n).map(|i| PubsubMessage::new(format!("msg-{i}"))).collect(),
        })
        .unwrap()
        .message_ids
}

async fn pull(broker: &Broker) -> Vec<ReceivedMessage> {
    broker
        .pull(
            &CallContext::new(),
            PullRequest {
                subscription: SUB.to_string(),
                return_immediately: true,
                max_messages: 10,
            },
        )
        .await
        .unwrap()
        .received_messages
}

#[tokio::test]
async fn publish_pull_acknowledge() {
    let broker = setup(None);
    broker
        .publish(PublishRequest {
            topic: TOPIC.to_string(),
            messages: vec![PubsubMessage::new("hello")],
        })
        .unwrap();

    let received = pull(&broker).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message.data, "hello");
    assert_eq!(received[0].delivery_attempt, 1);

    broker
        .acknowledge(AcknowledgeRequest {
            subscription: SUB.to_string(),
            ack_ids: vec![received[0].ack_id.clone()],
        })
        .unwrap();
    assert!(pull(&broker).await.is_empty());
}

#[tokio::test]
async fn ack_deadline_above_maximum_is_unknown() {
    let broker = setup(None);
    let err = broker
        .create_subscription(
            protocol::Subscription::new("projects/demo/subscriptions/slow", TOPIC)
                .with_ack_deadline(700),
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::Unknown);
    assert_eq!(err.message(), "bad ack_deadline_seconds: 700");
}

#[tokio::test]
async fn message_ids_strictly_increase() {
    let broker = setup(None);
    let mut ids = publish(&broker, 5);
    ids.push(broker.publish_message(TOPIC, "one more", HashMap::new()).unwrap());
    ids.extend(publish(&broker, 3));

    let sequences: Vec<u64> = ids
        .iter()
        .map(|id| id.parse::<MessageId>().unwrap().sequence())
        .collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn unacked_stream_messages_are_redelivered_after_deadline() {
    let clock = ManualClock::starting_now();
    let broker = setup(Some(clock.clone()));
    let mut stream = TestStream::open(&broker, first_request());
    publish(&broker, 3);

    let mut first = Vec::new();
    for _ in 0..3 {
        first.push(stream.next().await);
    }
    assert!(first.iter().all(|m| m.delivery_attempt == 1));

    clock.advance(TimeDelta::seconds(11));
    let mut again = Vec::new();
    for _ in 0..3 {
        again.push(stream.next().await);
    }
    let mut first_ids: Vec<String> = first.into_iter().map(|m| m.ack_id).collect();
    let mut again_ids: Vec<String> = again.iter().map(|m| m.ack_id.clone()).collect();
    first_ids.sort();
    again_ids.sort();
    assert_eq!(first_ids, again_ids);
    assert!(again.iter().all(|m| m.delivery_attempt == 2));

    drop(stream.requests);
    stream.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn streamed_acks_stop_redelivery() {
    let clock = ManualClock::starting_now();
    let broker = setup(Some(clock.clone()));
    let mut stream = TestStream::open(&broker, first_request());
    let ids = publish(&broker, 1);

    let received = stream.next().await;
    stream
        .requests
        .send(Ok(StreamingPullRequest {
            ack_ids: vec![received.ack_id],
            ..Default::default()
        }))
        .await
        .unwrap();

    timeout(WAIT, async {
        while broker.message(&ids[0]).map(|m| m.acks) != Some(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("ack was not applied");

    clock.advance(TimeDelta::seconds(60));
    assert!(pull(&broker).await.is_empty());
    drop(stream.requests);
    assert!(stream.handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn streams_share_new_messages_round_robin() {
    let broker = setup(None);
    let mut a = TestStream::open(&broker, first_request());
    let mut b = TestStream::open(&broker, first_request());
    // both streams must be registered before anything is published
    tokio::time::sleep(Duration::from_millis(50)).await;
    publish(&broker, 4);

    let mut counts = [0usize; 2];
    for _ in 0..4 {
        tokio::select! {
            _ = a.next() => counts[0] += 1,
            _ = b.next() => counts[1] += 1,
        }
    }
    assert_eq!(counts.iter().sum::<usize>(), 4);
    assert!(counts.iter().all(|&c| c > 0), "uneven delivery: {counts:?}");
}

#[tokio::test]
async fn seek_past_everything_acknowledges_all() {
    let clock = ManualClock::starting_now();
    let broker = setup(Some(clock.clone()));
    publish(&broker, 3);

    broker
        .seek(SeekRequest {
            subscription: SUB.to_string(),
            target: Some(SeekTarget::Time(clock.now() + TimeDelta::seconds(1))),
        })
        .unwrap();
    assert!(pull(&broker).await.is_empty());
    assert!(broker.messages().iter().all(|m| m.acks == 1));
}

#[tokio::test]
async fn streaming_pull_argument_errors() {
    let broker = setup(None);

    let missing = TestStream::open(
        &broker,
        StreamingPullRequest {
            subscription: "projects/demo/subscriptions/nope".to_string(),
            ..Default::default()
        },
    );
    assert_eq!(missing.finish().await.unwrap_err().code(), Code::NotFound);

    let mismatched = TestStream::open(
        &broker,
        StreamingPullRequest {
            modify_deadline_ack_ids: vec!["m0".to_string()],
            ..first_request()
        },
    );
    assert_eq!(
        mismatched.finish().await.unwrap_err().code(),
        Code::InvalidArgument
    );

    let too_long = TestStream::open(
        &broker,
        StreamingPullRequest {
            stream_ack_deadline_seconds: 601,
            ..first_request()
        },
    );
    assert_eq!(
        too_long.finish().await.unwrap_err().code(),
        Code::InvalidArgument
    );
}

#[tokio::test]
async fn empty_request_stream_ends_cleanly() {
    let broker = setup(None);
    let (requests, request_rx) = mpsc::channel::<Result<StreamingPullRequest>>(1);
    drop(requests);
    let (response_tx, _responses) = mpsc::channel(1);
    broker
        .streaming_pull(ReceiverStream::new(request_rx), response_tx)
        .await
        .unwrap();
}

#[tokio::test]
async fn deleting_the_subscription_ends_its_streams() {
    let broker = setup(None);
    let stream = TestStream::open(&broker, first_request());
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker
        .delete_subscription(DeleteSubscriptionRequest {
            subscription: SUB.to_string(),
        })
        .unwrap();
    let _requests = stream.requests.clone();
    stream.finish().await.unwrap();
}

#[tokio::test]
async fn stream_timeout_ends_the_stream() {
    let broker = setup(None);
    broker.set_stream_timeout(Duration::from_millis(100));
    let stream = TestStream::open(&broker, first_request());
    let _requests = stream.requests.clone();
    stream.finish().await.unwrap();
}

#[tokio::test]
async fn injected_error_fails_streaming_pull() {
    let broker = setup(None);
    broker.add_reactor(
        Method::StreamingPull,
        pubsim::broker::ErrorInjection::new(Code::Unavailable, "down for maintenance"),
    );
    let stream = TestStream::open(&broker, first_request());
    assert_eq!(stream.finish().await.unwrap_err().code(), Code::Unavailable);
}

#[tokio::test]
async fn closing_the_broker_ends_streams_and_tasks() {
    let broker = setup(None);
    let stream = TestStream::open(&broker, first_request());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _requests = stream.requests.clone();

    broker.close();
    stream.finish().await.unwrap();
    timeout(WAIT, broker.wait()).await.unwrap();
}
