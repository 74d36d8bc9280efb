//! Streaming pull
//!
//! An open stream has two halves that share one completion token: the send
//! half drains the stream's single-slot queue towards the caller, the receive
//! half applies the caller's acks, modacks and deadline changes. Whichever
//! half finishes first (error or clean end of input), or the optional stream
//! timeout, ends both.
//!
//! Messages still leased to a stream when it closes stay leased until their
//! deadline passes; nothing is released on disconnect.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::broker::engine::Shared;
use crate::protocol::{ReceivedMessage, StreamingPullRequest, StreamingPullResponse};
use crate::utils::error::{Error, Result};

/// The subscription's handle on an open stream.
#[derive(Debug)]
pub(crate) struct StreamSlot {
    pub(crate) id: Uuid,
    sender: mpsc::Sender<ReceivedMessage>,
    done: CancellationToken,
    /// Lease duration for messages delivered on this stream.
    pub(crate) ack_timeout: TimeDelta,
}

enum Offer {
    Accepted,
    Busy(ReceivedMessage),
    Gone(ReceivedMessage),
}

impl StreamSlot {
    pub(crate) fn is_done(&self) -> bool {
        self.done.is_cancelled() || self.sender.is_closed()
    }

    /// Non-blocking handoff into the stream's one-message queue.
    fn offer(&self, message: ReceivedMessage) -> Offer {
        match self.sender.try_send(message) {
            Ok(()) => Offer::Accepted,
            Err(TrySendError::Full(m)) => Offer::Busy(m),
            Err(TrySendError::Closed(m)) => Offer::Gone(m),
        }
    }

    pub(crate) fn close(&self) {
        self.done.cancel();
    }
}

/// Offers `message` to the streams starting at `start` (modulo the stream
/// count) and moving round-robin. Finished streams are dropped from the list
/// as they are met, preserving the order of the rest.
///
/// Returns the index of the accepting stream and its lease duration, or
/// `None` when every live stream is busy.
pub(crate) fn offer_round_robin(
    streams: &mut Vec<StreamSlot>,
    start: usize,
    message: ReceivedMessage,
) -> Option<(usize, TimeDelta)> {
    let mut message = message;
    let mut index = start;
    let mut tried = 0;
    while tried < streams.len() {
        index %= streams.len();
        if streams[index].is_done() {
            streams.remove(index);
            continue;
        }
        match streams[index].offer(message) {
            Offer::Accepted => return Some((index, streams[index].ack_timeout)),
            Offer::Busy(m) => {
                message = m;
                index += 1;
                tried += 1;
            }
            Offer::Gone(m) => {
                message = m;
                streams.remove(index);
            }
        }
    }
    None
}

/// The call-side half of a stream, before it starts running.
#[derive(Debug)]
pub(crate) struct OpenStream {
    pub(crate) id: Uuid,
    pub(crate) subscription: String,
    messages: mpsc::Receiver<ReceivedMessage>,
    done: CancellationToken,
    timeout: Option<Duration>,
}

impl OpenStream {
    /// Creates a stream and the slot its subscription delivers into.
    pub(crate) fn new(
        subscription: String,
        ack_timeout: TimeDelta,
        timeout: Option<Duration>,
    ) -> (Self, StreamSlot) {
        let id = Uuid::new_v4();
        let (sender, messages) = mpsc::channel(1);
        let done = CancellationToken::new();
        let slot = StreamSlot {
            id,
            sender,
            done: done.clone(),
            ack_timeout,
        };
        let stream = Self {
            id,
            subscription,
            messages,
            done,
            timeout,
        };
        (stream, slot)
    }

    /// Runs both halves until one of them ends or the timeout elapses.
    /// A clean end of input is not an error. Dropping the returned future
    /// also stops both halves.
    pub(crate) async fn run<S>(
        self,
        shared: Arc<Shared>,
        requests: S,
        responses: mpsc::Sender<StreamingPullResponse>,
    ) -> Result<()>
    where
        S: Stream<Item = Result<StreamingPullRequest>> + Send + Unpin + 'static,
    {
        let OpenStream {
            id,
            subscription,
            messages,
            done,
            timeout,
        } = self;
        // ends both halves however this call finishes, including being dropped
        let _cancel_on_exit = done.clone().drop_guard();
        let (finished_tx, mut finished) = mpsc::channel::<Result<()>>(2);

        let send_done = done.clone();
        let send_finished = finished_tx.clone();
        shared.tasks.spawn(async move {
            let _ = send_finished
                .send(send_loop(messages, responses, send_done).await)
                .await;
        });

        let recv_shared = Arc::clone(&shared);
        let recv_done = done.clone();
        shared.tasks.spawn(async move {
            let _ = finished_tx
                .send(recv_loop(recv_shared, subscription, id, requests, recv_done).await)
                .await;
        });

        match timeout {
            Some(limit) => tokio::select! {
                r = finished.recv() => r.unwrap_or(Ok(())),
                _ = tokio::time::sleep(limit) => {
                    debug!(stream = %id, "stream timed out");
                    Ok(())
                }
            },
            None => finished.recv().await.unwrap_or(Ok(())),
        }
    }
}

async fn send_loop(
    mut messages: mpsc::Receiver<ReceivedMessage>,
    responses: mpsc::Sender<StreamingPullResponse>,
    done: CancellationToken,
) -> Result<()> {
    loop {
        let received = tokio::select! {
            _ = done.cancelled() => return Ok(()),
            received = messages.recv() => received,
        };
        // all senders gone: the subscription dropped this stream
        let Some(received) = received else {
            return Ok(());
        };
        let response = StreamingPullResponse {
            received_messages: vec![received],
        };
        tokio::select! {
            _ = done.cancelled() => return Ok(()),
            sent = responses.send(response) => {
                if sent.is_err() {
                    return Err(Error::Cancelled("stream consumer went away".to_string()));
                }
            }
        }
    }
}

async fn recv_loop<S>(
    shared: Arc<Shared>,
    subscription: String,
    id: Uuid,
    mut requests: S,
    done: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<StreamingPullRequest>> + Send + Unpin + 'static,
{
    loop {
        let next = tokio::select! {
            _ = done.cancelled() => return Ok(()),
            next = requests.next() => next,
        };
        match next {
            None => return Ok(()),
            Some(Err(err)) => return Err(err),
            Some(Ok(request)) => shared
                .lock()
                .handle_stream_request(&subscription, id, &request)?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PubsubMessage;

    fn received(ack_id: &str) -> ReceivedMessage {
        ReceivedMessage {
            ack_id: ack_id.to_string(),
            message: PubsubMessage::new("x"),
            delivery_attempt: 1,
        }
    }

    fn slots(n: usize) -> (Vec<StreamSlot>, Vec<OpenStream>) {
        (0..n)
            .map(|_| {
                let (stream, slot) = OpenStream::new("s".into(), TimeDelta::seconds(10), None);
                (slot, stream)
            })
            .unzip()
    }

    #[test]
    fn offer_skips_busy_streams() {
        let (mut streams, _open) = slots(3);
        assert_eq!(offer_round_robin(&mut streams, 1, received("m0")).map(|r| r.0), Some(1));
        // stream 1 now holds a message, so the next offer moves on
        assert_eq!(offer_round_robin(&mut streams, 1, received("m1")).map(|r| r.0), Some(2));
        assert_eq!(offer_round_robin(&mut streams, 1, received("m2")).map(|r| r.0), Some(0));
        assert!(offer_round_robin(&mut streams, 1, received("m3")).is_none());
    }

    #[test]
    fn offer_removes_finished_streams_in_order() {
        let (mut streams, open) = slots(3);
        let ids: Vec<Uuid> = streams.iter().map(|s| s.id).collect();
        open[0].done.cancel();

        let (index, _) = offer_round_robin(&mut streams, 0, received("m0")).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].id, ids[1]);
        assert_eq!(streams[1].id, ids[2]);
        assert_eq!(streams[index].id, ids[1]);
    }

    #[test]
    fn offer_with_no_streams_fails() {
        let mut streams = Vec::new();
        assert!(offer_round_robin(&mut streams, 5, received("m0")).is_none());
    }
}
