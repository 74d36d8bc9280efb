//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - managing topics and subscriptions
//! - publishing messages and fanning them out to subscriptions
//! - leasing messages to pulling and streaming consumers until acknowledged
//! - seeking subscriptions back or forward in time
//!
//! Concurrency and usage notes:
//! - All topic, subscription, message and stream state sits behind a single
//!   broker-wide lock. Every operation validates and mutates inside one
//!   critical section, so a failed call changes nothing.
//! - The lock is never held across an await. Pull's bounded long-poll
//!   releases it while waiting and takes it again to retry.
//! - Each subscription runs a background task that, every tick, expires
//!   leases, purges old messages and offers available ones to open streams.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::context::CallContext;
use crate::broker::message::{Message, MessageId, MessageLog};
use crate::broker::reactor::{ErrorInjection, Method, Reactor, ReactorRegistry};
use crate::broker::stream::OpenStream;
use crate::broker::subscription::{
    self, DEFAULT_ACK_DEADLINE_SECS, DEFAULT_MAX_MESSAGES, MAX_ACK_DEADLINE_SECS, MAX_RETENTION,
    Subscription,
};
use crate::broker::topic::{self, DELETED_TOPIC, Topic};
use crate::config::BrokerSettings;
use crate::protocol::{
    self, AcknowledgeRequest, DeleteSubscriptionRequest, DeleteTopicRequest,
    DetachSubscriptionRequest, DetachSubscriptionResponse, GetSubscriptionRequest,
    GetTopicRequest, ListSubscriptionsRequest, ListSubscriptionsResponse,
    ListTopicSubscriptionsRequest, ListTopicSubscriptionsResponse, ListTopicsRequest,
    ListTopicsResponse, ModifyAckDeadlineRequest, PublishRequest, PublishResponse, PubsubMessage,
    PullRequest, PullResponse, ReceivedMessage, SeekRequest, SeekResponse, SeekTarget,
    StreamingPullRequest, StreamingPullResponse, UpdateSubscriptionRequest, UpdateTopicRequest,
};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::error::{Code, Error, Result};
use crate::utils::paging::page_bounds;

/// How often each subscription runs maintenance and stream delivery.
pub const DELIVERY_TICK: Duration = Duration::from_millis(10);

/// How long an empty, non-immediate Pull waits before its single retry.
pub const PULL_WAIT: Duration = Duration::from_millis(500);

pub(crate) struct Shared {
    state: Mutex<State>,
    pub(crate) tasks: TaskTracker,
}

impl Shared {
    /// State is only changed after validation succeeds, so a poisoned lock
    /// still guards consistent data.
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct State {
    pub(crate) topics: HashMap<String, Topic>,
    pub(crate) subscriptions: HashMap<String, Subscription>,
    pub(crate) messages: MessageLog,
    pub(crate) reactors: ReactorRegistry,
    clock: Arc<dyn Clock>,
    next_id: u64,
    stream_timeout: Option<Duration>,
    min_ack_deadline_secs: i32,
}

fn lookup<'a>(
    subscriptions: &'a mut HashMap<String, Subscription>,
    name: &str,
) -> Result<&'a mut Subscription> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("missing subscription".to_string()));
    }
    subscriptions
        .get_mut(name)
        .ok_or_else(|| Error::NotFound(format!("subscription {name}")))
}

fn check_modack_seconds(seconds: i32) -> Result<()> {
    if !(0..=MAX_ACK_DEADLINE_SECS).contains(&seconds) {
        return Err(Error::InvalidArgument(format!(
            "bad ack_deadline_seconds: {seconds}"
        )));
    }
    Ok(())
}

fn validate_stream_request(req: &StreamingPullRequest) -> Result<()> {
    if req.modify_deadline_ack_ids.len() != req.modify_deadline_seconds.len() {
        return Err(Error::InvalidArgument(format!(
            "modify_deadline_seconds has {} entries but modify_deadline_ack_ids has {}",
            req.modify_deadline_seconds.len(),
            req.modify_deadline_ack_ids.len()
        )));
    }
    for seconds in &req.modify_deadline_seconds {
        check_modack_seconds(*seconds)?;
    }
    check_modack_seconds(req.stream_ack_deadline_seconds)
}

fn apply_stream_request(
    sub: &mut Subscription,
    stream: Uuid,
    req: &StreamingPullRequest,
    now: DateTime<Utc>,
    log: &mut MessageLog,
) {
    for ack_id in &req.ack_ids {
        sub.ack(ack_id, log);
    }
    for (ack_id, seconds) in req
        .modify_deadline_ack_ids
        .iter()
        .zip(&req.modify_deadline_seconds)
    {
        log.record_modack(ack_id, *seconds, now);
        sub.modify_ack_deadline(ack_id, *seconds, now);
    }
    if req.stream_ack_deadline_seconds > 0 {
        sub.set_stream_ack_deadline(stream, req.stream_ack_deadline_seconds);
    }
}

/// Whether `name` belongs to `project` (`projects/<id>`). An empty project
/// matches everything.
fn in_project(name: &str, project: &str) -> bool {
    project.is_empty()
        || name
            .strip_prefix(project)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn subscription(&self, name: &str) -> Result<&Subscription> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("missing subscription".to_string()));
        }
        self.subscriptions
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("subscription {name}")))
    }

    fn pull(&mut self, name: &str, max: usize) -> Result<Vec<ReceivedMessage>> {
        let now = self.now();
        let State {
            subscriptions,
            messages,
            ..
        } = self;
        let sub = lookup(subscriptions, name)?;
        Ok(sub.pull(max, now, messages))
    }

    /// One delivery tick. Returns `false` once the subscription is gone.
    pub(crate) fn deliver(&mut self, name: &str) -> bool {
        let now = self.now();
        let State {
            subscriptions,
            messages,
            ..
        } = self;
        let Some(sub) = subscriptions.get_mut(name) else {
            return false;
        };
        let delivered = sub.deliver(now, messages);
        if delivered > 0 {
            debug!(subscription = name, delivered, "delivered to streams");
        }
        true
    }

    fn open_stream(&mut self, first: &StreamingPullRequest) -> Result<OpenStream> {
        validate_stream_request(first)?;
        let now = self.now();
        let timeout = self.stream_timeout;
        let State {
            subscriptions,
            messages,
            ..
        } = self;
        let sub = lookup(subscriptions, &first.subscription)?;
        let (stream, slot) = OpenStream::new(sub.name().to_string(), sub.ack_timeout(), timeout);
        sub.register_stream(slot);
        apply_stream_request(sub, stream.id, first, now, messages);
        Ok(stream)
    }

    pub(crate) fn handle_stream_request(
        &mut self,
        name: &str,
        stream: Uuid,
        req: &StreamingPullRequest,
    ) -> Result<()> {
        validate_stream_request(req)?;
        let now = self.now();
        let State {
            subscriptions,
            messages,
            ..
        } = self;
        let sub = lookup(subscriptions, name)?;
        apply_stream_request(sub, stream, req, now, messages);
        Ok(())
    }

    fn close_stream(&mut self, name: &str, stream: Uuid) {
        if let Some(sub) = self.subscriptions.get_mut(name) {
            sub.deregister_stream(stream);
        }
    }
}

/// Removes a stream from its subscription when the call serving it ends,
/// including when the caller drops the call.
struct StreamRegistration {
    shared: Arc<Shared>,
    subscription: String,
    id: Uuid,
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        self.shared.lock().close_stream(&self.subscription, self.id);
        info!(subscription = %self.subscription, stream = %self.id, "stream closed");
    }
}

/// Construction options for a [`Broker`].
pub struct BrokerBuilder {
    clock: Arc<dyn Clock>,
    reactors: ReactorRegistry,
    min_ack_deadline: Duration,
    stream_timeout: Option<Duration>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            reactors: ReactorRegistry::new(),
            min_ack_deadline: Duration::from_secs(DEFAULT_ACK_DEADLINE_SECS as u64),
            stream_timeout: None,
        }
    }
}

impl BrokerBuilder {
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn reactor(mut self, method: Method, reactor: impl Reactor + 'static) -> Self {
        self.reactors.register(method, reactor);
        self
    }

    /// Every `method` call fails with `code` and `message`.
    pub fn error_injection(self, method: Method, code: Code, message: impl Into<String>) -> Self {
        self.reactor(method, ErrorInjection::new(code, message))
    }

    pub fn reactors(mut self, reactors: ReactorRegistry) -> Self {
        self.reactors = reactors;
        self
    }

    /// Smallest ack deadline subscriptions may ask for. Whole seconds, at
    /// least one.
    pub fn min_ack_deadline(mut self, min: Duration) -> Self {
        self.min_ack_deadline = min;
        self
    }

    /// How long a streaming pull stays open before the broker ends it.
    /// Zero means streams never time out.
    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn build(self) -> Result<Broker> {
        let min_ack_deadline_secs = min_ack_deadline_secs(self.min_ack_deadline)?;
        Ok(Broker::from_parts(self, min_ack_deadline_secs))
    }
}

fn min_ack_deadline_secs(min: Duration) -> Result<i32> {
    match i32::try_from(min.as_secs()) {
        Ok(secs) if (1..=MAX_ACK_DEADLINE_SECS).contains(&secs) => Ok(secs),
        _ => Err(Error::InvalidArgument(format!(
            "min ack deadline must be between 1s and {MAX_ACK_DEADLINE_SECS}s, got {min:?}"
        ))),
    }
}

/// The in-memory publish/subscribe broker. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct Broker {
    pub(crate) shared: Arc<Shared>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Broker")
            .field("topics", &state.topics.len())
            .field("subscriptions", &state.subscriptions.len())
            .field("messages", &state.messages.len())
            .field("reactors", &state.reactors)
            .finish_non_exhaustive()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::from_parts(BrokerBuilder::default(), DEFAULT_ACK_DEADLINE_SECS)
    }

    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    /// A broker tuned by configuration, with the system clock.
    pub fn from_settings(settings: &BrokerSettings) -> Result<Self> {
        Self::builder()
            .min_ack_deadline(settings.min_ack_deadline())
            .stream_timeout(settings.stream_timeout())
            .build()
    }

    fn from_parts(builder: BrokerBuilder, min_ack_deadline_secs: i32) -> Self {
        let state = State {
            topics: HashMap::new(),
            subscriptions: HashMap::new(),
            messages: MessageLog::default(),
            reactors: builder.reactors,
            clock: builder.clock,
            next_id: 0,
            stream_timeout: builder.stream_timeout,
            min_ack_deadline_secs,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                tasks: TaskTracker::new(),
            }),
        }
    }


    pub fn create_topic(&self, topic: protocol::Topic) -> Result<protocol::Topic> {
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::CreateTopic, &topic) {
            return reaction;
        }
        if topic.name.is_empty() {
            return Err(Error::InvalidArgument("missing name".to_string()));
        }
        if state.topics.contains_key(&topic.name) {
            return Err(Error::AlreadyExists(format!("topic {:?}", topic.name)));
        }
        info!(topic = %topic.name, "created topic");
        state
            .topics
            .insert(topic.name.clone(), Topic::new(topic.clone()));
        Ok(topic)
    }

    pub fn get_topic(&self, req: GetTopicRequest) -> Result<protocol::Topic> {
        let state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::GetTopic, &req) {
            return reaction;
        }
        state
            .topics
            .get(&req.topic)
            .map(|t| t.proto.clone())
            .ok_or_else(|| Error::NotFound(format!("topic {:?}", req.topic)))
    }

    pub fn update_topic(&self, req: UpdateTopicRequest) -> Result<protocol::Topic> {
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::UpdateTopic, &req) {
            return reaction;
        }
        let Some(update) = req.topic.as_ref() else {
            return Err(Error::InvalidArgument("missing topic".to_string()));
        };
        let topic = state
            .topics
            .get_mut(&update.name)
            .ok_or_else(|| Error::NotFound(format!("topic {:?}", update.name)))?;
        topic.apply_update(update, &req.update_mask.clone().unwrap_or_default())?;
        Ok(topic.proto.clone())
    }

    pub fn list_topics(&self, req: ListTopicsRequest) -> Result<ListTopicsResponse> {
        let state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::ListTopics, &req) {
            return reaction;
        }
        let mut names: Vec<&String> = state
            .topics
            .keys()
            .filter(|name| in_project(name, &req.project))
            .collect();
        names.sort();
        let page = page_bounds(req.page_size, &req.page_token, names.len())?;
        Ok(ListTopicsResponse {
            topics: names[page.from..page.to]
                .iter()
                .filter_map(|name| state.topics.get(*name))
                .map(|t| t.proto.clone())
                .collect(),
            next_page_token: page.next_page_token,
        })
    }

    pub fn list_topic_subscriptions(
        &self,
        req: ListTopicSubscriptionsRequest,
    ) -> Result<ListTopicSubscriptionsResponse> {
        let state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::ListTopicSubscriptions, &req) {
            return reaction;
        }
        let mut names: Vec<&String> = state
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.topic() == req.topic)
            .map(|(name, _)| name)
            .collect();
        names.sort();
        let page = page_bounds(req.page_size, &req.page_token, names.len())?;
        Ok(ListTopicSubscriptionsResponse {
            subscriptions: names[page.from..page.to]
                .iter()
                .map(|name| name.to_string())
                .collect(),
            next_page_token: page.next_page_token,
        })
    }

    /// Deletes the topic. Its subscriptions survive, reporting the topic as
    /// `_deleted-topic_`.
    pub fn delete_topic(&self, req: DeleteTopicRequest) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::DeleteTopic, &req) {
            return reaction;
        }
        let topic = state
            .topics
            .remove(&req.topic)
            .ok_or_else(|| Error::NotFound(format!("topic {:?}", req.topic)))?;
        for name in &topic.subscriptions {
            if let Some(sub) = state.subscriptions.get_mut(name) {
                sub.proto.topic = DELETED_TOPIC.to_string();
            }
        }
        info!(topic = %req.topic, detached = topic.subscriptions.len(), "deleted topic");
        Ok(())
    }


    /// Creates a subscription and starts its background delivery. Background
    /// delivery needs a Tokio runtime; without one only Pull serves it.
    pub fn create_subscription(
        &self,
        mut proto: protocol::Subscription,
    ) -> Result<protocol::Subscription> {
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::CreateSubscription, &proto) {
            return reaction;
        }
        if proto.name.is_empty() {
            return Err(Error::InvalidArgument("missing name".to_string()));
        }
        if state.subscriptions.contains_key(&proto.name) {
            return Err(Error::AlreadyExists(format!("subscription {:?}", proto.name)));
        }
        if proto.topic.is_empty() {
            return Err(Error::InvalidArgument("missing topic".to_string()));
        }
        if !state.topics.contains_key(&proto.topic) {
            return Err(Error::NotFound(format!("topic {:?}", proto.topic)));
        }
        let min_ack = state.min_ack_deadline_secs;
        if proto.ack_deadline_seconds == 0 {
            proto.ack_deadline_seconds = DEFAULT_ACK_DEADLINE_SECS.max(min_ack);
        }
        subscription::check_ack_deadline(proto.ack_deadline_seconds, min_ack)?;
        if proto.message_retention_duration.is_none() {
            proto.message_retention_duration = Some(MAX_RETENTION);
        }
        subscription::check_retention(proto.message_retention_duration)?;
        if proto.push_config.is_none() {
            proto.push_config = Some(protocol::PushConfig::default());
        }

        let sub = Subscription::new(proto.clone());
        let shutdown = sub.shutdown_token();
        if let Some(topic) = state.topics.get_mut(&proto.topic) {
            topic.attach(&proto.name);
        }
        state.subscriptions.insert(proto.name.clone(), sub);
        drop(state);

        self.spawn_delivery(proto.name.clone(), shutdown);
        info!(
            subscription = %proto.name,
            topic = %proto.topic,
            ack_deadline_seconds = proto.ack_deadline_seconds,
            "created subscription"
        );
        Ok(proto)
    }

    fn spawn_delivery(&self, name: String, shutdown: CancellationToken) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(subscription = %name, "no tokio runtime; streaming delivery disabled");
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        self.shared.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(DELIVERY_TICK) => {}
                }
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if !shared.lock().deliver(&name) {
                    return;
                }
            }
        });
    }

    pub fn get_subscription(&self, req: GetSubscriptionRequest) -> Result<protocol::Subscription> {
        let state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::GetSubscription, &req) {
            return reaction;
        }
        Ok(state.subscription(&req.subscription)?.proto.clone())
    }

    pub fn update_subscription(
        &self,
        req: UpdateSubscriptionRequest,
    ) -> Result<protocol::Subscription> {
        let Some(update) = req.subscription.as_ref() else {
            return Err(Error::InvalidArgument("missing subscription".to_string()));
        };
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::UpdateSubscription, &req) {
            return reaction;
        }
        let min_ack = state.min_ack_deadline_secs;
        let sub = lookup(&mut state.subscriptions, &update.name)?;
        sub.apply_update(update, &req.update_mask.clone().unwrap_or_default(), min_ack)?;
        Ok(sub.proto.clone())
    }

    pub fn list_subscriptions(&self, req: ListSubscriptionsRequest) -> Result<ListSubscriptionsResponse> {
        let state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::ListSubscriptions, &req) {
            return reaction;
        }
        let mut names: Vec<&String> = state
            .subscriptions
            .keys()
            .filter(|name| in_project(name, &req.project))
            .collect();
        names.sort();
        let page = page_bounds(req.page_size, &req.page_token, names.len())?;
        Ok(ListSubscriptionsResponse {
            subscriptions: names[page.from..page.to]
                .iter()
                .filter_map(|name| state.subscriptions.get(*name))
                .map(|sub| sub.proto.clone())
                .collect(),
            next_page_token: page.next_page_token,
        })
    }

    /// Stops background delivery, ends open streams and removes the
    /// subscription from the registry and from its topic.
    pub fn delete_subscription(&self, req: DeleteSubscriptionRequest) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::DeleteSubscription, &req) {
            return reaction;
        }
        if req.subscription.is_empty() {
            return Err(Error::InvalidArgument("missing subscription".to_string()));
        }
        let Some(mut sub) = state.subscriptions.remove(&req.subscription) else {
            return Err(Error::NotFound(format!("subscription {}", req.subscription)));
        };
        sub.stop();
        if let Some(topic) = state.topics.get_mut(sub.topic()) {
            topic.detach(&req.subscription);
        }
        info!(subscription = %req.subscription, "deleted subscription");
        Ok(())
    }

    /// Detaches the subscription from its topic. The subscription keeps
    /// serving what it already has but receives nothing new.
    pub fn detach_subscription(&self, req: DetachSubscriptionRequest) -> Result<DetachSubscriptionResponse> {
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::DetachSubscription, &req) {
            return reaction;
        }
        let State {
            topics,
            subscriptions,
            ..
        } = &mut *state;
        let sub = lookup(subscriptions, &req.subscription)?;
        if let Some(topic) = topics.get_mut(sub.topic()) {
            topic.detach(&req.subscription);
        }
        sub.proto.detached = true;
        info!(subscription = %req.subscription, "detached subscription");
        Ok(DetachSubscriptionResponse {})
    }


    /// Publishes a batch. Ids are issued in strictly increasing order
    /// matching the order of `req.messages`.
    pub fn publish(&self, req: PublishRequest) -> Result<PublishResponse> {
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::Publish, &req) {
            return reaction;
        }
        if req.topic.is_empty() {
            return Err(Error::InvalidArgument("missing topic".to_string()));
        }
        let now = state.now();
        let State {
            topics,
            subscriptions,
            messages,
            next_id,
            ..
        } = &mut *state;
        let topic = topics
            .get(&req.topic)
            .ok_or_else(|| Error::NotFound(format!("topic {:?}", req.topic)))?;

        let max_age = TimeDelta::from_std(MAX_RETENTION).unwrap_or(TimeDelta::MAX);
        if let Some(cutoff) = now.checked_sub_signed(max_age) {
            messages.prune_before(cutoff);
        }

        let mut message_ids = Vec::with_capacity(req.messages.len());
        for mut msg in req.messages {
            let id = MessageId::new(*next_id);
            *next_id += 1;
            msg.message_id = id.to_string();
            msg.publish_time = Some(now);
            for name in &topic.subscriptions {
                if let Some(sub) = subscriptions.get_mut(name) {
                    sub.enqueue(id, msg.clone(), now);
                }
            }
            messages.insert(id, Message::published(&req.topic, &msg, now));
            message_ids.push(msg.message_id);
        }
        debug!(topic = %req.topic, count = message_ids.len(), "published messages");
        Ok(PublishResponse { message_ids })
    }

    /// Acknowledges messages. Ids that are unknown, already acked or
    /// malformed are ignored.
    pub fn acknowledge(&self, req: AcknowledgeRequest) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::Acknowledge, &req) {
            return reaction;
        }
        let State {
            subscriptions,
            messages,
            ..
        } = &mut *state;
        let sub = lookup(subscriptions, &req.subscription)?;
        for ack_id in &req.ack_ids {
            sub.ack(ack_id, messages);
        }
        debug!(subscription = %req.subscription, count = req.ack_ids.len(), "acknowledged");
        Ok(())
    }

    /// Extends leases, or nacks them when the deadline is zero. Every id is
    /// recorded in its message's modack audit trail, pending or not.
    pub fn modify_ack_deadline(&self, req: ModifyAckDeadlineRequest) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::ModifyAckDeadline, &req) {
            return reaction;
        }
        check_modack_seconds(req.ack_deadline_seconds)?;
        let now = state.now();
        let State {
            subscriptions,
            messages,
            ..
        } = &mut *state;
        let sub = lookup(subscriptions, &req.subscription)?;
        for ack_id in &req.ack_ids {
            messages.record_modack(ack_id, req.ack_deadline_seconds, now);
            sub.modify_ack_deadline(ack_id, req.ack_deadline_seconds, now);
        }
        Ok(())
    }

    /// Leases available messages to the caller.
    ///
    /// When nothing is available and `return_immediately` is unset, waits
    /// once for [`PULL_WAIT`] (without holding the lock) and retries. The
    /// wait ends early with an error if `ctx` is cancelled or times out.
    pub async fn pull(&self, ctx: &CallContext, req: PullRequest) -> Result<PullResponse> {
        let max = {
            let mut state = self.shared.lock();
            if let Some(reaction) = state.reactors.intercept(Method::Pull, &req) {
                return reaction;
            }
            state.subscription(&req.subscription)?;
            let max = match req.max_messages {
                n if n < 0 => {
                    return Err(Error::InvalidArgument(
                        "MaxMessages cannot be negative".to_string(),
                    ));
                }
                0 => DEFAULT_MAX_MESSAGES,
                n => usize::try_from(n).unwrap_or(DEFAULT_MAX_MESSAGES),
            };
            let received_messages = state.pull(&req.subscription, max)?;
            if !received_messages.is_empty() || req.return_immediately {
                return Ok(PullResponse { received_messages });
            }
            max
        };

        ctx.sleep(PULL_WAIT).await?;
        let received_messages = self.shared.lock().pull(&req.subscription, max)?;
        Ok(PullResponse { received_messages })
    }

    /// Serves a streaming pull until the caller ends its request stream,
    /// either half fails, or the stream timeout elapses.
    ///
    /// The first request must name the subscription. Messages are sent on
    /// `responses` one per response.
    pub async fn streaming_pull<S>(
        &self,
        mut requests: S,
        responses: mpsc::Sender<StreamingPullResponse>,
    ) -> Result<()>
    where
        S: Stream<Item = Result<StreamingPullRequest>> + Send + Unpin + 'static,
    {
        let first = match requests.next().await {
            Some(first) => first?,
            None => return Ok(()),
        };
        let stream = {
            let mut state = self.shared.lock();
            if let Some(reaction) = state.reactors.intercept(Method::StreamingPull, &first) {
                return reaction;
            }
            state.open_stream(&first)?
        };
        let registration = StreamRegistration {
            shared: Arc::clone(&self.shared),
            subscription: stream.subscription.clone(),
            id: stream.id,
        };
        info!(subscription = %registration.subscription, stream = %registration.id, "stream opened");

        let result = stream
            .run(Arc::clone(&self.shared), requests, responses)
            .await;
        debug!(stream = %registration.id, ok = result.is_ok(), "stream finished");
        result
    }

    /// Seeks a subscription to a point in time: everything published before
    /// it counts as acknowledged, everything at or after it is offered again.
    ///
    /// Re-offered messages are rebuilt from the broker's message log; treat
    /// their contents as best effort.
    pub fn seek(&self, req: SeekRequest) -> Result<SeekResponse> {
        let target = match &req.target {
            None => return Err(Error::InvalidArgument("missing Seek target type".to_string())),
            Some(SeekTarget::Time(t)) => *t,
            Some(SeekTarget::Snapshot(_)) => {
                return Err(Error::Unimplemented(
                    "unhandled Seek target type snapshot".to_string(),
                ));
            }
        };
        let mut state = self.shared.lock();
        if let Some(reaction) = state.reactors.intercept(Method::Seek, &req) {
            return reaction;
        }
        let State {
            subscriptions,
            messages,
            ..
        } = &mut *state;
        let sub = lookup(subscriptions, &req.subscription)?;
        sub.seek(target, messages);
        info!(subscription = %req.subscription, %target, pending = sub.pending_len(), "seeked");
        Ok(SeekResponse {})
    }


    /// Publishes one message, creating the topic if needed, and returns its
    /// id. `topic` must look like `projects/*/topics/*`.
    pub fn publish_message(
        &self,
        topic: &str,
        data: impl Into<Bytes>,
        attributes: HashMap<String, String>,
    ) -> Result<String> {
        self.publish_ordered(topic, data, attributes, "")
    }

    /// [`Broker::publish_message`] with an ordering key.
    pub fn publish_ordered(
        &self,
        topic: &str,
        data: impl Into<Bytes>,
        attributes: HashMap<String, String>,
        ordering_key: &str,
    ) -> Result<String> {
        if !topic::is_valid_topic_name(topic) {
            return Err(Error::InvalidArgument(format!(
                "topic name must be of the form \"projects/*/topics/*\", got {topic:?}"
            )));
        }
        match self.create_topic(protocol::Topic::new(topic)) {
            Ok(_) => {}
            Err(err) if err.code() == Code::AlreadyExists => {}
            Err(err) => return Err(err),
        }
        let mut message = PubsubMessage::new(data).with_ordering_key(ordering_key);
        message.attributes = attributes;
        let res = self.publish(PublishRequest {
            topic: topic.to_string(),
            messages: vec![message],
        })?;
        res.message_ids
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("publish returned no message id".to_string()))
    }

    /// Every message still in the broker's log, in publish order.
    pub fn messages(&self) -> Vec<Message> {
        self.shared
            .lock()
            .messages
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        let id = id.parse::<MessageId>().ok()?;
        self.shared.lock().messages.get(id).cloned()
    }

    /// Forgets the message log. Subscriptions keep their pending messages.
    pub fn clear_messages(&self) {
        self.shared.lock().messages.clear();
    }

    /// Applies to streams opened afterwards. Zero means never.
    pub fn set_stream_timeout(&self, timeout: Duration) {
        self.shared.lock().stream_timeout = (!timeout.is_zero()).then_some(timeout);
    }

    pub fn set_clock(&self, clock: impl Clock + 'static) {
        self.shared.lock().clock = Arc::new(clock);
    }

    pub fn set_min_ack_deadline(&self, min: Duration) -> Result<()> {
        let secs = min_ack_deadline_secs(min)?;
        self.shared.lock().min_ack_deadline_secs = secs;
        Ok(())
    }

    pub fn add_reactor(&self, method: Method, reactor: impl Reactor + 'static) {
        self.shared.lock().reactors.register(method, reactor);
    }

    /// Stops every subscription's background delivery and open streams.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        for sub in state.subscriptions.values_mut() {
            sub.stop();
        }
        drop(state);
        self.shared.tasks.close();
        info!("broker closed");
    }

    /// Waits until every background task and stream has finished. Only
    /// returns once subscriptions are stopped, e.g. after [`Broker::close`].
    pub async fn wait(&self) {
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
    }
}
