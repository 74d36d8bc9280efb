//! Fault injection
//!
//! A [`ReactorRegistry`] maps each RPC [`Method`] to an ordered list of
//! [`Reactor`]s. Before an operation runs, the broker offers the request to
//! that method's reactors in registration order; the first one that handles
//! it short-circuits the call with its replacement result (or the
//! operation's empty result) or its error, leaving broker state untouched.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::utils::error::{Code, Error, Result};

/// The RPC surface, named exactly as clients of the real service know it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    CreateTopic,
    GetTopic,
    UpdateTopic,
    ListTopics,
    ListTopicSubscriptions,
    DeleteTopic,
    CreateSubscription,
    GetSubscription,
    UpdateSubscription,
    ListSubscriptions,
    DeleteSubscription,
    DetachSubscription,
    Publish,
    Acknowledge,
    ModifyAckDeadline,
    Pull,
    StreamingPull,
    Seek,
}

impl Method {
    pub const ALL: [Method; 18] = [
        Method::CreateTopic,
        Method::GetTopic,
        Method::UpdateTopic,
        Method::ListTopics,
        Method::ListTopicSubscriptions,
        Method::DeleteTopic,
        Method::CreateSubscription,
        Method::GetSubscription,
        Method::UpdateSubscription,
        Method::ListSubscriptions,
        Method::DeleteSubscription,
        Method::DetachSubscription,
        Method::Publish,
        Method::Acknowledge,
        Method::ModifyAckDeadline,
        Method::Pull,
        Method::StreamingPull,
        Method::Seek,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::CreateTopic => "CreateTopic",
            Method::GetTopic => "GetTopic",
            Method::UpdateTopic => "UpdateTopic",
            Method::ListTopics => "ListTopics",
            Method::ListTopicSubscriptions => "ListTopicSubscriptions",
            Method::DeleteTopic => "DeleteTopic",
            Method::CreateSubscription => "CreateSubscription",
            Method::GetSubscription => "GetSubscription",
            Method::UpdateSubscription => "UpdateSubscription",
            Method::ListSubscriptions => "ListSubscriptions",
            Method::DeleteSubscription => "DeleteSubscription",
            Method::DetachSubscription => "DetachSubscription",
            Method::Publish => "Publish",
            Method::Acknowledge => "Acknowledge",
            Method::ModifyAckDeadline => "ModifyAckDeadline",
            Method::Pull => "Pull",
            Method::StreamingPull => "StreamingPull",
            Method::Seek => "Seek",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown method {s:?}")))
    }
}

/// What a reactor decided about a request.
pub enum Reaction {
    /// Not handled; try the next reactor, then the real operation.
    Continue,
    /// Handled. `None` returns the operation's empty result; `Some` must hold
    /// a value of the operation's response type.
    Respond(Option<Box<dyn Any + Send>>),
    /// Handled by failing the call.
    Fail(Error),
}

impl Reaction {
    pub fn respond<T: Any + Send>(value: T) -> Self {
        Reaction::Respond(Some(Box::new(value)))
    }
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reaction::Continue => f.write_str("Continue"),
            Reaction::Respond(value) => f
                .debug_tuple("Respond")
                .field(&value.as_ref().map(|_| ".."))
                .finish(),
            Reaction::Fail(err) => f.debug_tuple("Fail").field(err).finish(),
        }
    }
}

/// Intercepts a named operation. `request` is the operation's request value
/// (for `CreateTopic` and `CreateSubscription`, the resource itself).
pub trait Reactor: Send + Sync {
    fn react(&self, method: Method, request: &dyn Any) -> Reaction;
}

impl<F> Reactor for F
where
    F: Fn(Method, &dyn Any) -> Reaction + Send + Sync,
{
    fn react(&self, method: Method, request: &dyn Any) -> Reaction {
        self(method, request)
    }
}

/// Fails every call with a fixed status.
#[derive(Debug, Clone)]
pub struct ErrorInjection {
    code: Code,
    message: String,
}

impl ErrorInjection {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Reactor for ErrorInjection {
    fn react(&self, _method: Method, _request: &dyn Any) -> Reaction {
        Reaction::Fail(Error::new(self.code, self.message.clone()))
    }
}

#[derive(Clone, Default)]
pub struct ReactorRegistry {
    reactors: HashMap<Method, Vec<Arc<dyn Reactor>>>,
}

impl ReactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `reactor` after any already registered for `method`.
    pub fn register(&mut self, method: Method, reactor: impl Reactor + 'static) {
        self.reactors
            .entry(method)
            .or_default()
            .push(Arc::new(reactor));
    }

    pub fn len(&self) -> usize {
        self.reactors.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the reactors for `method`. `None` means no reactor handled the
    /// request and the operation should proceed.
    pub(crate) fn intercept<T>(&self, method: Method, request: &dyn Any) -> Option<Result<T>>
    where
        T: Any + Default,
    {
        for reactor in self.reactors.get(&method)? {
            let outcome = match reactor.react(method, request) {
                Reaction::Continue => continue,
                Reaction::Fail(err) => Err(err),
                Reaction::Respond(None) => Ok(T::default()),
                Reaction::Respond(Some(value)) => value.downcast::<T>().map(|v| *v).map_err(|_| {
                    Error::Internal(format!("reactor for {method} returned a value of the wrong type"))
                }),
            };
            debug!(%method, ok = outcome.is_ok(), "reactor handled call");
            return Some(outcome);
        }
        None
    }
}

impl fmt::Debug for ReactorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (method, reactors) in &self.reactors {
            map.entry(method, &reactors.len());
        }
        map.finish()
    }
}
