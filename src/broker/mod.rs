pub mod context;
pub mod engine;
pub mod message;
pub mod reactor;
pub(crate) mod stream;
pub mod subscription;
pub mod topic;

pub use context::CallContext;
pub use engine::{Broker, BrokerBuilder};
pub use message::{Message, MessageId, Modack};
pub use reactor::{ErrorInjection, Method, Reaction, Reactor, ReactorRegistry};
