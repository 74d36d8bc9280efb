//! Topic management
//!
//! A `Topic` holds the names of the subscriptions attached to it. It does not
//! own them: deleting a topic detaches its subscriptions, which live on in the
//! broker's registry.
//!
//! Concurrency note: callers must hold the broker lock.

use std::collections::BTreeSet;

use crate::protocol::{self, FieldMask};
use crate::utils::error::{Error, Result};

/// Topic name reported by subscriptions whose topic was deleted.
pub const DELETED_TOPIC: &str = "_deleted-topic_";

#[derive(Debug, Default)]
pub struct Topic {
    pub(crate) proto: protocol::Topic,
    pub(crate) subscriptions: BTreeSet<String>,
}

impl Topic {
    pub fn new(proto: protocol::Topic) -> Self {
        Self {
            proto,
            subscriptions: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.proto.name
    }

    /// Attach a subscription. Duplicate attaches are ignored.
    pub fn attach(&mut self, subscription: &str) {
        self.subscriptions.insert(subscription.to_string());
    }

    pub fn detach(&mut self, subscription: &str) {
        self.subscriptions.remove(subscription);
    }

    /// Applies the masked fields of `update`. Every path is checked before
    /// anything changes.
    pub fn apply_update(&mut self, update: &protocol::Topic, mask: &FieldMask) -> Result<()> {
        if mask.paths.is_empty() {
            return Err(Error::InvalidArgument("missing update_mask".to_string()));
        }
        for path in &mask.paths {
            if !matches!(path.as_str(), "labels" | "message_storage_policy") {
                return Err(Error::InvalidArgument(format!("unknown field name {path:?}")));
            }
        }
        for path in &mask.paths {
            match path.as_str() {
                "labels" => self.proto.labels = update.labels.clone(),
                _ => self.proto.message_storage_policy = update.message_storage_policy.clone(),
            }
        }
        Ok(())
    }
}

/// Whether `name` has the `projects/*/topics/*` shape.
pub fn is_valid_topic_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('/').collect();
    matches!(
        parts.as_slice(),
        ["projects", project, "topics", topic] if !project.is_empty() && !topic.is_empty()
    )
}
