use serde::Serialize;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::settings::TopicDefinition;
use crate::protocol;
use crate::utils::error::Code;

/// What [`provision`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub topics_created: usize,
    pub subscriptions_created: usize,
    /// Definitions that already existed.
    pub skipped: usize,
    pub failed: usize,
}

/// Creates the configured topics and subscriptions through the regular
/// broker operations. Existing resources are left alone, so provisioning is
/// safe to repeat. Failures are logged and counted, never fatal.
pub fn provision(broker: &Broker, topics: &[TopicDefinition]) -> ProvisionReport {
    let mut report = ProvisionReport::default();
    for def in topics {
        match broker.create_topic(protocol::Topic::new(def.name.clone())) {
            Ok(_) => report.topics_created += 1,
            Err(err) if err.code() == Code::AlreadyExists => report.skipped += 1,
            Err(err) => {
                warn!(topic = %def.name, error = %err, "could not provision topic");
                report.failed += 1 + def.subscriptions.len();
                continue;
            }
        }

        for sub in &def.subscriptions {
            match broker.create_subscription(sub.to_subscription(&def.name)) {
                Ok(_) => report.subscriptions_created += 1,
                Err(err) if err.code() == Code::AlreadyExists => report.skipped += 1,
                Err(err) => {
                    warn!(subscription = %sub.name, error = %err, "could not provision subscription");
                    report.failed += 1;
                }
            }
        }
    }
    info!(
        topics = report.topics_created,
        subscriptions = report.subscriptions_created,
        skipped = report.skipped,
        failed = report.failed,
        "provisioning finished"
    );
    report
}
