//! Outbound collaborators: observer broadcast and scope storage.
//!
//! Both are called from a target's worker with no engine lock held. Their
//! failures are logged and never reach the session.

use coverage_daemon_protocol::{TargetInfo, Topic};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::StoreError;
use crate::scope::Scope;

pub trait Broadcaster: Send + Sync {
    fn send(&self, target: &TargetInfo, topic: Topic, payload: Value);
}

pub trait ScopeStore: Send + Sync {
    fn store(&self, target: &TargetInfo, scope: &Scope) -> Result<(), StoreError>;
}

pub(crate) fn send<T: Serialize>(
    broadcaster: &dyn Broadcaster,
    target: &TargetInfo,
    topic: Topic,
    payload: &T,
) {
    match serde_json::to_value(payload) {
        Ok(value) => broadcaster.send(target, topic, value),
        Err(err) => warn!(
            target_id = %target.id,
            topic = topic.path(),
            error = %err,
            "Failed to serialize topic payload"
        ),
    }
}

pub(crate) fn store(store: &dyn ScopeStore, target: &TargetInfo, scope: &Scope) {
    if let Err(err) = store.store(target, scope) {
        warn!(target_id = %target.id, scope = %scope.id, error = %err, "Failed to store scope");
    }
}
