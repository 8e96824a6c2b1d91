//! Latest payload per (target, topic), served to polling observers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use coverage_core::{Broadcaster, TargetInfo, Topic};
use serde_json::Value;
use tracing::debug;

#[derive(Default)]
pub struct TopicCache {
    latest: Mutex<HashMap<(String, Topic), Value>>,
}

impl TopicCache {
    pub fn latest(&self, target_id: &str, topic: Topic) -> Option<Value> {
        self.lock().get(&(target_id.to_string(), topic)).cloned()
    }

    /// Topics that have been published for a target, in path order.
    pub fn topics_for(&self, target_id: &str) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .lock()
            .keys()
            .filter(|(id, _)| id == target_id)
            .map(|(_, topic)| *topic)
            .collect();
        topics.sort();
        topics
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, Topic), Value>> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Broadcaster for TopicCache {
    fn send(&self, target: &TargetInfo, topic: Topic, payload: Value) {
        debug!(target_id = %target.id, topic = topic.path(), "Topic updated");
        self.lock().insert((target.id.clone(), topic), payload);
    }
}
