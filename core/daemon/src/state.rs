//! State shared by every connection thread.
//!
//! The engine owns all session state; the daemon only keeps the collaborator
//! implementations it handed to the engine so it can read them back.

use std::sync::Arc;

use coverage_core::{
    CoverageEngine, CoverageEvent, EngineConfig, EngineError, EventOutcome, ProbeLayoutAnalyzer,
    SessionSnapshot, TargetInfo, Topic,
};
use serde_json::Value;

use crate::db::{Db, ScopeRow};
use crate::topics::TopicCache;

pub struct SharedState {
    engine: CoverageEngine,
    topics: Arc<TopicCache>,
    db: Arc<Db>,
}

impl SharedState {
    pub fn new(db: Db, config: EngineConfig) -> Self {
        let topics = Arc::new(TopicCache::default());
        let db = Arc::new(db);
        let engine = CoverageEngine::new(
            config,
            Arc::new(ProbeLayoutAnalyzer),
            topics.clone(),
            db.clone(),
        );
        Self { engine, topics, db }
    }

    pub fn apply_event(
        &self,
        target: &TargetInfo,
        event: CoverageEvent,
    ) -> Result<EventOutcome, EngineError> {
        self.engine.process(target, event)
    }

    pub fn target_count(&self) -> usize {
        self.engine.target_count()
    }

    pub fn topic(&self, target_id: &str, topic: Topic) -> Option<Value> {
        self.topics.latest(target_id, topic)
    }

    pub fn published_topics(&self, target_id: &str) -> Vec<Topic> {
        self.topics.topics_for(target_id)
    }

    pub fn session_snapshot(&self, target_id: &str) -> Option<SessionSnapshot> {
        self.engine.session_state(target_id)
    }

    pub fn scopes(&self, target_id: Option<&str>) -> Result<Vec<ScopeRow>, String> {
        self.db.list_scopes(target_id)
    }
}
