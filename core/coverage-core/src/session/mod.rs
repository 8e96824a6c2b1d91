//! Per-target session state machine.
//!
//! A session is always in exactly one of three states, and every transition
//! checks the current one explicitly:
//!
//! ```text
//!             init                 INITIALIZED
//!   NoData ─────────► Initializing ────────────► Ready ──┐
//!     ▲                  ▲    │ init (conflict)    │     │ start / cancel /
//!     │                  │    └────────┘           │     │ data / finish
//!     │                  └──────── init ───────────┘◄────┘
//! ```
//!
//! A session never holds a lock itself; its owner (the target's worker)
//! serializes every call.

mod finish;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use coverage_daemon_protocol::{ProbeRecord, TargetInfo};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analysis::{CoverageAnalyzer, CoverageTree, MethodSet};
use crate::config::EngineConfig;
use crate::error::{ProbeError, SessionError};
use crate::probes::{ExecutionIndex, ProbeAggregator};
use crate::registry::{ClassRegistry, ClassRegistryBuilder, ClassSetDigest};
use crate::report::FinishReport;
use crate::scope::ScopeExporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateName {
    NoData,
    Initializing,
    Ready,
}

impl StateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateName::NoData => "no_data",
            StateName::Initializing => "initializing",
            StateName::Ready => "ready",
        }
    }
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct InitBuffer {
    classes: ClassRegistryBuilder,
    probes: Arc<ProbeAggregator>,
    baseline: Option<Arc<CoverageTree>>,
    previous_digest: Option<ClassSetDigest>,
}

#[derive(Debug)]
struct ReadyState {
    classes: Arc<ClassRegistry>,
    digest: ClassSetDigest,
    /// Tree of the last finish cycle (or the zero tree right after init).
    tree: Arc<CoverageTree>,
    /// Probes of every finished run in this generation.
    executed: ExecutionIndex,
    baseline: Option<Arc<CoverageTree>>,
    /// Methods of the previous class generation.
    known_methods: Arc<MethodSet>,
    probes: Arc<ProbeAggregator>,
    collecting: Option<String>,
}

#[derive(Debug)]
enum SessionState {
    NoData,
    Initializing(InitBuffer),
    Ready(ReadyState),
}

impl SessionState {
    fn name(&self) -> StateName {
        match self {
            SessionState::NoData => StateName::NoData,
            SessionState::Initializing(_) => StateName::Initializing,
            SessionState::Ready(_) => StateName::Ready,
        }
    }
}

/// Result of `INITIALIZED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finalized {
    /// The class set differs from the previous generation (or there was none).
    pub changed: bool,
    pub classes: usize,
}

/// Result of one `COVERAGE_DATA_PART`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartSummary {
    pub accepted: usize,
    pub rejected: usize,
}

/// Point-in-time view of a session for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub target_id: String,
    pub build_version: String,
    pub state: StateName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_classes: Option<usize>,
    pub classes: usize,
    pub buffered_probes: usize,
    pub probe_capacity: usize,
    pub collecting: Option<String>,
    pub coverage: Option<f64>,
}

#[derive(Debug)]
pub struct Session {
    target: TargetInfo,
    config: Arc<EngineConfig>,
    state: SessionState,
}

impl Session {
    pub fn new(target: TargetInfo, config: Arc<EngineConfig>) -> Self {
        Self {
            target,
            config,
            state: SessionState::NoData,
        }
    }

    pub fn state_name(&self) -> StateName {
        self.state.name()
    }

    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    /// Replaces target metadata; the session itself is untouched.
    pub fn set_target(&mut self, target: TargetInfo) {
        if target != self.target {
            debug!(
                target_id = %target.id,
                build_version = %target.build_version,
                "Target metadata updated"
            );
            self.target = target;
        }
    }

    /// Probe buffer reachable from outside the worker. Only while ready.
    pub fn probes(&self) -> Option<Arc<ProbeAggregator>> {
        match &self.state {
            SessionState::Ready(ready) => Some(Arc::clone(&ready.probes)),
            _ => None,
        }
    }

    pub fn classes(&self) -> Option<Arc<ClassRegistry>> {
        match &self.state {
            SessionState::Ready(ready) => Some(Arc::clone(&ready.classes)),
            _ => None,
        }
    }

    pub fn tree(&self) -> Option<Arc<CoverageTree>> {
        match &self.state {
            SessionState::Ready(ready) => Some(Arc::clone(&ready.tree)),
            _ => None,
        }
    }

    pub fn baseline(&self) -> Option<Arc<CoverageTree>> {
        match &self.state {
            SessionState::Initializing(buffer) => buffer.baseline.clone(),
            SessionState::Ready(ready) => ready.baseline.clone(),
            SessionState::NoData => None,
        }
    }

    pub fn collecting(&self) -> Option<&str> {
        match &self.state {
            SessionState::Ready(ready) => ready.collecting.as_deref(),
            _ => None,
        }
    }

    /// Starts a new class generation. Valid in every state.
    pub fn init(&mut self, expected: usize) {
        let (baseline, previous_digest) = match &self.state {
            SessionState::NoData => (None, None),
            SessionState::Initializing(buffer) => {
                let conflict = SessionError::TransitionConflict {
                    discarded: "earlier initialization",
                };
                warn!(
                    target_id = %self.target.id,
                    code = conflict.code(),
                    discarded_classes = buffer.classes.len(),
                    "{}", conflict
                );
                (None, None)
            }
            SessionState::Ready(ready) => {
                (Some(Arc::clone(&ready.tree)), Some(ready.digest.clone()))
            }
        };

        let capacity = self.config.probe_capacity(expected);
        self.state = SessionState::Initializing(InitBuffer {
            classes: ClassRegistryBuilder::new(expected),
            probes: Arc::new(ProbeAggregator::new(self.config.probe_shards, capacity)),
            baseline,
            previous_digest,
        });
        info!(
            target_id = %self.target.id,
            expected_classes = expected,
            probe_capacity = capacity,
            "Session initializing"
        );
    }

    pub fn add_class(&mut self, name: String, bytes: Vec<u8>) -> Result<(), SessionError> {
        match &mut self.state {
            SessionState::Initializing(buffer) => {
                buffer.classes.add(name, bytes);
                Ok(())
            }
            other => Err(wrong_state("CLASS_BYTES", other.name())),
        }
    }

    /// Freezes the class set and builds the zero-coverage tree.
    pub fn finalize_init(&mut self, analyzer: &CoverageAnalyzer) -> Result<Finalized, SessionError> {
        let buffer = match std::mem::replace(&mut self.state, SessionState::NoData) {
            SessionState::Initializing(buffer) => buffer,
            other => {
                let state = other.name();
                self.state = other;
                return Err(wrong_state("INITIALIZED", state));
            }
        };

        if buffer.classes.len() != buffer.classes.expected() {
            warn!(
                target_id = %self.target.id,
                expected = buffer.classes.expected(),
                received = buffer.classes.len(),
                "Class count differs from INIT"
            );
        }

        let classes = Arc::new(buffer.classes.build());
        let digest = classes.digest();
        let changed = match &buffer.previous_digest {
            Some(previous) => {
                let names = digest.changed_since(previous);
                if !names.is_empty() {
                    debug!(target_id = %self.target.id, classes = ?names, "Class set changed");
                }
                !names.is_empty()
            }
            None => !digest.is_empty(),
        };

        let tree = Arc::new(analyzer.analyze(&classes, &ExecutionIndex::default()));
        let known_methods = buffer
            .baseline
            .as_ref()
            .map(|baseline| baseline.method_ids())
            .unwrap_or_default();

        let finalized = Finalized {
            changed,
            classes: classes.len(),
        };
        self.state = SessionState::Ready(ReadyState {
            classes,
            digest,
            tree,
            executed: ExecutionIndex::default(),
            baseline: buffer.baseline,
            known_methods: Arc::new(known_methods),
            probes: buffer.probes,
            collecting: None,
        });
        info!(
            target_id = %self.target.id,
            classes = finalized.classes,
            changed = finalized.changed,
            "Session ready"
        );
        Ok(finalized)
    }

    pub fn session_start(&mut self, session_id: String) -> Result<(), SessionError> {
        let ready = self.ready_mut("SESSION_STARTED")?;
        if let Some(previous) = ready.collecting.replace(session_id) {
            debug!(previous = %previous, "Collection restarted");
        }
        Ok(())
    }

    /// Stops collection and drops the in-flight probes. The tree and baseline
    /// are untouched. Returns the number of buffered entries discarded.
    pub fn session_cancel(&mut self, session_id: &str) -> Result<usize, SessionError> {
        let ready = self.ready_mut("SESSION_CANCELLED")?;
        ready.collecting = None;
        let dropped = ready.probes.clear();
        debug!(session_id = %session_id, dropped, "Collection cancelled");
        Ok(dropped)
    }

    /// Merges a batch of probe records. A record with a conflicting length is
    /// dropped; a full buffer cancels the whole cycle.
    pub fn coverage_data_part(
        &mut self,
        records: Vec<ProbeRecord>,
    ) -> Result<PartSummary, SessionError> {
        let target_id = self.target.id.clone();
        let ready = self.ready_mut("COVERAGE_DATA_PART")?;

        let mut summary = PartSummary::default();
        for record in records {
            match ready.probes.submit(record) {
                Ok(()) => summary.accepted += 1,
                Err(err @ ProbeError::LengthMismatch { .. }) => {
                    warn!(target_id = %target_id, code = err.code(), error = %err, "Probe record dropped");
                    summary.rejected += 1;
                }
                Err(err @ ProbeError::CapacityExceeded { .. }) => {
                    ready.collecting = None;
                    let dropped = ready.probes.clear();
                    warn!(
                        target_id = %target_id,
                        code = err.code(),
                        dropped,
                        "Probe buffer full; collection cancelled"
                    );
                    return Err(err.into());
                }
            }
        }
        Ok(summary)
    }

    /// Cancels collection after a sink hit the buffer bound. Ignored when
    /// `probes` no longer belongs to this generation or nothing was running.
    pub fn implicit_cancel(&mut self, probes: &Arc<ProbeAggregator>) -> bool {
        let SessionState::Ready(ready) = &mut self.state else {
            return false;
        };
        if !Arc::ptr_eq(&ready.probes, probes) {
            return false;
        }
        let was_collecting = ready.collecting.take().is_some();
        let dropped = ready.probes.clear();
        if was_collecting || dropped > 0 {
            warn!(
                target_id = %self.target.id,
                code = "probe_capacity_exceeded",
                dropped,
                "Probe buffer full; collection cancelled"
            );
            true
        } else {
            false
        }
    }

    /// Drains the probes into the generation's executed set and runs the full
    /// finish pipeline. Coverage spans every finished run since `INITIALIZED`;
    /// attribution and the scope cover only this run. The new tree becomes
    /// the reference for the next cycle's direction.
    pub fn session_finish(
        &mut self,
        analyzer: &CoverageAnalyzer,
        exporter: &ScopeExporter,
        now: DateTime<Utc>,
    ) -> Result<FinishReport, SessionError> {
        let target = self.target.clone();
        let ready = self.ready_mut("SESSION_FINISHED")?;
        ready.collecting = None;
        let records = ready.probes.drain();
        ready.executed.extend(&records);

        let (tree, report) = finish::run(
            finish::Inputs {
                target: &target,
                classes: &ready.classes,
                executed: &ready.executed,
                previous: &ready.tree,
                known_methods: &ready.known_methods,
                records,
            },
            analyzer,
            exporter,
            now,
        );
        ready.tree = Arc::new(tree);
        info!(
            target_id = %target.id,
            coverage = ?report.coverage.coverage,
            direction = ?report.direction,
            new_methods = report.new_methods.len(),
            tests = report.tests_usages.len(),
            "Session finished"
        );
        Ok(report)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (expected_classes, classes, probes, collecting, coverage) = match &self.state {
            SessionState::NoData => (None, 0, None, None, None),
            SessionState::Initializing(buffer) => (
                Some(buffer.classes.expected()),
                buffer.classes.len(),
                Some(&buffer.probes),
                None,
                None,
            ),
            SessionState::Ready(ready) => (
                None,
                ready.classes.len(),
                Some(&ready.probes),
                ready.collecting.clone(),
                ready.tree.percent(),
            ),
        };
        SessionSnapshot {
            target_id: self.target.id.clone(),
            build_version: self.target.build_version.clone(),
            state: self.state_name(),
            expected_classes,
            classes,
            buffered_probes: probes.map(|p| p.len()).unwrap_or(0),
            probe_capacity: probes.map(|p| p.capacity()).unwrap_or(0),
            collecting,
            coverage,
        }
    }

    fn ready_mut(&mut self, event: &'static str) -> Result<&mut ReadyState, SessionError> {
        match &mut self.state {
            SessionState::Ready(ready) => Ok(ready),
            other => Err(wrong_state(event, other.name())),
        }
    }
}

fn wrong_state(event: &'static str, state: StateName) -> SessionError {
    SessionError::WrongState { event, state }
}
