//! Per-target workers.
//!
//! Every target id gets one thread and one bounded FIFO queue. The thread
//! owns the target's [`Session`] outright, so events for one target apply in
//! arrival order while different targets run fully in parallel. Probe
//! submission can bypass the queue through a [`ProbeSink`], which only
//! touches the session's concurrent probe buffer.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use coverage_daemon_protocol::{parse_event, CoverageEvent, EventKind, ProbeRecord, TargetInfo, Topic};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::analysis::{CoverageAnalyzer, StructureAnalyzer};
use crate::config::EngineConfig;
use crate::error::{EngineError, ProbeError, SessionError};
use crate::probes::ProbeAggregator;
use crate::publish::{self, Broadcaster, ScopeStore};
use crate::report::CollectionState;
use crate::scope::ScopeExporter;
use crate::session::{Session, StateName};

pub use crate::session::SessionSnapshot;

/// Session id used for the zero-baseline cycle after a class set change.
const CLASS_CHANGE_SESSION: &str = "class-set-changed";

/// What an accepted event did to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventOutcome {
    pub state: StateName,
    /// Probe records dropped for a length mismatch.
    pub rejected_records: usize,
    /// A finish cycle ran (explicitly or after a class set change).
    pub finished: bool,
}

type Reply = Sender<Result<EventOutcome, EngineError>>;

enum Command {
    Event {
        target: TargetInfo,
        event: CoverageEvent,
        reply: Option<Reply>,
    },
    ImplicitCancel(Arc<ProbeAggregator>),
    Snapshot(Sender<SessionSnapshot>),
    Shutdown,
}

/// What a sink needs to know without asking the worker.
#[derive(Debug)]
struct SlotState {
    state: StateName,
    probes: Option<Arc<ProbeAggregator>>,
}

struct Worker {
    commands: SyncSender<Command>,
    slot: Arc<RwLock<SlotState>>,
    handle: Option<JoinHandle<()>>,
}

struct EngineInner {
    config: Arc<EngineConfig>,
    analyzer: CoverageAnalyzer,
    exporter: ScopeExporter,
    broadcaster: Arc<dyn Broadcaster>,
    store: Arc<dyn ScopeStore>,
}

pub struct CoverageEngine {
    inner: Arc<EngineInner>,
    workers: Mutex<HashMap<String, Worker>>,
    closed: AtomicBool,
}

impl CoverageEngine {
    pub fn new(
        config: EngineConfig,
        analyzer: Arc<dyn StructureAnalyzer>,
        broadcaster: Arc<dyn Broadcaster>,
        store: Arc<dyn ScopeStore>,
    ) -> Self {
        let exporter = ScopeExporter::from_config(&config);
        Self {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                analyzer: CoverageAnalyzer::new(analyzer),
                exporter,
                broadcaster,
                store,
            }),
            workers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Queues an event and returns immediately. Failures are only logged.
    pub fn dispatch(&self, target: &TargetInfo, event: CoverageEvent) -> Result<(), EngineError> {
        let (commands, _) = self.worker(target)?;
        commands
            .send(Command::Event {
                target: target.clone(),
                event,
                reply: None,
            })
            .map_err(|_| EngineError::TargetUnavailable(target.id.clone()))
    }

    /// Queues an event and waits for the worker to apply it.
    pub fn process(
        &self,
        target: &TargetInfo,
        event: CoverageEvent,
    ) -> Result<EventOutcome, EngineError> {
        let (commands, _) = self.worker(target)?;
        let (reply, outcome) = mpsc::channel();
        commands
            .send(Command::Event {
                target: target.clone(),
                event,
                reply: Some(reply),
            })
            .map_err(|_| EngineError::TargetUnavailable(target.id.clone()))?;
        outcome
            .recv()
            .map_err(|_| EngineError::TargetUnavailable(target.id.clone()))?
    }

    /// Parses a raw `{type, data}` envelope and processes it.
    pub fn process_raw(
        &self,
        target: &TargetInfo,
        kind: EventKind,
        data: Value,
    ) -> Result<EventOutcome, EngineError> {
        let event = parse_event(kind, data).map_err(|err| {
            warn!(
                target_id = %target.id,
                event = kind.as_str(),
                code = "malformed_payload",
                error = %err.message,
                "Event dropped"
            );
            EngineError::MalformedPayload(err.message)
        })?;
        self.process(target, event)
    }

    /// Handle for submitting probes straight into the target's buffer.
    pub fn probe_sink(&self, target: &TargetInfo) -> Result<ProbeSink, EngineError> {
        let (commands, slot) = self.worker(target)?;
        Ok(ProbeSink {
            target_id: target.id.clone(),
            slot,
            commands,
        })
    }

    /// `None` for a target that has never sent an event.
    pub fn session_state(&self, target_id: &str) -> Option<SessionSnapshot> {
        let commands = lock(&self.workers)
            .get(target_id)
            .map(|worker| worker.commands.clone())?;
        let (reply, snapshot) = mpsc::channel();
        commands.send(Command::Snapshot(reply)).ok()?;
        snapshot.recv().ok()
    }

    pub fn target_count(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Stops every worker after it drains the events already queued.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let workers: Vec<(String, Worker)> = lock(&self.workers).drain().collect();
        for (target_id, mut worker) in workers {
            let _ = worker.commands.send(Command::Shutdown);
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!(target_id = %target_id, "Coverage worker panicked during shutdown");
                }
            }
        }
    }

    fn worker(
        &self,
        target: &TargetInfo,
    ) -> Result<(SyncSender<Command>, Arc<RwLock<SlotState>>), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::TargetUnavailable(target.id.clone()));
        }
        let mut workers = lock(&self.workers);
        if let Some(worker) = workers.get(&target.id) {
            return Ok((worker.commands.clone(), Arc::clone(&worker.slot)));
        }

        let (commands, queue) = mpsc::sync_channel(self.inner.config.queue_capacity.max(1));
        let slot = Arc::new(RwLock::new(SlotState {
            state: StateName::NoData,
            probes: None,
        }));
        let session = Session::new(target.clone(), Arc::clone(&self.inner.config));
        let inner = Arc::clone(&self.inner);
        let worker_slot = Arc::clone(&slot);
        let handle = thread::Builder::new()
            .name(format!("coverage-{}", target.id))
            .spawn(move || run_worker(inner, session, queue, worker_slot))
            .map_err(|err| {
                error!(target_id = %target.id, error = %err, "Failed to spawn coverage worker");
                EngineError::TargetUnavailable(target.id.clone())
            })?;

        info!(target_id = %target.id, build_version = %target.build_version, "Tracking new target");
        workers.insert(
            target.id.clone(),
            Worker {
                commands: commands.clone(),
                slot: Arc::clone(&slot),
                handle: Some(handle),
            },
        );
        Ok((commands, slot))
    }
}

impl Drop for CoverageEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    inner: Arc<EngineInner>,
    mut session: Session,
    queue: Receiver<Command>,
    slot: Arc<RwLock<SlotState>>,
) {
    for command in queue {
        match command {
            Command::Event {
                target,
                event,
                reply,
            } => {
                let kind = event.kind();
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    inner.handle(&mut session, target, event)
                }))
                .unwrap_or_else(|_| {
                    error!(
                        target_id = %session.target().id,
                        event = kind.as_str(),
                        "Event handler panicked"
                    );
                    Err(EngineError::Panicked(kind.as_str()))
                });
                if let Err(err) = &result {
                    warn!(
                        target_id = %session.target().id,
                        event = kind.as_str(),
                        code = err.code(),
                        error = %err,
                        "Event dropped"
                    );
                }
                publish_slot(&slot, &session);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::ImplicitCancel(probes) => {
                if session.implicit_cancel(&probes) {
                    inner.publish_collection_state(session.target(), false);
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(session.snapshot());
            }
            Command::Shutdown => break,
        }
    }
    debug!(target_id = %session.target().id, "Coverage worker stopped");
}

fn publish_slot(slot: &RwLock<SlotState>, session: &Session) {
    let mut slot = slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.state = session.state_name();
    slot.probes = session.probes();
}

impl EngineInner {
    fn handle(
        &self,
        session: &mut Session,
        target: TargetInfo,
        event: CoverageEvent,
    ) -> Result<EventOutcome, EngineError> {
        session.set_target(target);
        let mut outcome = EventOutcome {
            state: session.state_name(),
            rejected_records: 0,
            finished: false,
        };

        match event {
            CoverageEvent::Init(info) => {
                if !info.message.is_empty() {
                    info!(target_id = %session.target().id, message = %info.message, "Agent init");
                }
                session.init(info.classes_count);
            }
            CoverageEvent::ClassBytes(class) => session.add_class(class.class_name, class.bytes)?,
            CoverageEvent::Initialized(message) => {
                let finalized = session.finalize_init(&self.analyzer)?;
                debug!(target_id = %session.target().id, message = %message, "Agent initialized");
                if finalized.changed {
                    session.session_start(CLASS_CHANGE_SESSION.to_string())?;
                    self.finish(session)?;
                    outcome.finished = true;
                }
            }
            CoverageEvent::SessionStarted(session_id) => {
                session.session_start(session_id.clone())?;
                info!(target_id = %session.target().id, session_id = %session_id, "Collection started");
                self.publish_collection_state(session.target(), true);
            }
            CoverageEvent::SessionCancelled(session_id) => {
                session.session_cancel(&session_id)?;
                info!(target_id = %session.target().id, session_id = %session_id, "Collection cancelled");
                self.publish_collection_state(session.target(), false);
            }
            CoverageEvent::CoverageDataPart(records) => match session.coverage_data_part(records) {
                Ok(summary) => outcome.rejected_records = summary.rejected,
                Err(err @ SessionError::Probe(ProbeError::CapacityExceeded { .. })) => {
                    self.publish_collection_state(session.target(), false);
                    return Err(err.into());
                }
                Err(err) => return Err(err.into()),
            },
            CoverageEvent::SessionFinished => {
                self.finish(session)?;
                outcome.finished = true;
            }
        }

        outcome.state = session.state_name();
        Ok(outcome)
    }

    /// Runs the pipeline, then publishes and stores with nothing locked.
    fn finish(&self, session: &mut Session) -> Result<(), SessionError> {
        let report = session.session_finish(&self.analyzer, &self.exporter, Utc::now())?;
        let target = session.target();
        let broadcaster = self.broadcaster.as_ref();

        self.publish_collection_state(target, false);
        publish::send(broadcaster, target, Topic::Coverage, &report.coverage);
        publish::send(broadcaster, target, Topic::CoverageNew, &report.coverage_new);
        publish::send(broadcaster, target, Topic::NewMethods, &report.new_methods);
        publish::send(broadcaster, target, Topic::CoverageByPackages, &report.packages);
        publish::send(broadcaster, target, Topic::TestsUsages, &report.tests_usages);
        if !report.associated_tests.is_empty() {
            publish::send(
                broadcaster,
                target,
                Topic::AssociatedTests,
                &report.associated_tests,
            );
        }
        publish::store(self.store.as_ref(), target, &report.scope);
        Ok(())
    }

    fn publish_collection_state(&self, target: &TargetInfo, active: bool) {
        publish::send(
            self.broadcaster.as_ref(),
            target,
            Topic::CollectionState,
            &CollectionState { active },
        );
    }
}

/// Cloneable handle that merges probes into a ready session from any thread.
#[derive(Clone)]
pub struct ProbeSink {
    target_id: String,
    slot: Arc<RwLock<SlotState>>,
    commands: SyncSender<Command>,
}

impl ProbeSink {
    /// Merges one record. A full buffer asks the worker to cancel the cycle.
    pub fn submit(&self, record: ProbeRecord) -> Result<(), SessionError> {
        let probes = {
            let slot = self.slot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            match (&slot.state, &slot.probes) {
                (StateName::Ready, Some(probes)) => Arc::clone(probes),
                (state, _) => {
                    return Err(SessionError::WrongState {
                        event: "COVERAGE_DATA_PART",
                        state: *state,
                    })
                }
            }
        };
        self.submit_to(probes, record)
    }

    fn submit_to(
        &self,
        probes: Arc<ProbeAggregator>,
        record: ProbeRecord,
    ) -> Result<(), SessionError> {
        match probes.submit(record) {
            Ok(()) => self.ensure_current(&probes),
            Err(err @ ProbeError::CapacityExceeded { .. }) => {
                let _ = self.commands.send(Command::ImplicitCancel(probes));
                Err(err.into())
            }
            Err(err) => {
                warn!(target_id = %self.target_id, code = err.code(), error = %err, "Probe record dropped");
                Err(err.into())
            }
        }
    }

    // An INIT applied between reading the slot and merging leaves the record
    // in a buffer no finish will ever drain.
    fn ensure_current(&self, probes: &Arc<ProbeAggregator>) -> Result<(), SessionError> {
        let slot = self.slot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = matches!(&slot.probes, Some(live) if Arc::ptr_eq(live, probes));
        if current {
            return Ok(());
        }
        let err = SessionError::TransitionConflict {
            discarded: "probe record",
        };
        debug!(target_id = %self.target_id, code = err.code(), "{}", err);
        Err(err)
    }
}

impl std::fmt::Debug for ProbeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSink")
            .field("target_id", &self.target_id)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ProbeLayoutAnalyzer;
    use crate::error::StoreError;
    use crate::scope::Scope;
    use coverage_daemon_protocol::{ClassBytes, InitInfo};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, Topic, Value)>>,
    }

    impl Broadcaster for Recorder {
        fn send(&self, target: &TargetInfo, topic: Topic, payload: Value) {
            lock(&self.sent).push((target.id.clone(), topic, payload));
        }
    }

    #[derive(Default)]
    struct NullStore;

    impl ScopeStore for NullStore {
        fn store(&self, _target: &TargetInfo, _scope: &Scope) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn target(id: &str) -> TargetInfo {
        TargetInfo {
            id: id.to_string(),
            name: id.to_string(),
            build_version: "1.0".to_string(),
            group: None,
        }
    }

    fn engine(recorder: Arc<Recorder>) -> CoverageEngine {
        CoverageEngine::new(
            EngineConfig::default(),
            Arc::new(ProbeLayoutAnalyzer),
            recorder,
            Arc::new(NullStore),
        )
    }

    fn make_ready(engine: &CoverageEngine, target: &TargetInfo) {
        engine
            .process(
                target,
                CoverageEvent::Init(InitInfo {
                    classes_count: 1,
                    message: String::new(),
                }),
            )
            .expect("init");
        engine
            .process(
                target,
                CoverageEvent::ClassBytes(ClassBytes {
                    class_name: "a/A".to_string(),
                    bytes: br#"{"methods":[{"name":"run","desc":"()V","probes":2}]}"#.to_vec(),
                }),
            )
            .expect("class");
        engine
            .process(target, CoverageEvent::Initialized(String::new()))
            .expect("initialized");
    }

    #[test]
    fn unknown_target_starts_in_no_data() {
        let engine = engine(Arc::new(Recorder::default()));
        let target = target("fresh");
        let err = engine
            .process(&target, CoverageEvent::SessionFinished)
            .unwrap_err();
        assert_eq!(err.code(), "wrong_state");
        let snapshot = engine.session_state("fresh").expect("snapshot");
        assert_eq!(snapshot.state, StateName::NoData);
        assert!(engine.session_state("never-seen").is_none());
    }

    #[test]
    fn malformed_payload_is_rejected_before_the_worker() {
        let engine = engine(Arc::new(Recorder::default()));
        let err = engine
            .process_raw(&target("t"), EventKind::Init, json!({"classesCount": "many"}))
            .unwrap_err();
        assert_eq!(err.code(), "malformed_payload");
        assert_eq!(engine.target_count(), 0);
    }

    #[test]
    fn changed_class_set_runs_a_zero_cycle() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine(Arc::clone(&recorder));
        make_ready(&engine, &target("svc"));

        let sent = lock(&recorder.sent);
        let topics: Vec<Topic> = sent.iter().map(|(_, topic, _)| *topic).collect();
        assert_eq!(
            topics,
            vec![
                Topic::CollectionState,
                Topic::Coverage,
                Topic::CoverageNew,
                Topic::NewMethods,
                Topic::CoverageByPackages,
                Topic::TestsUsages,
            ]
        );
        assert_eq!(sent[1].2["coverage"], json!(0.0));
    }

    #[test]
    fn sink_requires_ready_session() {
        let engine = engine(Arc::new(Recorder::default()));
        let target = target("svc");
        let sink = engine.probe_sink(&target).expect("sink");
        let record = ProbeRecord {
            id: 1,
            class_name: "a/A".to_string(),
            probes: vec![true, true],
            test_name: None,
        };
        assert_eq!(
            sink.submit(record.clone()).unwrap_err().code(),
            "wrong_state"
        );

        make_ready(&engine, &target);
        sink.submit(record).expect("ready sink");
        assert_eq!(
            engine.session_state("svc").expect("snapshot").buffered_probes,
            1
        );
    }

    #[test]
    fn sink_reports_records_that_miss_a_reinit() {
        let engine = engine(Arc::new(Recorder::default()));
        let target = target("svc");
        make_ready(&engine, &target);
        let sink = engine.probe_sink(&target).expect("sink");
        let stale = sink
            .slot
            .read()
            .expect("slot")
            .probes
            .clone()
            .expect("ready probes");

        make_ready(&engine, &target);
        let record = ProbeRecord {
            id: 1,
            class_name: "a/A".to_string(),
            probes: vec![true, false],
            test_name: Some("t1".to_string()),
        };
        let err = sink.submit_to(stale, record.clone()).unwrap_err();
        assert_eq!(err.code(), "transition_conflict");
        assert_eq!(
            engine.session_state("svc").expect("snapshot").buffered_probes,
            0
        );

        sink.submit(record).expect("current generation");
        assert_eq!(
            engine.session_state("svc").expect("snapshot").buffered_probes,
            1
        );
    }

    #[test]
    fn shutdown_refuses_new_work() {
        let engine = engine(Arc::new(Recorder::default()));
        make_ready(&engine, &target("svc"));
        engine.shutdown();
        assert_eq!(engine.target_count(), 0);
        let err = engine
            .process(&target("svc"), CoverageEvent::SessionFinished)
            .unwrap_err();
        assert_eq!(err.code(), "target_unavailable");
    }
}
