//! # coverage-core
//!
//! The coverage session engine behind the coverage daemon. It ingests class
//! metadata and execution probes per monitored target, and turns them into
//! coverage snapshots, deltas against the previous baseline, and
//! test-to-code attribution.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Each target is driven by one
//!   worker thread fed through an ordered queue.
//! - **Single owner per target**: Session state is never shared; only the probe
//!   buffer is reachable from other threads, through [`ProbeSink`].
//! - **Never fatal**: Bad events are logged and dropped. A failing class
//!   contributes zero coverage instead of failing the cycle.
//! - **Collaborators at the edges**: Structural analysis, broadcasting and
//!   storage are traits injected by the host.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use coverage_core::{CoverageEngine, EngineConfig, ProbeLayoutAnalyzer};
//!
//! let engine = CoverageEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(ProbeLayoutAnalyzer),
//!     broadcaster,
//!     store,
//! );
//! engine.process(&target, CoverageEvent::Init(info))?;
//! ```

pub mod analysis;
pub mod assoc;
pub mod bitmap;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod probes;
pub mod publish;
pub mod registry;
pub mod report;
pub mod scope;
pub mod session;

pub use analysis::{
    declaration, ClassCoverage, CoverageAnalyzer, CoverageTree, Counter, ElementKey,
    MethodCoverage, MethodId, MethodSet, PackageCoverage, ProbeLayoutAnalyzer, StructureAnalyzer,
};
pub use assoc::{AssocIndex, AssociatedTestTracker};
pub use bitmap::ProbeBitmap;
pub use config::EngineConfig;
pub use diff::{diff, Arrow, CoverageDiff, Direction, NewMethod, NewMethodsStats};
pub use engine::{CoverageEngine, EventOutcome, ProbeSink, SessionSnapshot};
pub use error::{AnalysisError, EngineError, ProbeError, SessionError, StoreError};
pub use probes::{ExecutionData, ExecutionIndex, ProbeAggregator, ProbeKey};
pub use publish::{Broadcaster, ScopeStore};
pub use registry::{ClassRegistry, ClassRegistryBuilder, ClassSetDigest};
pub use report::{
    AssociatedTests, ClassCoverageEntry, CollectionState, CoverageBlock, FinishReport,
    MethodCoverageDetail, MethodCoverageEntry, NewCoverageBlock, PackageCoverageEntry, TestUsage,
};
pub use scope::{ClassData, Scope, ScopeExporter, ScopeTest};
pub use session::{Finalized, PartSummary, Session, StateName};

pub use coverage_daemon_protocol::{
    ClassBytes, CoverageEvent, EventKind, InitInfo, ProbeRecord, TargetInfo, Topic,
};
