//! The finish pipeline: analyze → diff + attribute → export.

use std::thread;

use chrono::{DateTime, Utc};
use coverage_daemon_protocol::TargetInfo;

use crate::analysis::{CoverageAnalyzer, CoverageTree, MethodSet};
use crate::assoc::AssociatedTestTracker;
use crate::diff::diff;
use crate::probes::{ExecutionData, ExecutionIndex};
use crate::registry::ClassRegistry;
use crate::report::{FinishReport, TestUsage};
use crate::scope::ScopeExporter;

pub(super) struct Inputs<'a> {
    pub target: &'a TargetInfo,
    pub classes: &'a ClassRegistry,
    pub executed: &'a ExecutionIndex,
    pub previous: &'a CoverageTree,
    pub known_methods: &'a MethodSet,
    /// This run's drained probes.
    pub records: Vec<ExecutionData>,
}

/// Attribution re-analyzes every test-tagged record on its own, so it runs
/// on a scoped thread next to the tree/diff/export path.
pub(super) fn run(
    inputs: Inputs<'_>,
    analyzer: &CoverageAnalyzer,
    exporter: &ScopeExporter,
    now: DateTime<Utc>,
) -> (CoverageTree, FinishReport) {
    let Inputs {
        target,
        classes,
        executed,
        previous,
        known_methods,
        records,
    } = inputs;
    let tracker = AssociatedTestTracker::new(analyzer, classes);

    thread::scope(|scope| {
        let attribution = scope.spawn(|| {
            let assoc = tracker.index(&records);
            let usages = tracker.covered_methods(&records);
            (assoc, usages)
        });

        let tree = analyzer.analyze(classes, executed);
        let delta = diff(&tree, previous, known_methods);
        let exported = exporter.export(target, &records);

        let (assoc, usages) = attribution
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        let usages = TestUsage::from_counts(usages, exporter.test_type(), now);
        let report = FinishReport::new(&tree, &delta, &assoc, usages, exported);
        (tree, report)
    })
}
