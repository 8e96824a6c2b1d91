//! Structural analysis: class bytes plus merged probes → coverage tree.
//!
//! The byte-level work is delegated to a [`StructureAnalyzer`]; this module
//! only walks the class set and applies the failure policy (a class that
//! cannot be analyzed counts with zero coverage, or is skipped when even that
//! fails).

mod descriptor;
mod element;
mod layout;
mod tree;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bitmap::ProbeBitmap;
use crate::error::AnalysisError;
use crate::probes::ExecutionIndex;
use crate::registry::ClassRegistry;

pub use descriptor::declaration;
pub use element::ElementKey;
pub use layout::ProbeLayoutAnalyzer;
pub use tree::{
    ClassCoverage, Counter, CoverageTree, MethodCoverage, MethodId, MethodSet, PackageCoverage,
};

/// Maps one class's bytes and probe flags onto method-level counters.
///
/// Must be deterministic: equal inputs give equal output.
pub trait StructureAnalyzer: Send + Sync {
    fn analyze_class(
        &self,
        class_name: &str,
        bytes: &[u8],
        probes: Option<&ProbeBitmap>,
    ) -> Result<ClassCoverage, AnalysisError>;
}

#[derive(Clone)]
pub struct CoverageAnalyzer {
    inner: Arc<dyn StructureAnalyzer>,
}

impl CoverageAnalyzer {
    pub fn new(inner: Arc<dyn StructureAnalyzer>) -> Self {
        Self { inner }
    }

    /// Tree over every registered class. Classes without execution data count
    /// as fully missed.
    pub fn analyze(&self, classes: &ClassRegistry, index: &ExecutionIndex) -> CoverageTree {
        for name in index.class_names() {
            if !classes.contains(name) {
                debug!(class = %name, "Execution data for an unregistered class skipped");
            }
        }
        CoverageTree::from_classes(
            classes
                .iter()
                .filter_map(|(name, bytes)| self.analyze_one(name, bytes, index.get(name))),
        )
    }

    /// Tree over only the classes `index` touches.
    pub fn analyze_touched(&self, classes: &ClassRegistry, index: &ExecutionIndex) -> CoverageTree {
        CoverageTree::from_classes(index.class_names().filter_map(|name| {
            let Some(bytes) = classes.get(name) else {
                debug!(class = %name, "No bytes for class, skipped");
                return None;
            };
            self.analyze_one(name, bytes, index.get(name))
        }))
    }

    fn analyze_one(
        &self,
        name: &str,
        bytes: &[u8],
        probes: Option<&ProbeBitmap>,
    ) -> Option<ClassCoverage> {
        match self.inner.analyze_class(name, bytes, probes) {
            Ok(class) => Some(class),
            Err(err) => {
                warn!(class = %name, code = err.code(), error = %err, "Class analysis failed");
                if probes.is_none() {
                    return None;
                }
                match self.inner.analyze_class(name, bytes, None) {
                    Ok(class) => Some(class),
                    Err(err) => {
                        warn!(class = %name, code = err.code(), error = %err, "Class skipped");
                        None
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for CoverageAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageAnalyzer").finish_non_exhaustive()
    }
}
