//! Test-to-code attribution.
//!
//! Every probe record that names a test is analyzed on its own, and each
//! package, class and method it covered gets the test name attached. The
//! index is rebuilt per finish cycle.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::{CoverageAnalyzer, CoverageTree, ElementKey};
use crate::probes::{ExecutionData, ExecutionIndex};
use crate::registry::ClassRegistry;
use crate::report::AssociatedTests;

/// Code element → names of the tests that covered it.
///
/// Only elements with at least one covered instruction are ever present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssocIndex {
    entries: BTreeMap<ElementKey, BTreeSet<String>>,
}

impl AssocIndex {
    /// Attaches `test` to every covered element of `tree`.
    pub fn record(&mut self, tree: &CoverageTree, test: &str) {
        for package in tree.packages() {
            if !package.instructions().is_covered() {
                continue;
            }
            self.attach(ElementKey::package(&package.name), test);
            for class in package.classes.iter().filter(|class| class.is_covered()) {
                self.attach(ElementKey::class(&class.name), test);
                for method in class.methods.iter().filter(|method| method.is_covered()) {
                    self.attach(ElementKey::Method(class.method_id(method)), test);
                }
            }
        }
    }

    fn attach(&mut self, key: ElementKey, test: &str) {
        self.entries.entry(key).or_default().insert(test.to_string());
    }

    pub fn tests_for(&self, key: &ElementKey) -> Option<&BTreeSet<String>> {
        self.entries.get(key)
    }

    pub fn count_for(&self, key: &ElementKey) -> usize {
        self.entries.get(key).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ElementKey, &BTreeSet<String>)> {
        self.entries.iter()
    }

    /// Export rows, one per element, in element order.
    pub fn to_associated_tests(&self) -> Vec<AssociatedTests> {
        self.entries
            .iter()
            .map(|(key, tests)| {
                let (class_name, method_name) = match key {
                    ElementKey::Package { .. } => (None, None),
                    ElementKey::Class { path } => (Some(path.clone()), None),
                    ElementKey::Method(method) => {
                        (Some(method.owner_class.clone()), Some(method.name.clone()))
                    }
                };
                AssociatedTests {
                    id: key.id(),
                    package_name: key.package_name().to_string(),
                    class_name,
                    method_name,
                    tests: tests.iter().cloned().collect(),
                }
            })
            .collect()
    }
}

pub struct AssociatedTestTracker<'a> {
    analyzer: &'a CoverageAnalyzer,
    classes: &'a ClassRegistry,
}

impl<'a> AssociatedTestTracker<'a> {
    pub fn new(analyzer: &'a CoverageAnalyzer, classes: &'a ClassRegistry) -> Self {
        Self { analyzer, classes }
    }

    /// Analyzes each test-tagged record against its own bitmap.
    pub fn index(&self, records: &[ExecutionData]) -> AssocIndex {
        let mut index = AssocIndex::default();
        for record in records {
            let Some(test) = record.test_name.as_deref() else {
                continue;
            };
            let tree = self
                .analyzer
                .analyze_touched(self.classes, &ExecutionIndex::single(record));
            index.record(&tree, test);
        }
        index
    }

    /// Per test, how many methods its merged probes covered.
    pub fn covered_methods(&self, records: &[ExecutionData]) -> BTreeMap<String, u64> {
        let mut by_test: BTreeMap<&str, Vec<&ExecutionData>> = BTreeMap::new();
        for record in records {
            if let Some(test) = record.test_name.as_deref() {
                by_test.entry(test).or_default().push(record);
            }
        }
        by_test
            .into_iter()
            .map(|(test, records)| {
                let tree = self
                    .analyzer
                    .analyze_touched(self.classes, &ExecutionIndex::from_data(records));
                (test.to_string(), tree.method_counter().covered)
            })
            .collect()
    }
}
