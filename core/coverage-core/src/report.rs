//! Observer payloads published after each finish cycle.
//!
//! Field names are camelCase on the wire. Percentages are `null` when there
//! is nothing to cover.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::analysis::{
    declaration, ClassCoverage, CoverageTree, ElementKey, MethodCoverage, PackageCoverage,
};
use crate::assoc::AssocIndex;
use crate::diff::{Arrow, CoverageDiff, Direction, NewMethod, NewMethodsStats};
use crate::scope::Scope;

/// `/collection-state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectionState {
    pub active: bool,
}

/// `/coverage`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageBlock {
    pub coverage: Option<f64>,
    pub classes_count: u64,
    pub methods_count: u64,
    pub uncovered_methods_count: u64,
    pub arrow: Option<Arrow>,
}

impl CoverageBlock {
    pub fn new(tree: &CoverageTree, direction: Direction) -> Self {
        let methods = tree.method_counter();
        Self {
            coverage: tree.percent(),
            classes_count: tree.class_counter().total,
            methods_count: methods.total,
            uncovered_methods_count: methods.missed(),
            arrow: direction.arrow(),
        }
    }
}

/// `/coverage-new`
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCoverageBlock {
    pub methods_count: usize,
    pub methods_covered: usize,
    pub coverage: Option<f64>,
}

impl From<&NewMethodsStats> for NewCoverageBlock {
    fn from(stats: &NewMethodsStats) -> Self {
        Self {
            methods_count: stats.methods_count,
            methods_covered: stats.methods_covered,
            coverage: stats.percent(),
        }
    }
}

/// One row of `/new-methods`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCoverageEntry {
    pub id: String,
    pub owner_class: String,
    pub name: String,
    pub desc: String,
    pub decl: String,
    pub coverage: Option<f64>,
}

impl From<&NewMethod> for MethodCoverageEntry {
    fn from(method: &NewMethod) -> Self {
        Self {
            id: ElementKey::Method(method.id.clone()).id(),
            owner_class: method.id.owner_class.clone(),
            name: method.id.name.clone(),
            desc: method.id.desc.clone(),
            decl: declaration(&method.id.desc),
            coverage: method.instructions.percent(),
        }
    }
}

/// One package of `/coverage-by-packages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageCoverageEntry {
    pub id: String,
    pub name: String,
    pub coverage: Option<f64>,
    pub total_classes_count: u64,
    pub covered_classes_count: u64,
    pub total_methods_count: u64,
    pub covered_methods_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assoc_tests_count: Option<usize>,
    pub classes: Vec<ClassCoverageEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassCoverageEntry {
    pub id: String,
    pub name: String,
    pub path: String,
    pub coverage: Option<f64>,
    pub total_methods_count: u64,
    pub covered_methods_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assoc_tests_count: Option<usize>,
    pub methods: Vec<MethodCoverageDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCoverageDetail {
    pub id: String,
    pub name: String,
    pub desc: String,
    pub decl: String,
    pub coverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assoc_tests_count: Option<usize>,
}

fn assoc_count(assoc: &AssocIndex, key: &ElementKey) -> Option<usize> {
    Some(assoc.count_for(key)).filter(|count| *count > 0)
}

impl PackageCoverageEntry {
    pub fn from_tree(tree: &CoverageTree, assoc: &AssocIndex) -> Vec<Self> {
        tree.packages()
            .iter()
            .map(|package| Self::new(package, assoc))
            .collect()
    }

    fn new(package: &PackageCoverage, assoc: &AssocIndex) -> Self {
        let key = ElementKey::package(&package.name);
        let classes = package.class_counter();
        let methods = package.method_counter();
        Self {
            id: key.id(),
            name: package.name.clone(),
            coverage: package.instructions().percent(),
            total_classes_count: classes.total,
            covered_classes_count: classes.covered,
            total_methods_count: methods.total,
            covered_methods_count: methods.covered,
            assoc_tests_count: assoc_count(assoc, &key),
            classes: package
                .classes
                .iter()
                .map(|class| ClassCoverageEntry::new(class, assoc))
                .collect(),
        }
    }
}

impl ClassCoverageEntry {
    fn new(class: &ClassCoverage, assoc: &AssocIndex) -> Self {
        let key = ElementKey::class(&class.name);
        let methods = class.method_counter();
        Self {
            id: key.id(),
            name: class.simple_name().to_string(),
            path: class.name.clone(),
            coverage: class.instructions().percent(),
            total_methods_count: methods.total,
            covered_methods_count: methods.covered,
            assoc_tests_count: assoc_count(assoc, &key),
            methods: class
                .methods
                .iter()
                .map(|method| MethodCoverageDetail::new(class, method, assoc))
                .collect(),
        }
    }
}

impl MethodCoverageDetail {
    fn new(class: &ClassCoverage, method: &MethodCoverage, assoc: &AssocIndex) -> Self {
        let key = ElementKey::Method(class.method_id(method));
        Self {
            id: key.id(),
            name: method.name.clone(),
            desc: method.desc.clone(),
            decl: declaration(&method.desc),
            coverage: method.instructions.percent(),
            assoc_tests_count: assoc_count(assoc, &key),
        }
    }
}

/// One row of `/tests-usages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestUsage {
    pub test_name: String,
    pub method_calls: u64,
    pub test_type: String,
    pub last_run_at: String,
}

impl TestUsage {
    pub fn from_counts(
        counts: BTreeMap<String, u64>,
        test_type: &str,
        run_at: DateTime<Utc>,
    ) -> Vec<Self> {
        let last_run_at = run_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        counts
            .into_iter()
            .map(|(test_name, method_calls)| Self {
                test_name,
                method_calls,
                test_type: test_type.to_string(),
                last_run_at: last_run_at.clone(),
            })
            .collect()
    }
}

/// One row of `/associated-tests`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociatedTests {
    pub id: String,
    pub package_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    pub tests: Vec<String>,
}

/// Everything one finish cycle produced.
#[derive(Debug, Clone)]
pub struct FinishReport {
    pub direction: Direction,
    pub coverage: CoverageBlock,
    pub coverage_new: NewCoverageBlock,
    pub new_methods: Vec<MethodCoverageEntry>,
    pub packages: Vec<PackageCoverageEntry>,
    pub tests_usages: Vec<TestUsage>,
    pub associated_tests: Vec<AssociatedTests>,
    pub scope: Scope,
}

impl FinishReport {
    pub fn new(
        tree: &CoverageTree,
        diff: &CoverageDiff,
        assoc: &AssocIndex,
        tests_usages: Vec<TestUsage>,
        scope: Scope,
    ) -> Self {
        Self {
            direction: diff.direction,
            coverage: CoverageBlock::new(tree, diff.direction),
            coverage_new: NewCoverageBlock::from(&diff.new_methods_stats),
            new_methods: diff.new_methods.iter().map(MethodCoverageEntry::from).collect(),
            packages: PackageCoverageEntry::from_tree(tree, assoc),
            tests_usages,
            associated_tests: assoc.to_associated_tests(),
            scope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Counter, MethodId};
    use chrono::TimeZone;
    use serde_json::json;

    fn tree() -> CoverageTree {
        CoverageTree::from_classes([ClassCoverage {
            name: "com/acme/Foo".to_string(),
            methods: vec![
                MethodCoverage {
                    name: "run".to_string(),
                    desc: "(I)V".to_string(),
                    instructions: Counter::new(4, 2),
                },
                MethodCoverage {
                    name: "stop".to_string(),
                    desc: "()V".to_string(),
                    instructions: Counter::new(0, 0),
                },
            ],
        }])
    }

    #[test]
    fn coverage_block_wire_shape() {
        let block = CoverageBlock::new(&tree(), Direction::Increase);
        assert_eq!(
            serde_json::to_value(&block).expect("serialize"),
            json!({
                "coverage": 50.0,
                "classesCount": 1,
                "methodsCount": 2,
                "uncoveredMethodsCount": 1,
                "arrow": "INCREASE",
            })
        );

        let empty = CoverageBlock::new(&CoverageTree::default(), Direction::Unchanged);
        let value = serde_json::to_value(&empty).expect("serialize");
        assert_eq!(value["coverage"], json!(null));
        assert_eq!(value["arrow"], json!(null));
    }

    #[test]
    fn package_entries_carry_assoc_counts() {
        let tree = tree();
        let mut assoc = AssocIndex::default();
        assoc.record(&tree, "t1");

        let packages = PackageCoverageEntry::from_tree(&tree, &assoc);
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].assoc_tests_count, Some(1));
        let class = &packages[0].classes[0];
        assert_eq!(class.name, "Foo");
        assert_eq!(class.covered_methods_count, 1);
        assert_eq!(class.methods[0].decl, "(int): void");
        assert_eq!(class.methods[1].coverage, None);
        assert_eq!(class.methods[1].assoc_tests_count, None);

        let value = serde_json::to_value(&class.methods[1]).expect("serialize");
        assert!(value.get("assocTestsCount").is_none());
    }

    #[test]
    fn new_method_entry_renders_declaration() {
        let entry = MethodCoverageEntry::from(&NewMethod {
            id: MethodId {
                owner_class: "com/acme/Foo".to_string(),
                name: "run".to_string(),
                desc: "(Ljava/lang/String;)Z".to_string(),
            },
            instructions: Counter::new(3, 0),
        });
        assert_eq!(entry.decl, "(String): boolean");
        assert_eq!(entry.coverage, Some(0.0));
        assert_eq!(entry.id.len(), 16);
    }

    #[test]
    fn test_usages_share_run_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let counts = BTreeMap::from([("a".to_string(), 2), ("b".to_string(), 0)]);
        let usages = TestUsage::from_counts(counts, "MANUAL", at);
        assert_eq!(usages.len(), 2);
        assert_eq!(usages[0].last_run_at, "2024-05-01T12:00:00.000Z");
        assert_eq!(
            serde_json::to_value(&usages[1]).expect("serialize"),
            json!({
                "testName": "b",
                "methodCalls": 0,
                "testType": "MANUAL",
                "lastRunAt": "2024-05-01T12:00:00.000Z",
            })
        );
    }
}
