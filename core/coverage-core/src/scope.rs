//! Persistable per-test execution bundle, one per finish cycle.

use std::collections::BTreeMap;

use coverage_daemon_protocol::TargetInfo;
use serde::Serialize;

use crate::bitmap::ProbeBitmap;
use crate::config::EngineConfig;
use crate::probes::ExecutionData;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// `"{buildVersion}:{scopeName}"`; also the storage key.
    pub id: String,
    pub name: String,
    pub build_version: String,
    pub tests: Vec<ScopeTest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeTest {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub test_type: String,
    pub class_data: Vec<ClassData>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassData {
    pub probe_id: u64,
    pub code_unit_name: String,
    pub bitmap: ProbeBitmap,
}

#[derive(Debug, Clone)]
pub struct ScopeExporter {
    scope_name: String,
    test_type: String,
}

impl ScopeExporter {
    pub fn new(scope_name: impl Into<String>, test_type: impl Into<String>) -> Self {
        Self {
            scope_name: scope_name.into(),
            test_type: test_type.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.scope_name, &config.test_type)
    }

    pub fn test_type(&self) -> &str {
        &self.test_type
    }

    pub fn scope_id(&self, build_version: &str) -> String {
        format!("{}:{}", build_version, self.scope_name)
    }

    /// Groups test-tagged records by test name. Untagged records are left out.
    pub fn export(&self, target: &TargetInfo, records: &[ExecutionData]) -> Scope {
        let scope_id = self.scope_id(&target.build_version);

        let mut by_test: BTreeMap<&str, Vec<ClassData>> = BTreeMap::new();
        for record in records {
            let Some(test) = record.test_name.as_deref() else {
                continue;
            };
            by_test.entry(test).or_default().push(ClassData {
                probe_id: record.id,
                code_unit_name: record.class_name.clone(),
                bitmap: record.probes.clone(),
            });
        }

        let tests = by_test
            .into_iter()
            .map(|(name, class_data)| ScopeTest {
                id: format!("{}:{}", scope_id, name),
                name: name.to_string(),
                test_type: self.test_type.clone(),
                class_data,
            })
            .collect();

        Scope {
            id: scope_id,
            name: self.scope_name.clone(),
            build_version: target.build_version.clone(),
            tests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> TargetInfo {
        TargetInfo {
            id: "svc-1".to_string(),
            name: "orders".to_string(),
            build_version: "1.4.0".to_string(),
            group: None,
        }
    }

    fn record(id: u64, class: &str, test: Option<&str>) -> ExecutionData {
        ExecutionData {
            id,
            class_name: class.to_string(),
            probes: ProbeBitmap::from_bools(&[true, false]),
            test_name: test.map(str::to_string),
        }
    }

    #[test]
    fn groups_records_per_test() {
        let exporter = ScopeExporter::from_config(&EngineConfig::default());
        let scope = exporter.export(
            &target(),
            &[
                record(2, "B", Some("t2")),
                record(1, "A", Some("t1")),
                record(2, "B", Some("t1")),
                record(3, "C", None),
            ],
        );

        assert_eq!(scope.id, "1.4.0:testScope");
        assert_eq!(scope.tests.len(), 2);
        assert_eq!(scope.tests[0].id, "1.4.0:testScope:t1");
        assert_eq!(scope.tests[0].class_data.len(), 2);
        assert_eq!(scope.tests[1].class_data[0].code_unit_name, "B");
    }

    #[test]
    fn wire_shape() {
        let exporter = ScopeExporter::new("smoke", "AUTO");
        let scope = exporter.export(&target(), &[record(1, "A", Some("t1"))]);
        assert_eq!(
            serde_json::to_value(&scope).expect("serialize"),
            json!({
                "id": "1.4.0:smoke",
                "name": "smoke",
                "buildVersion": "1.4.0",
                "tests": [{
                    "id": "1.4.0:smoke:t1",
                    "name": "t1",
                    "type": "AUTO",
                    "classData": [{"probeId": 1, "codeUnitName": "A", "bitmap": [true, false]}],
                }],
            })
        );
    }

    #[test]
    fn no_tests_still_yields_a_scope() {
        let scope = ScopeExporter::new("s", "MANUAL").export(&target(), &[record(1, "A", None)]);
        assert!(scope.tests.is_empty());
        assert_eq!(scope.build_version, "1.4.0");
    }
}
