//! Built-in structural analyzer.
//!
//! The agent attaches a probe layout to each class instead of raw bytecode:
//!
//! ```json
//! {"methods": [{"name": "run", "desc": "()V", "probes": [3, 1]},
//!              {"name": "stop", "desc": "()V", "probes": 2}]}
//! ```
//!
//! `probes` is either a list of instruction weights (one per probe) or a plain
//! probe count where every probe weighs one instruction. Probe indices are
//! handed out in declaration order across all methods of the class.

use serde::Deserialize;

use super::tree::{ClassCoverage, Counter, MethodCoverage};
use super::StructureAnalyzer;
use crate::bitmap::ProbeBitmap;
use crate::error::AnalysisError;

#[derive(Debug, Deserialize)]
struct ClassLayout {
    #[serde(default)]
    methods: Vec<MethodLayout>,
}

#[derive(Debug, Deserialize)]
struct MethodLayout {
    name: String,
    #[serde(default)]
    desc: String,
    probes: ProbeWeights,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProbeWeights {
    Count(usize),
    Weights(Vec<u64>),
}

impl ProbeWeights {
    fn into_weights(self) -> Vec<u64> {
        match self {
            ProbeWeights::Count(count) => vec![1; count],
            ProbeWeights::Weights(weights) => weights,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeLayoutAnalyzer;

impl StructureAnalyzer for ProbeLayoutAnalyzer {
    fn analyze_class(
        &self,
        class_name: &str,
        bytes: &[u8],
        probes: Option<&ProbeBitmap>,
    ) -> Result<ClassCoverage, AnalysisError> {
        let layout: ClassLayout =
            serde_json::from_slice(bytes).map_err(|err| AnalysisError::Unreadable {
                class: class_name.to_string(),
                reason: err.to_string(),
            })?;
        let methods: Vec<(String, String, Vec<u64>)> = layout
            .methods
            .into_iter()
            .map(|method| (method.name, method.desc, method.probes.into_weights()))
            .collect();

        let weight_sum = methods
            .iter()
            .flat_map(|(_, _, weights)| weights.iter())
            .try_fold(0u64, |sum, weight| sum.checked_add(*weight));
        if weight_sum.is_none() {
            return Err(AnalysisError::Unreadable {
                class: class_name.to_string(),
                reason: "instruction weights overflow".to_string(),
            });
        }

        let expected: usize = methods.iter().map(|(_, _, weights)| weights.len()).sum();
        if let Some(bitmap) = probes {
            if bitmap.len() != expected {
                return Err(AnalysisError::ProbeCountMismatch {
                    class: class_name.to_string(),
                    expected,
                    actual: bitmap.len(),
                });
            }
        }

        let mut next_probe = 0;
        let methods = methods
            .into_iter()
            .map(|(name, desc, weights)| {
                let mut instructions = Counter::default();
                for weight in weights {
                    let hit = probes.map(|bitmap| bitmap.get(next_probe)).unwrap_or(false);
                    instructions += Counter::new(weight, if hit { weight } else { 0 });
                    next_probe += 1;
                }
                MethodCoverage {
                    name,
                    desc,
                    instructions,
                }
            })
            .collect();

        Ok(ClassCoverage {
            name: class_name.to_string(),
            methods,
        })
    }
}
