//! Delta between a fresh coverage tree and the previous baseline.

use serde::Serialize;

use crate::analysis::{Counter, CoverageTree, MethodId, MethodSet};

/// Percentages closer than this are treated as equal.
pub const PERCENT_EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increase,
    Decrease,
    Unchanged,
}

/// Arrow shown next to the overall coverage figure. `Unchanged` has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Arrow {
    Increase,
    Decrease,
}

impl Direction {
    /// A missing current percentage is `Unchanged`; a missing previous one
    /// counts as 0.
    pub fn between(current: Option<f64>, previous: Option<f64>) -> Self {
        let Some(current) = current else {
            return Direction::Unchanged;
        };
        let delta = current - previous.unwrap_or(0.0);
        if delta > PERCENT_EPSILON {
            Direction::Increase
        } else if delta < -PERCENT_EPSILON {
            Direction::Decrease
        } else {
            Direction::Unchanged
        }
    }

    pub fn arrow(&self) -> Option<Arrow> {
        match self {
            Direction::Increase => Some(Arrow::Increase),
            Direction::Decrease => Some(Arrow::Decrease),
            Direction::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMethod {
    pub id: MethodId,
    pub instructions: Counter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewMethodsStats {
    pub methods_count: usize,
    pub methods_covered: usize,
    pub instructions: Counter,
}

impl NewMethodsStats {
    pub fn percent(&self) -> Option<f64> {
        self.instructions.percent()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageDiff {
    pub direction: Direction,
    pub new_methods: Vec<NewMethod>,
    pub new_methods_stats: NewMethodsStats,
}

/// Compares `current` with `previous` for the overall direction and against
/// `known_methods` for new-method detection. The two baselines differ: the
/// direction follows the last finish, new methods follow the last class
/// generation.
pub fn diff(current: &CoverageTree, previous: &CoverageTree, known_methods: &MethodSet) -> CoverageDiff {
    let direction = Direction::between(current.percent(), previous.percent());

    let new_methods: Vec<NewMethod> = current
        .methods()
        .map(|(class, method)| NewMethod {
            id: class.method_id(method),
            instructions: method.instructions,
        })
        .filter(|method| !known_methods.contains(&method.id))
        .collect();

    let new_methods_stats = NewMethodsStats {
        methods_count: new_methods.len(),
        methods_covered: new_methods
            .iter()
            .filter(|method| method.instructions.is_covered())
            .count(),
        instructions: new_methods.iter().map(|method| method.instructions).sum(),
    };

    CoverageDiff {
        direction,
        new_methods,
        new_methods_stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{ClassCoverage, MethodCoverage};

    fn tree(methods: &[(&str, u64, u64)]) -> CoverageTree {
        CoverageTree::from_classes([ClassCoverage {
            name: "com/acme/Foo".to_string(),
            methods: methods
                .iter()
                .map(|(name, total, covered)| MethodCoverage {
                    name: name.to_string(),
                    desc: "()V".to_string(),
                    instructions: Counter::new(*total, *covered),
                })
                .collect(),
        }])
    }

    #[test]
    fn direction_uses_epsilon() {
        assert_eq!(
            Direction::between(Some(80.0), Some(60.0)),
            Direction::Increase
        );
        assert_eq!(
            Direction::between(Some(60.0), Some(80.0)),
            Direction::Decrease
        );
        assert_eq!(
            Direction::between(Some(50.0), Some(50.0 + 1e-9)),
            Direction::Unchanged
        );
        assert_eq!(Direction::between(Some(10.0), None), Direction::Increase);
        assert_eq!(Direction::between(None, Some(10.0)), Direction::Unchanged);
        assert_eq!(Direction::Unchanged.arrow(), None);
    }

    #[test]
    fn arrow_serializes_in_caps() {
        assert_eq!(
            serde_json::to_string(&Arrow::Increase).expect("serialize"),
            "\"INCREASE\""
        );
    }

    #[test]
    fn finds_methods_missing_from_baseline() {
        let previous = tree(&[("run", 10, 6)]);
        let current = tree(&[("run", 10, 8), ("stop", 4, 2), ("idle", 4, 0)]);

        let result = diff(&current, &previous, &previous.method_ids());

        assert_eq!(result.direction, Direction::Increase);
        let names: Vec<_> = result
            .new_methods
            .iter()
            .map(|method| method.id.name.as_str())
            .collect();
        assert_eq!(names, vec!["stop", "idle"]);
        assert_eq!(result.new_methods_stats.methods_count, 2);
        assert_eq!(result.new_methods_stats.methods_covered, 1);
        assert_eq!(result.new_methods_stats.instructions, Counter::new(8, 2));
        assert_eq!(result.new_methods_stats.percent(), Some(25.0));
    }

    #[test]
    fn descriptor_is_part_of_identity() {
        let previous = tree(&[("run", 2, 0)]);
        let mut known = previous.method_ids();
        let current = tree(&[("run", 2, 0)]);
        assert!(diff(&current, &previous, &known).new_methods.is_empty());

        known = known
            .into_iter()
            .map(|mut id| {
                id.desc = "(I)V".to_string();
                id
            })
            .collect();
        assert_eq!(diff(&current, &previous, &known).new_methods.len(), 1);
    }

    #[test]
    fn empty_new_method_stats_have_no_percentage() {
        let current = tree(&[("run", 2, 1)]);
        let result = diff(&current, &current, &current.method_ids());
        assert_eq!(result.direction, Direction::Unchanged);
        assert_eq!(result.new_methods_stats, NewMethodsStats::default());
        assert_eq!(result.new_methods_stats.percent(), None);
    }
}
