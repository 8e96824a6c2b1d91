//! Structural coverage tree: packages → classes → methods.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, AddAssign};

use serde::Serialize;

use super::element::package_of;

/// Covered vs. total counts at one level of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Counter {
    pub total: u64,
    pub covered: u64,
}

impl Counter {
    /// `covered` is clamped to `total`.
    pub fn new(total: u64, covered: u64) -> Self {
        Self {
            total,
            covered: covered.min(total),
        }
    }

    pub fn missed(&self) -> u64 {
        self.total.saturating_sub(self.covered)
    }

    /// `None` when there is nothing to cover.
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.covered as f64 / self.total as f64 * 100.0)
        }
    }

    pub fn is_covered(&self) -> bool {
        self.covered > 0
    }
}

impl Add for Counter {
    type Output = Counter;

    /// Saturates, keeping `covered <= total`.
    fn add(self, other: Counter) -> Counter {
        Counter::new(
            self.total.saturating_add(other.total),
            self.covered.saturating_add(other.covered),
        )
    }
}

impl AddAssign for Counter {
    fn add_assign(&mut self, other: Counter) {
        *self = *self + other;
    }
}

impl std::iter::Sum for Counter {
    fn sum<I: Iterator<Item = Counter>>(iter: I) -> Counter {
        iter.fold(Counter::default(), Add::add)
    }
}

/// Identity of a method across generations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodId {
    pub owner_class: String,
    pub name: String,
    pub desc: String,
}

pub type MethodSet = BTreeSet<MethodId>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCoverage {
    pub name: String,
    pub desc: String,
    pub instructions: Counter,
}

impl MethodCoverage {
    pub fn is_covered(&self) -> bool {
        self.instructions.is_covered()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCoverage {
    /// Slash-separated path, e.g. `com/acme/Foo`.
    pub name: String,
    pub methods: Vec<MethodCoverage>,
}

impl ClassCoverage {
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn package_name(&self) -> &str {
        package_of(&self.name)
    }

    pub fn instructions(&self) -> Counter {
        self.methods.iter().map(|method| method.instructions).sum()
    }

    pub fn method_counter(&self) -> Counter {
        let covered = self.methods.iter().filter(|m| m.is_covered()).count();
        Counter::new(self.methods.len() as u64, covered as u64)
    }

    pub fn is_covered(&self) -> bool {
        self.methods.iter().any(MethodCoverage::is_covered)
    }

    pub fn method_id(&self, method: &MethodCoverage) -> MethodId {
        MethodId {
            owner_class: self.name.clone(),
            name: method.name.clone(),
            desc: method.desc.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCoverage {
    pub name: String,
    pub classes: Vec<ClassCoverage>,
}

impl PackageCoverage {
    pub fn instructions(&self) -> Counter {
        self.classes.iter().map(ClassCoverage::instructions).sum()
    }

    pub fn method_counter(&self) -> Counter {
        self.classes.iter().map(ClassCoverage::method_counter).sum()
    }

    pub fn class_counter(&self) -> Counter {
        let covered = self.classes.iter().filter(|c| c.is_covered()).count();
        Counter::new(self.classes.len() as u64, covered as u64)
    }
}

/// Immutable coverage snapshot. Packages and classes are kept in name order,
/// so equal inputs always produce equal trees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageTree {
    packages: Vec<PackageCoverage>,
}

impl CoverageTree {
    pub fn from_classes(classes: impl IntoIterator<Item = ClassCoverage>) -> Self {
        let mut grouped: BTreeMap<String, BTreeMap<String, ClassCoverage>> = BTreeMap::new();
        for class in classes {
            grouped
                .entry(class.package_name().to_string())
                .or_default()
                .insert(class.name.clone(), class);
        }
        let packages = grouped
            .into_iter()
            .map(|(name, classes)| PackageCoverage {
                name,
                classes: classes.into_values().collect(),
            })
            .collect();
        Self { packages }
    }

    pub fn packages(&self) -> &[PackageCoverage] {
        &self.packages
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassCoverage> {
        self.packages.iter().flat_map(|package| package.classes.iter())
    }

    pub fn methods(&self) -> impl Iterator<Item = (&ClassCoverage, &MethodCoverage)> {
        self.classes()
            .flat_map(|class| class.methods.iter().map(move |method| (class, method)))
    }

    pub fn class(&self, name: &str) -> Option<&ClassCoverage> {
        self.classes().find(|class| class.name == name)
    }

    pub fn instructions(&self) -> Counter {
        self.packages.iter().map(PackageCoverage::instructions).sum()
    }

    pub fn method_counter(&self) -> Counter {
        self.packages.iter().map(PackageCoverage::method_counter).sum()
    }

    pub fn class_counter(&self) -> Counter {
        self.packages.iter().map(PackageCoverage::class_counter).sum()
    }

    pub fn percent(&self) -> Option<f64> {
        self.instructions().percent()
    }

    pub fn method_ids(&self) -> MethodSet {
        self.methods()
            .map(|(class, method)| class.method_id(method))
            .collect()
    }
}
