// rust/fedsim-core/src/resources.rs

//! Named resource quantities for slots and client requirements.
//!
//! Quantities are given as fractional units (`num_cpus = 0.5`) but stored as
//! fixed-point milli-units, so that reserving and releasing the same amount
//! always restores a slot to exactly its previous value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

/// Resource name for CPU units.
pub const NUM_CPUS: &str = "num_cpus";
/// Resource name for accelerator units.
pub const NUM_GPUS: &str = "num_gpus";

const MILLIS_PER_UNIT: f64 = 1000.0;

/// A vector of named resource quantities.
///
/// Used both for slot capacities and for per-client requirements. A
/// dimension that is absent has a quantity of zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct ResourceVector {
    millis: BTreeMap<String, u64>,
    /// Dimensions given a negative or non-finite amount, as written.
    invalid: BTreeMap<String, String>,
}

impl ResourceVector {
    /// Creates an empty vector (requires nothing / provides nothing).
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter. Negative or non-finite amounts are kept aside
    /// and make [`ResourceVector::validate`] fail.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, units: f64) -> Self {
        self.set(name, units);
        self
    }

    /// Shorthand for a vector with only CPU units.
    pub fn cpus(units: f64) -> Self {
        Self::new().with(NUM_CPUS, units)
    }

    pub fn set(&mut self, name: impl Into<String>, units: f64) {
        let name = name.into();
        self.millis.remove(&name);
        self.invalid.remove(&name);
        if !units.is_finite() || units < 0.0 {
            self.invalid.insert(name, units.to_string());
            return;
        }
        let millis = to_millis(units);
        if millis == 0 {
            self.millis.remove(&name);
        } else {
            self.millis.insert(name, millis);
        }
    }

    /// Returns the amount of `name`, in units.
    pub fn get(&self, name: &str) -> f64 {
        self.millis
            .get(name)
            .map(|m| *m as f64 / MILLIS_PER_UNIT)
            .unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.millis.is_empty() && self.invalid.is_empty()
    }

    /// Names of all non-zero dimensions.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.millis.keys().map(String::as_str)
    }

    /// Returns true if every dimension of `self` is at most the matching
    /// dimension of `capacity`.
    pub fn fits_within(&self, capacity: &ResourceVector) -> bool {
        self.millis
            .iter()
            .all(|(name, need)| capacity.millis.get(name).copied().unwrap_or(0) >= *need)
    }

    /// Subtracts `amount` in place. Caller must have checked `fits_within`.
    pub(crate) fn take(&mut self, amount: &ResourceVector) {
        for (name, need) in &amount.millis {
            if let Some(have) = self.millis.get_mut(name) {
                *have = have.saturating_sub(*need);
            }
        }
    }

    /// Adds `amount` back in place, never exceeding `ceiling`.
    pub(crate) fn give_back(&mut self, amount: &ResourceVector, ceiling: &ResourceVector) {
        for (name, need) in &amount.millis {
            let limit = ceiling.millis.get(name).copied().unwrap_or(0);
            let have = self.millis.entry(name.clone()).or_insert(0);
            *have = (*have + need).min(limit);
        }
    }

    /// Rejects blank resource names and amounts that are negative, NaN or
    /// infinite.
    pub fn validate(&self, what: &str) -> Result<()> {
        if let Some((name, units)) = self.invalid.iter().next() {
            return Err(SimError::config(format!(
                "{what}.{name} must be a finite amount >= 0, got {units}"
            )));
        }
        if self.millis.keys().any(|name| name.trim().is_empty()) {
            return Err(SimError::config(format!(
                "{what} contains a resource with an empty name"
            )));
        }
        Ok(())
    }
}

fn to_millis(units: f64) -> u64 {
    (units * MILLIS_PER_UNIT).round() as u64
}

impl From<BTreeMap<String, f64>> for ResourceVector {
    fn from(map: BTreeMap<String, f64>) -> Self {
        let mut vector = Self::new();
        for (name, units) in map {
            vector.set(name, units);
        }
        vector
    }
}

impl From<ResourceVector> for BTreeMap<String, f64> {
    fn from(vector: ResourceVector) -> Self {
        vector
            .millis
            .into_iter()
            .map(|(name, m)| (name, m as f64 / MILLIS_PER_UNIT))
            .collect()
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, m)) in self.millis.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", name, *m as f64 / MILLIS_PER_UNIT)?;
        }
        f.write_str("}")
    }
}
