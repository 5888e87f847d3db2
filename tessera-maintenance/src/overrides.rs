//! Per-scheme repair threshold overrides
//!
//! An override is keyed by the `(required, optimal, total)` triple of a
//! redundancy scheme and replaces its repair and/or optimal threshold.
//! Segments whose scheme has no override use their stored thresholds.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tessera_core::RedundancyScheme;

/// One configured override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyOverride {
    pub required: u16,
    pub optimal: u16,
    pub total: u16,
    #[serde(default)]
    pub repair_threshold: Option<u16>,
    #[serde(default)]
    pub optimal_threshold: Option<u16>,
}

/// Scheme lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemeKey {
    pub required: u16,
    pub optimal: u16,
    pub total: u16,
}

impl From<&RedundancyScheme> for SchemeKey {
    fn from(scheme: &RedundancyScheme) -> Self {
        Self {
            required: scheme.required,
            optimal: scheme.optimal,
            total: scheme.total,
        }
    }
}

/// Read-only override map
#[derive(Debug, Clone, Default)]
pub struct RepairOverrides {
    overrides: HashMap<SchemeKey, RedundancyOverride>,
}

impl RepairOverrides {
    /// Build the map, rejecting duplicates and overrides that yield an invalid scheme
    pub fn new(list: &[RedundancyOverride]) -> Result<Self, ConfigError> {
        let mut overrides = HashMap::with_capacity(list.len());
        for entry in list {
            let key = SchemeKey {
                required: entry.required,
                optimal: entry.optimal,
                total: entry.total,
            };
            let base = RedundancyScheme {
                required: entry.required,
                repair: entry.repair_threshold.unwrap_or(entry.required),
                optimal: entry.optimal,
                total: entry.total,
            };
            let scheme = apply(base, entry);
            scheme.validate().map_err(|e| {
                ConfigError::Validation(format!(
                    "override {}/{}/{}: {}",
                    entry.required, entry.optimal, entry.total, e
                ))
            })?;
            if overrides.insert(key, entry.clone()).is_some() {
                return Err(ConfigError::Validation(format!(
                    "duplicate override for {}/{}/{}",
                    entry.required, entry.optimal, entry.total
                )));
            }
        }
        Ok(Self { overrides })
    }

    /// The scheme to repair against
    pub fn apply(&self, scheme: RedundancyScheme) -> RedundancyScheme {
        match self.overrides.get(&SchemeKey::from(&scheme)) {
            Some(entry) => {
                let overridden = apply(scheme, entry);
                // Keep the stored thresholds if the combination is unusable
                if overridden.validate().is_ok() {
                    overridden
                } else {
                    scheme
                }
            }
            None => scheme,
        }
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

fn apply(mut scheme: RedundancyScheme, entry: &RedundancyOverride) -> RedundancyScheme {
    if let Some(repair) = entry.repair_threshold {
        scheme.repair = repair;
    }
    if let Some(optimal) = entry.optimal_threshold {
        scheme.optimal = optimal;
    }
    scheme
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> RedundancyScheme {
        RedundancyScheme::new(29, 35, 52, 80).unwrap()
    }

    #[test]
    fn test_override_applies_by_key() {
        let overrides = RepairOverrides::new(&[RedundancyOverride {
            required: 29,
            optimal: 52,
            total: 80,
            repair_threshold: Some(40),
            optimal_threshold: None,
        }])
        .unwrap();

        let applied = overrides.apply(scheme());
        assert_eq!(applied.repair, 40);
        assert_eq!(applied.optimal, 52);

        let other = RedundancyScheme::new(2, 3, 4, 5).unwrap();
        assert_eq!(overrides.apply(other), other);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let result = RepairOverrides::new(&[RedundancyOverride {
            required: 29,
            optimal: 52,
            total: 80,
            repair_threshold: Some(60),
            optimal_threshold: None,
        }]);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_duplicate_override_rejected() {
        let entry = RedundancyOverride {
            required: 29,
            optimal: 52,
            total: 80,
            repair_threshold: Some(36),
            optimal_threshold: None,
        };
        assert!(RepairOverrides::new(&[entry.clone(), entry]).is_err());
    }
}
