//! Health authority routing.
//!
//! Downloaded keys are grouped by origin country and each group is published
//! under the Health Authority ID the local key server knows that country by.

use std::collections::{BTreeMap, HashMap};

use lazy_static::lazy_static;

use crate::logging::structured::LogContext;
use crate::storage::models::DiagnosisKey;

lazy_static! {
    /// Federation participants and their key server health authority IDs.
    static ref DEFAULT_AUTHORITIES: HashMap<&'static str, &'static str> = HashMap::from([
        ("AT", "efgs-at"),
        ("BE", "efgs-be"),
        ("CY", "efgs-cy"),
        ("CZ", "efgs-cz"),
        ("DE", "efgs-de"),
        ("DK", "efgs-dk"),
        ("EE", "efgs-ee"),
        ("ES", "efgs-es"),
        ("FI", "efgs-fi"),
        ("HR", "efgs-hr"),
        ("IE", "efgs-ie"),
        ("IT", "efgs-it"),
        ("LT", "efgs-lt"),
        ("LV", "efgs-lv"),
        ("MT", "efgs-mt"),
        ("NL", "efgs-nl"),
        ("NO", "efgs-no"),
        ("PL", "efgs-pl"),
        ("SI", "efgs-si"),
        ("SK", "efgs-sk"),
    ]);
}

/// Country code to Health Authority ID mapping.
#[derive(Debug, Clone)]
pub struct AuthorityMap {
    authorities: HashMap<String, String>,
}

impl Default for AuthorityMap {
    fn default() -> Self {
        Self {
            authorities: DEFAULT_AUTHORITIES
                .iter()
                .map(|(country, haid)| (country.to_string(), haid.to_string()))
                .collect(),
        }
    }
}

impl AuthorityMap {
    /// Default participants with `overrides` layered on top.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let mut map = Self::default();
        for (country, haid) in overrides {
            map.authorities
                .insert(country.to_uppercase(), haid.to_string());
        }
        map
    }

    /// HAID for a country code, case-insensitive.
    pub fn resolve(&self, country: &str) -> Option<&str> {
        self.authorities
            .get(&country.to_uppercase())
            .map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }
}

/// Group keys by upper-cased origin country, ordered by country code.
pub fn group_by_origin(
    keys: Vec<DiagnosisKey>,
    ctx: &LogContext,
) -> BTreeMap<String, Vec<DiagnosisKey>> {
    let mut groups: BTreeMap<String, Vec<DiagnosisKey>> = BTreeMap::new();
    for key in keys {
        groups.entry(key.origin.to_uppercase()).or_default().push(key);
    }

    log::info!(
        "{} KEYS_GROUPED groups={:?}",
        ctx,
        groups
            .iter()
            .map(|(country, keys)| (country.as_str(), keys.len()))
            .collect::<Vec<_>>()
    );

    groups
}
