//! Capability probing and the per-version capability table.
//!
//! Probing only asks the runtime questions (does this class exist, do its
//! instances respond to this selector). It never sends a private message,
//! so resolving a table any number of times has no observable effect on
//! the framework or on any configuration.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, OnceLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::feature::{Feature, Lookup};
use crate::framework::{Framework, FrameworkVersion};

/// Probe outcome for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Availability {
    Available,
    /// One or more requirements are absent.
    Unavailable { missing: Vec<String> },
    /// The runtime could not answer a lookup.
    Inconclusive { reason: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }

    /// Human-readable explanation for anything other than `Available`.
    pub fn reason(&self) -> Option<String> {
        match self {
            Availability::Available => None,
            Availability::Unavailable { missing } => Some(format!("missing {}", missing.join(", "))),
            Availability::Inconclusive { reason } => Some(format!("probe inconclusive: {}", reason)),
        }
    }
}

/// Probe a single feature against the live object model.
pub fn probe_feature<F: Framework + ?Sized>(framework: &F, feature: Feature) -> Availability {
    let mut missing = Vec::new();
    for requirement in feature.requirements() {
        match framework.lookup(requirement) {
            Lookup::Present => {}
            Lookup::Missing => missing.push(requirement.to_string()),
            Lookup::Inconclusive(reason) => {
                warn!(
                    "probe for {} inconclusive at {}: {}",
                    feature, requirement, reason
                );
                return Availability::Inconclusive {
                    reason: format!("{}: {}", requirement, reason),
                };
            }
        }
    }

    let availability = if missing.is_empty() {
        Availability::Available
    } else {
        Availability::Unavailable { missing }
    };
    debug!("probe {} -> {:?}", feature, availability);
    availability
}

/// Availability of every [`Feature`] on one framework version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityTable {
    version: FrameworkVersion,
    features: BTreeMap<Feature, Availability>,
}

impl CapabilityTable {
    /// Probe every feature once.
    pub fn resolve<F: Framework + ?Sized>(framework: &F) -> Self {
        let features = Feature::ALL
            .into_iter()
            .map(|feature| (feature, probe_feature(framework, feature)))
            .collect();
        let table = Self {
            version: framework.version(),
            features,
        };
        info!(
            "resolved capabilities for framework {}: {:?}",
            table.version,
            table.supported_features()
        );
        table
    }

    pub fn version(&self) -> &FrameworkVersion {
        &self.version
    }

    pub fn availability(&self, feature: Feature) -> &Availability {
        // Every feature is inserted by `resolve`.
        &self.features[&feature]
    }

    pub fn is_supported(&self, feature: Feature) -> bool {
        self.availability(feature).is_available()
    }

    pub fn supported_features(&self) -> Vec<Feature> {
        self.features
            .iter()
            .filter(|(_, availability)| availability.is_available())
            .map(|(feature, _)| *feature)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, &Availability)> {
        self.features.iter().map(|(feature, a)| (*feature, a))
    }
}

/// Process-wide memo of capability tables, keyed by framework version.
///
/// Private symbols cannot change while a process runs, so a table
/// resolved once for a version stays valid for the process lifetime.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    tables: Mutex<HashMap<FrameworkVersion, CapabilityTable>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared cache used by the live framework.
    pub fn global() -> &'static CapabilityCache {
        static GLOBAL: OnceLock<CapabilityCache> = OnceLock::new();
        GLOBAL.get_or_init(CapabilityCache::new)
    }

    /// Return the cached table for the framework's version, probing on miss.
    pub fn resolve<F: Framework + ?Sized>(&self, framework: &F) -> CapabilityTable {
        let version = framework.version();
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(table) = tables.get(&version) {
            debug!("capability cache hit for framework {}", version);
            return table.clone();
        }
        let table = CapabilityTable::resolve(framework);
        tables.insert(version, table.clone());
        table
    }

    pub fn len(&self) -> usize {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
