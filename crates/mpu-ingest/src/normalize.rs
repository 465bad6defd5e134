//! Record normalization
//!
//! Turns raw Mixpanel records into CleverTap upload records. Malformed records
//! are logged and dropped; nothing here fails the pipeline.

use crate::cancellation::CancellationBus;
use crate::record::{CanonicalRecord, EventRecord, ProfileRecord, SourceRecord, MAX_PROPERTIES};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Property key holding the event's user identity.
pub const DISTINCT_ID_KEY: &str = "distinct_id";

/// Property key holding the event's unix timestamp.
pub const TIME_KEY: &str = "time";

/// Event names CleverTap reserves for itself.
pub const RESTRICTED_EVENTS: &[&str] = &[
    "Notification Sent",
    "Notification Viewed",
    "Notification Clicked",
    "UTM Visited",
    "App Launched",
    "App Uninstalled",
    "Stayed",
];

/// Mixpanel profile keys (after `$` stripping) and their CleverTap names.
pub const PROFILE_RENAMES: &[(&str, &str)] = &[
    ("name", "Name"),
    ("email", "Email"),
    ("gender", "Gender"),
    ("facebook_id", "fbId"),
    ("timezone", "Timezone"),
    ("date_of_birth", "Birthday"),
    ("phone", "Phone"),
];

/// Profile keys never uploaded.
pub const EXCLUDED_PROFILE_KEYS: &[&str] = &["Email", "Date Of Birth", "Phone"];

/// Filtering and renaming tables applied during normalization.
#[derive(Debug, Clone)]
pub struct NormalizationRules {
    pub renames: HashMap<String, String>,
    pub excluded_keys: HashSet<String>,
    pub restricted_events: HashSet<String>,
    pub max_properties: usize,
}

impl Default for NormalizationRules {
    fn default() -> Self {
        Self {
            renames: PROFILE_RENAMES
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
            excluded_keys: EXCLUDED_PROFILE_KEYS.iter().map(|k| k.to_string()).collect(),
            restricted_events: RESTRICTED_EVENTS.iter().map(|e| e.to_string()).collect(),
            max_properties: MAX_PROPERTIES,
        }
    }
}

/// Counters for one normalizer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizerStats {
    pub received: u64,
    pub emitted: u64,
    pub dropped: u64,
}

/// Converts source records into canonical records.
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    rules: NormalizationRules,
    clock: fn() -> i64,
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new(NormalizationRules::default())
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl RecordNormalizer {
    pub fn new(rules: NormalizationRules) -> Self {
        Self {
            rules,
            clock: unix_now,
        }
    }

    /// Replace the wall clock used to stamp profile records.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Normalize one record. Each source record yields at most one canonical record.
    pub fn normalize(&self, record: SourceRecord) -> Option<CanonicalRecord> {
        match record {
            SourceRecord::Profile(profile) => self.normalize_profile(profile),
            SourceRecord::Event(event) => self.normalize_event(event),
        }
    }

    pub fn normalize_profile(&self, record: ProfileRecord) -> Option<CanonicalRecord> {
        if record.identity.is_empty() {
            warn!(properties = record.properties.len(), "Identity not found for profile, skipping");
            return None;
        }

        let mut data = Map::new();
        for (key, value) in record.properties {
            if data.len() >= self.rules.max_properties {
                debug!(identity = %record.identity, "Profile property limit reached, truncating");
                break;
            }
            let Some(value) = value else {
                continue;
            };

            let key = match key.strip_prefix('$') {
                Some(stripped) => stripped.to_string(),
                None => key,
            };
            let key = match self.rules.renames.get(&key) {
                Some(renamed) => renamed.clone(),
                None => key,
            };
            if self.rules.excluded_keys.contains(&key) {
                continue;
            }

            data.insert(key, value.to_json());
        }

        let ts = (self.clock)();
        CanonicalRecord::profile(record.identity, ts, data)
    }

    pub fn normalize_event(&self, record: EventRecord) -> Option<CanonicalRecord> {
        if record.event_name.is_empty() {
            warn!("Event name missing, skipping record");
            return None;
        }

        let identity = match record.properties.get(DISTINCT_ID_KEY) {
            Some(Some(value)) => value.as_identity(),
            _ => None,
        };
        let Some(identity) = identity else {
            warn!(event = %record.event_name, "Identity missing for event, skipping");
            return None;
        };

        let ts = match record.properties.get(TIME_KEY) {
            Some(Some(value)) => value.as_timestamp(),
            _ => None,
        };
        let Some(ts) = ts else {
            warn!(event = %record.event_name, identity = %identity, "Timestamp missing for event, skipping");
            return None;
        };

        let name = if self.rules.restricted_events.contains(&record.event_name) {
            format!("_{}", record.event_name)
        } else {
            record.event_name
        };

        let mut data = Map::new();
        for (key, value) in record.properties {
            if data.len() >= self.rules.max_properties {
                debug!(event = %name, "Event property limit reached, truncating");
                break;
            }
            if key == DISTINCT_ID_KEY || key == TIME_KEY || key.starts_with('$') {
                continue;
            }
            let Some(value) = value else {
                continue;
            };

            data.insert(key, value.to_flat_json());
        }

        CanonicalRecord::event(identity, ts, name, data)
    }

    /// Normalize records from `rx` and forward them to `tx` until the source
    /// closes or cancellation is requested.
    pub async fn run(
        self,
        bus: CancellationBus,
        mut rx: mpsc::Receiver<SourceRecord>,
        tx: mpsc::Sender<CanonicalRecord>,
    ) -> NormalizerStats {
        let mut stats = NormalizerStats::default();

        while let Some(record) = bus.recv(&mut rx).await {
            stats.received += 1;
            let Some(canonical) = self.normalize(record) else {
                stats.dropped += 1;
                continue;
            };

            if let Err(reason) = bus.send(&tx, canonical).await {
                debug!(?reason, "Normalizer stopping, downstream unavailable");
                return stats;
            }
            stats.emitted += 1;
        }

        if bus.is_requested() {
            debug!("Normalizer observed cancellation");
        } else {
            info!(
                received = stats.received,
                emitted = stats.emitted,
                dropped = stats.dropped,
                "Normalization finished"
            );
        }

        stats
    }
}
