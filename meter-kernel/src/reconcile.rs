//! Online/offline classification of the fleet.
//!
//! A meter is online when its newest reading lies within the freshness window
//! of the newest reading across the whole fleet. The baseline is the fleet,
//! not the wall clock, so a stalled ingestion pipeline does not mark every
//! meter offline at once.

use crate::models::{MeterId, MeterInfo, UNNAMED_SENTINEL};
use crate::store::{FleetLedger, MeterStore, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};

pub const DEFAULT_FRESHNESS: Duration = Duration::minutes(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// Result of one reconciliation pass. Every entry was judged against the
/// same `fleet_max`.
#[derive(Debug, Clone)]
pub struct Classification {
    fleet_max: Option<OffsetDateTime>,
    window: Duration,
    presence: HashMap<MeterId, Presence>,
}

impl Classification {
    fn empty(window: Duration) -> Self {
        Self {
            fleet_max: None,
            window,
            presence: HashMap::new(),
        }
    }

    /// Meters that were not part of the pass are offline.
    pub fn presence_of(&self, id: &MeterId) -> Presence {
        self.presence.get(id).copied().unwrap_or(Presence::Offline)
    }

    pub fn fleet_max(&self) -> Option<OffsetDateTime> {
        self.fleet_max
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MeterId, Presence)> {
        self.presence.iter().map(|(id, p)| (id, *p))
    }

    pub fn online_count(&self) -> usize {
        self.presence.values().filter(|p| **p == Presence::Online).count()
    }

    pub fn len(&self) -> usize {
        self.presence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presence.is_empty()
    }
}

pub fn classify(
    latest_per_device: &HashMap<MeterId, OffsetDateTime>,
    fleet_max: OffsetDateTime,
    window: Duration,
) -> Classification {
    let presence = latest_per_device
        .iter()
        .map(|(id, last)| {
            let p = if fleet_max - *last < window {
                Presence::Online
            } else {
                Presence::Offline
            };
            (id.clone(), p)
        })
        .collect();

    Classification {
        fleet_max: Some(fleet_max),
        window,
        presence,
    }
}

/// Reads the fleet baseline once, then classifies every meter against it.
pub fn reconcile<S: FleetLedger + ?Sized>(
    store: &S,
    window: Duration,
) -> Result<Classification, StoreError> {
    let Some(fleet_max) = store.most_recent_timestamp_across_fleet()? else {
        return Ok(Classification::empty(window));
    };
    let latest = store.most_recent_timestamp_per_device()?;
    Ok(classify(&latest, fleet_max, window))
}

/// Display text for how far a meter trails the newest reading in the fleet.
pub fn humanize_recency(delta: Duration) -> String {
    let minutes = delta.whole_minutes();
    if minutes < 1 {
        "most recent".to_string()
    } else if minutes < 60 {
        format!("{minutes} minutes after most recent")
    } else {
        format!("{} hours after most recent", minutes / 60)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub mac: MeterId,
    pub status: Presence,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    pub recency: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(with = "time::serde::rfc3339::option")]
    pub fleet_max: Option<OffsetDateTime>,
    pub rows: Vec<ReportRow>,
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub online_percent: f64,
    pub offline_percent: f64,
}

pub fn build_report(
    latest_per_device: &HashMap<MeterId, OffsetDateTime>,
    classification: &Classification,
    infos: &[MeterInfo],
) -> StatusReport {
    let names: HashMap<&MeterId, &str> = infos
        .iter()
        .filter(|i| !i.is_unnamed())
        .filter_map(|i| i.name.as_deref().map(|n| (&i.mac, n)))
        .collect();

    let mut ids: Vec<&MeterId> = latest_per_device.keys().collect();
    for info in infos {
        if !latest_per_device.contains_key(&info.mac) {
            ids.push(&info.mac);
        }
    }

    let mut rows: Vec<ReportRow> = ids
        .into_iter()
        .map(|id| {
            let last_seen = latest_per_device.get(id).copied();
            let recency = match (last_seen, classification.fleet_max()) {
                (Some(last), Some(max)) => humanize_recency(max - last),
                _ => "unknown".to_string(),
            };
            ReportRow {
                mac: id.clone(),
                status: classification.presence_of(id),
                last_seen,
                recency,
                name: names.get(id).copied().unwrap_or(UNNAMED_SENTINEL).to_string(),
            }
        })
        .collect();
    rows.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.mac.cmp(&b.mac)));

    let total = rows.len();
    let online = rows.iter().filter(|r| r.status == Presence::Online).count();
    let offline = total - online;
    let percent = |n: usize| {
        if total == 0 {
            0.0
        } else {
            n as f64 * 100.0 / total as f64
        }
    };

    StatusReport {
        fleet_max: classification.fleet_max(),
        rows,
        total,
        online,
        offline,
        online_percent: percent(online),
        offline_percent: percent(offline),
    }
}

/// One reconciliation pass over the store, rendered as a report.
pub fn status_report<S: MeterStore + ?Sized>(store: &S, window: Duration) -> Result<StatusReport, StoreError> {
    let fleet_max = store.most_recent_timestamp_across_fleet()?;
    let latest = store.most_recent_timestamp_per_device()?;
    let classification = match fleet_max {
        Some(max) => classify(&latest, max, window),
        None => Classification::empty(window),
    };
    Ok(build_report(&latest, &classification, &store.meter_infos()?))
}
