/**
 * METER STORE - Persistence seam for readings, names and power transitions
 *
 * ROLE :
 * Defines what the bridge needs from the relational data store of the meter
 * fleet, independent of where the rows actually live.
 *
 * HOW IT WORKS :
 * - FleetLedger = the narrow contract the core consumes (fleet max timestamp,
 *   newest timestamp per meter, power transition log)
 * - MeterStore = FleetLedger + the read/write operations behind the HTTP layer
 *   (listing, detail, readings, daily summaries, naming, deletion)
 * - JsonFileStore = shipped implementation, one JSON document on disk with an
 *   in-memory cache
 *
 * NAMING :
 * A meter counts as unnamed when its name is NULL, empty, or the legacy
 * sentinel "Unavngivet". All three are treated alike everywhere.
 */

pub mod json;

pub use json::JsonFileStore;

use crate::models::{MeterId, MeterInfo, PowerState, Reading, StatusRow};
use crate::reconcile::Presence;
use serde::Serialize;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("meter not found: {0}")]
    NotFound(MeterId),
    #[error("meter number {number} already used by {owner}")]
    NumberTaken { number: u16, owner: MeterId },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the core reads from and writes to the store.
pub trait FleetLedger: Send + Sync {
    /// Newest reading timestamp across every meter; `None` when there are no readings.
    fn most_recent_timestamp_across_fleet(&self) -> Result<Option<OffsetDateTime>, StoreError>;

    fn most_recent_timestamp_per_device(&self) -> Result<HashMap<MeterId, OffsetDateTime>, StoreError>;

    fn record_status_event(
        &self,
        id: &MeterId,
        status: PowerState,
        at: OffsetDateTime,
    ) -> Result<(), StoreError>;
}

/// Full store surface used by the HTTP layer.
pub trait MeterStore: FleetLedger {
    fn ping(&self) -> bool;

    /// Ingestion side; readings are immutable once written.
    fn record_reading(&self, reading: Reading) -> Result<(), StoreError>;

    fn list_meters(&self) -> Result<Vec<MeterSummary>, StoreError>;

    fn meter_detail(&self, id: &MeterId) -> Result<Option<MeterDetail>, StoreError>;

    /// Newest first.
    fn readings(&self, id: &MeterId, limit: usize) -> Result<Vec<Reading>, StoreError>;

    /// One entry per UTC calendar day, newest day first.
    fn daily_readings(&self, id: &MeterId, days: usize) -> Result<Vec<DailyReading>, StoreError>;

    fn unnamed_meters(&self, window: Duration) -> Result<Vec<UnnamedMeter>, StoreError>;

    fn meter_infos(&self) -> Result<Vec<MeterInfo>, StoreError>;

    fn meter_by_number(&self, number: u16) -> Result<Option<MeterInfo>, StoreError>;

    fn upsert_meter_info(&self, info: MeterInfo) -> Result<(), StoreError>;

    /// Removes info, readings and power log of a meter. `false` when nothing existed.
    fn delete_meter(&self, id: &MeterId) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterSummary {
    pub mac: MeterId,
    pub name: String,
    pub number: Option<u16>,
    pub last_reading: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    pub power: Option<PowerState>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_status_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterDetail {
    pub mac: MeterId,
    pub info: Option<MeterInfo>,
    pub last_reading: Option<Reading>,
    pub status: Option<StatusRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyReading {
    pub mac: MeterId,
    /// `YYYY-MM-DD`
    pub date: String,
    pub first_kwh: f64,
    pub last_kwh: f64,
    pub consumed_kwh: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnnamedMeter {
    pub mac: MeterId,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    pub status: Presence,
    pub latest_kwh: Option<f64>,
    pub days_with_data: usize,
    pub name: Option<String>,
    pub number: Option<u16>,
}
