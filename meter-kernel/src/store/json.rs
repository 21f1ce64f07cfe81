use super::{
    DailyReading, FleetLedger, MeterDetail, MeterStore, MeterSummary, StoreError, UnnamedMeter,
};
use crate::models::{MeterId, MeterInfo, PowerState, Reading, StatusRow, UNNAMED_SENTINEL};
use crate::reconcile::{classify, Presence};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, info};

/// On-disk document: the three tables of the legacy database.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    readings: Vec<Reading>,
    #[serde(default)]
    statuses: Vec<StatusRow>,
    #[serde(default)]
    meters: Vec<MeterInfo>,
}

impl Tables {
    fn latest_reading(&self, id: &MeterId) -> Option<&Reading> {
        self.readings
            .iter()
            .filter(|r| &r.mac == id)
            .max_by_key(|r| r.timestamp)
    }

    fn latest_status(&self, id: &MeterId) -> Option<&StatusRow> {
        self.statuses
            .iter()
            .filter(|s| &s.mac == id)
            .max_by_key(|s| s.timestamp)
    }

    fn info(&self, id: &MeterId) -> Option<&MeterInfo> {
        self.meters.iter().find(|m| &m.mac == id)
    }

    fn latest_per_device(&self) -> HashMap<MeterId, OffsetDateTime> {
        let mut latest: HashMap<MeterId, OffsetDateTime> = HashMap::new();
        for r in &self.readings {
            latest
                .entry(r.mac.clone())
                .and_modify(|t| *t = (*t).max(r.timestamp))
                .or_insert(r.timestamp);
        }
        latest
    }

    fn fleet_max(&self) -> Option<OffsetDateTime> {
        self.readings.iter().map(|r| r.timestamp).max()
    }
}

/// Status rows kept per meter; older rows are dropped as new ones arrive.
pub const STATUS_HISTORY_PER_METER: usize = 50;

/// Store persisted as a single JSON file, rewritten after every change.
pub struct JsonFileStore {
    storage_path: PathBuf,
    cache: Mutex<Tables>,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(storage_path: P) -> Result<Self, StoreError> {
        let path = storage_path.into();
        let store = Self {
            storage_path: path.clone(),
            cache: Mutex::new(Tables::default()),
        };

        store.load_from_disk()?;
        info!("meter store opened at {}", path.display());
        Ok(store)
    }

    fn load_from_disk(&self) -> Result<(), StoreError> {
        if !self.storage_path.exists() {
            if let Some(parent) = self.storage_path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let empty = serde_json::to_string_pretty(&Tables::default())?;
            fs::write(&self.storage_path, empty)?;
        }

        let content = fs::read_to_string(&self.storage_path)?;
        let tables: Tables = if content.trim().is_empty() {
            Tables::default()
        } else {
            serde_json::from_str(&content)?
        };

        *self.cache.lock() = tables;
        Ok(())
    }

    /// Called with the cache lock held so writes land on disk in order.
    fn save_to_disk(&self, tables: &Tables) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(tables)?;
        fs::write(&self.storage_path, json)?;
        Ok(())
    }
}

impl FleetLedger for JsonFileStore {
    fn most_recent_timestamp_across_fleet(&self) -> Result<Option<OffsetDateTime>, StoreError> {
        Ok(self.cache.lock().fleet_max())
    }

    fn most_recent_timestamp_per_device(&self) -> Result<HashMap<MeterId, OffsetDateTime>, StoreError> {
        Ok(self.cache.lock().latest_per_device())
    }

    fn record_status_event(
        &self,
        id: &MeterId,
        status: PowerState,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        cache.statuses.push(StatusRow {
            mac: id.clone(),
            status,
            timestamp: at,
        });
        let kept = cache.statuses.iter().filter(|s| &s.mac == id).count();
        if kept > STATUS_HISTORY_PER_METER {
            if let Some(oldest) = cache
                .statuses
                .iter()
                .enumerate()
                .filter(|(_, s)| &s.mac == id)
                .min_by_key(|(_, s)| s.timestamp)
                .map(|(i, _)| i)
            {
                cache.statuses.remove(oldest);
            }
        }
        self.save_to_disk(&cache)?;
        debug!("recorded status {} for {}", status, id);
        Ok(())
    }
}

impl MeterStore for JsonFileStore {
    fn ping(&self) -> bool {
        self.storage_path.exists()
    }

    fn record_reading(&self, reading: Reading) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        cache.readings.push(reading);
        self.save_to_disk(&cache)
    }

    fn list_meters(&self) -> Result<Vec<MeterSummary>, StoreError> {
        let cache = self.cache.lock();
        let ids: BTreeSet<&MeterId> = cache
            .readings
            .iter()
            .map(|r| &r.mac)
            .chain(cache.statuses.iter().map(|s| &s.mac))
            .collect();

        let meters = ids
            .into_iter()
            .map(|id| {
                let reading = cache.latest_reading(id);
                let status = cache.latest_status(id);
                let info = cache.info(id);
                MeterSummary {
                    mac: id.clone(),
                    name: info
                        .filter(|i| !i.is_unnamed())
                        .and_then(|i| i.name.clone())
                        .unwrap_or_else(|| UNNAMED_SENTINEL.to_string()),
                    number: info.and_then(|i| i.number),
                    last_reading: reading.map(|r| r.total_kwh),
                    last_seen: reading.map(|r| r.timestamp),
                    power: status.map(|s| s.status),
                    last_status_at: status.map(|s| s.timestamp),
                }
            })
            .collect();
        Ok(meters)
    }

    fn meter_detail(&self, id: &MeterId) -> Result<Option<MeterDetail>, StoreError> {
        let cache = self.cache.lock();
        let info = cache.info(id).cloned();
        let last_reading = cache.latest_reading(id).cloned();
        let status = cache.latest_status(id).cloned();

        if info.is_none() && last_reading.is_none() && status.is_none() {
            return Ok(None);
        }
        Ok(Some(MeterDetail {
            mac: id.clone(),
            info,
            last_reading,
            status,
        }))
    }

    fn readings(&self, id: &MeterId, limit: usize) -> Result<Vec<Reading>, StoreError> {
        let cache = self.cache.lock();
        let mut readings: Vec<Reading> = cache
            .readings
            .iter()
            .filter(|r| &r.mac == id)
            .cloned()
            .collect();
        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        readings.truncate(limit);
        Ok(readings)
    }

    fn daily_readings(&self, id: &MeterId, days: usize) -> Result<Vec<DailyReading>, StoreError> {
        let cache = self.cache.lock();
        let mut own: Vec<&Reading> = cache.readings.iter().filter(|r| &r.mac == id).collect();
        own.sort_by_key(|r| r.timestamp);

        // date -> (first, last, samples)
        let mut per_day: BTreeMap<time::Date, (f64, f64, usize)> = BTreeMap::new();
        for r in own {
            let date = r.timestamp.to_offset(UtcOffset::UTC).date();
            per_day
                .entry(date)
                .and_modify(|(_, last, n)| {
                    *last = r.total_kwh;
                    *n += 1;
                })
                .or_insert((r.total_kwh, r.total_kwh, 1));
        }

        Ok(per_day
            .into_iter()
            .rev()
            .take(days)
            .map(|(date, (first, last, samples))| DailyReading {
                mac: id.clone(),
                date: date.to_string(),
                first_kwh: first,
                last_kwh: last,
                consumed_kwh: last - first,
                samples,
            })
            .collect())
    }

    fn unnamed_meters(&self, window: Duration) -> Result<Vec<UnnamedMeter>, StoreError> {
        let cache = self.cache.lock();
        let latest = cache.latest_per_device();
        let classification = cache.fleet_max().map(|max| classify(&latest, max, window));

        let named: BTreeSet<&MeterId> = cache
            .meters
            .iter()
            .filter(|m| !m.is_unnamed())
            .map(|m| &m.mac)
            .collect();

        let mut meters: Vec<UnnamedMeter> = latest
            .iter()
            .filter(|(id, _)| !named.contains(id))
            .map(|(id, last_seen)| {
                let days: BTreeSet<time::Date> = cache
                    .readings
                    .iter()
                    .filter(|r| &r.mac == id)
                    .map(|r| r.timestamp.to_offset(UtcOffset::UTC).date())
                    .collect();
                UnnamedMeter {
                    mac: id.clone(),
                    last_seen: Some(*last_seen),
                    status: classification
                        .as_ref()
                        .map(|c| c.presence_of(id))
                        .unwrap_or(Presence::Offline),
                    latest_kwh: cache.latest_reading(id).map(|r| r.total_kwh),
                    days_with_data: days.len(),
                    name: None,
                    number: None,
                }
            })
            .collect();
        meters.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.mac.cmp(&b.mac)));

        // Info rows without readings that are still unnamed.
        for info in cache.meters.iter().filter(|m| m.is_unnamed()) {
            if meters.iter().any(|m| m.mac == info.mac) {
                continue;
            }
            meters.push(UnnamedMeter {
                mac: info.mac.clone(),
                last_seen: None,
                status: Presence::Offline,
                latest_kwh: None,
                days_with_data: 0,
                name: None,
                number: None,
            });
        }

        debug!("found {} unnamed meters", meters.len());
        Ok(meters)
    }

    fn meter_infos(&self) -> Result<Vec<MeterInfo>, StoreError> {
        Ok(self.cache.lock().meters.clone())
    }

    fn meter_by_number(&self, number: u16) -> Result<Option<MeterInfo>, StoreError> {
        Ok(self
            .cache
            .lock()
            .meters
            .iter()
            .find(|m| m.number == Some(number))
            .cloned())
    }

    fn upsert_meter_info(&self, info: MeterInfo) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        if let Some(number) = info.number {
            if let Some(owner) = cache
                .meters
                .iter()
                .find(|m| m.number == Some(number) && m.mac != info.mac)
            {
                return Err(StoreError::NumberTaken {
                    number,
                    owner: owner.mac.clone(),
                });
            }
        }

        match cache.meters.iter_mut().find(|m| m.mac == info.mac) {
            Some(existing) => *existing = info,
            None => cache.meters.push(info),
        }
        self.save_to_disk(&cache)
    }

    fn delete_meter(&self, id: &MeterId) -> Result<bool, StoreError> {
        let mut cache = self.cache.lock();
        let before = cache.readings.len() + cache.statuses.len() + cache.meters.len();
        cache.readings.retain(|r| &r.mac != id);
        cache.statuses.retain(|s| &s.mac != id);
        cache.meters.retain(|m| &m.mac != id);
        let after = cache.readings.len() + cache.statuses.len() + cache.meters.len();

        if before == after {
            return Ok(false);
        }
        self.save_to_disk(&cache)?;
        info!("deleted meter {}", id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn id(s: &str) -> MeterId {
        MeterId::parse(s).unwrap()
    }

    fn reading(mac: &str, at: OffsetDateTime, kwh: f64) -> Reading {
        Reading { mac: id(mac), timestamp: at, total_kwh: kwh }
    }

    fn store() -> (tempfile::TempDir, JsonFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("data").join("meters.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_creates_file_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meters.json");
        {
            let store = JsonFileStore::new(&path).unwrap();
            assert!(store.ping());
            store.record_reading(reading("00:01", datetime!(2024-05-01 12:00 UTC), 1.5)).unwrap();
            store
                .upsert_meter_info(MeterInfo { mac: id("00:01"), name: Some("Kontor".into()), number: Some(7) })
                .unwrap();
        }
        let reopened = JsonFileStore::new(&path).unwrap();
        assert_eq!(reopened.readings(&id("00:01"), 10).unwrap().len(), 1);
        assert_eq!(reopened.meter_by_number(7).unwrap().unwrap().mac, id("00:01"));
    }

    #[test]
    fn test_fleet_timestamps() {
        let (_dir, store) = store();
        assert_eq!(store.most_recent_timestamp_across_fleet().unwrap(), None);

        store.record_reading(reading("00:01", datetime!(2024-05-01 10:00 UTC), 1.0)).unwrap();
        store.record_reading(reading("00:01", datetime!(2024-05-01 11:00 UTC), 2.0)).unwrap();
        store.record_reading(reading("00:02", datetime!(2024-05-01 12:00 UTC), 9.0)).unwrap();

        assert_eq!(
            store.most_recent_timestamp_across_fleet().unwrap(),
            Some(datetime!(2024-05-01 12:00 UTC))
        );
        let latest = store.most_recent_timestamp_per_device().unwrap();
        assert_eq!(latest[&id("00:01")], datetime!(2024-05-01 11:00 UTC));
        assert_eq!(latest[&id("00:02")], datetime!(2024-05-01 12:00 UTC));
    }

    #[test]
    fn test_list_meters_includes_status_only_meters() {
        let (_dir, store) = store();
        store.record_reading(reading("00:01", datetime!(2024-05-01 10:00 UTC), 3.0)).unwrap();
        store
            .record_status_event(&id("00:02"), PowerState::On, datetime!(2024-05-01 10:05 UTC))
            .unwrap();
        store
            .upsert_meter_info(MeterInfo { mac: id("00:02"), name: Some("Pumpe".into()), number: Some(2) })
            .unwrap();

        let meters = store.list_meters().unwrap();
        assert_eq!(meters.len(), 2);
        assert_eq!(meters[0].mac, id("00:01"));
        assert_eq!(meters[0].name, UNNAMED_SENTINEL);
        assert_eq!(meters[0].last_reading, Some(3.0));
        assert_eq!(meters[0].power, None);
        assert_eq!(meters[1].name, "Pumpe");
        assert_eq!(meters[1].power, Some(PowerState::On));
        assert_eq!(meters[1].last_seen, None);
    }

    #[test]
    fn test_status_history_is_bounded_per_meter() {
        let (_dir, store) = store();
        let start = datetime!(2024-05-01 00:00 UTC);
        for i in 0..(STATUS_HISTORY_PER_METER as i64 + 10) {
            let status = if i % 2 == 0 { PowerState::On } else { PowerState::Off };
            store
                .record_status_event(&id("00:01"), status, start + Duration::minutes(i))
                .unwrap();
        }
        store
            .record_status_event(&id("00:02"), PowerState::On, start)
            .unwrap();

        let cache = store.cache.lock();
        let kept: Vec<_> = cache.statuses.iter().filter(|s| s.mac == id("00:01")).collect();
        assert_eq!(kept.len(), STATUS_HISTORY_PER_METER);
        assert_eq!(kept[0].timestamp, start + Duration::minutes(10));
        assert_eq!(cache.latest_status(&id("00:02")).unwrap().status, PowerState::On);
        drop(cache);

        let detail = store.meter_detail(&id("00:01")).unwrap().unwrap();
        assert_eq!(
            detail.status.unwrap().timestamp,
            start + Duration::minutes(STATUS_HISTORY_PER_METER as i64 + 9)
        );
    }

    #[test]
    fn test_meter_detail() {
        let (_dir, store) = store();
        assert!(store.meter_detail(&id("00:01")).unwrap().is_none());

        store.record_reading(reading("00:01", datetime!(2024-05-01 10:00 UTC), 3.0)).unwrap();
        store.record_reading(reading("00:01", datetime!(2024-05-01 11:00 UTC), 4.0)).unwrap();
        store
            .record_status_event(&id("00:01"), PowerState::Off, datetime!(2024-05-01 11:30 UTC))
            .unwrap();

        let detail = store.meter_detail(&id("00:01")).unwrap().unwrap();
        assert!(detail.info.is_none());
        assert_eq!(detail.last_reading.unwrap().total_kwh, 4.0);
        assert_eq!(detail.status.unwrap().status, PowerState::Off);
    }

    #[test]
    fn test_readings_newest_first_with_limit() {
        let (_dir, store) = store();
        for h in 0..5u8 {
            let at = datetime!(2024-05-01 00:00 UTC) + Duration::hours(h as i64);
            store.record_reading(reading("00:01", at, h as f64)).unwrap();
        }
        let readings = store.readings(&id("00:01"), 3).unwrap();
        assert_eq!(readings.iter().map(|r| r.total_kwh).collect::<Vec<_>>(), vec![4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_daily_readings() {
        let (_dir, store) = store();
        store.record_reading(reading("00:01", datetime!(2024-05-01 08:00 UTC), 10.0)).unwrap();
        store.record_reading(reading("00:01", datetime!(2024-05-01 20:00 UTC), 12.5)).unwrap();
        store.record_reading(reading("00:01", datetime!(2024-05-02 09:00 UTC), 13.0)).unwrap();
        store.record_reading(reading("00:01", datetime!(2024-05-03 09:00 UTC), 15.0)).unwrap();

        let daily = store.daily_readings(&id("00:01"), 2).unwrap();
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].date, "2024-05-03");
        assert_eq!(daily[1].date, "2024-05-02");

        let all = store.daily_readings(&id("00:01"), 30).unwrap();
        assert_eq!(all[2].date, "2024-05-01");
        assert_eq!(all[2].consumed_kwh, 2.5);
        assert_eq!(all[2].samples, 2);
    }

    #[test]
    fn test_unnamed_meters_three_way_equivalence() {
        let (_dir, store) = store();
        let max = datetime!(2024-05-01 12:00 UTC);
        store.record_reading(reading("00:01", max, 1.0)).unwrap();
        store.record_reading(reading("00:02", max - Duration::minutes(10), 2.0)).unwrap();
        store.record_reading(reading("00:03", max - Duration::hours(3), 3.0)).unwrap();
        store.record_reading(reading("00:04", max - Duration::hours(4), 4.0)).unwrap();

        // 00:01 named, 00:02 empty name, 00:03 sentinel, 00:04 no info row
        let infos = [
            ("00:01", Some("Kontor"), Some(1)),
            ("00:02", Some(""), None),
            ("00:03", Some(UNNAMED_SENTINEL), None),
            ("00:05", None, None),
        ];
        for (mac, name, number) in infos {
            store
                .upsert_meter_info(MeterInfo { mac: id(mac), name: name.map(String::from), number })
                .unwrap();
        }

        let unnamed = store.unnamed_meters(Duration::minutes(30)).unwrap();
        let macs: Vec<&str> = unnamed.iter().map(|m| m.mac.as_str()).collect();
        assert_eq!(macs, vec!["00:02", "00:03", "00:04", "00:05"]);
        assert_eq!(unnamed[0].status, Presence::Online);
        assert_eq!(unnamed[1].status, Presence::Offline);
        assert_eq!(unnamed[0].days_with_data, 1);
        assert_eq!(unnamed[3].last_seen, None);
        assert_eq!(unnamed[3].days_with_data, 0);
        assert!(unnamed.iter().all(|m| m.name.is_none() && m.number.is_none()));
    }

    #[test]
    fn test_number_uniqueness() {
        let (_dir, store) = store();
        store
            .upsert_meter_info(MeterInfo { mac: id("00:01"), name: Some("A".into()), number: Some(5) })
            .unwrap();
        // Same meter may keep its own number.
        store
            .upsert_meter_info(MeterInfo { mac: id("00:01"), name: Some("A2".into()), number: Some(5) })
            .unwrap();
        let err = store
            .upsert_meter_info(MeterInfo { mac: id("00:02"), name: Some("B".into()), number: Some(5) })
            .unwrap_err();
        assert!(matches!(err, StoreError::NumberTaken { number: 5, .. }));
        assert_eq!(store.meter_infos().unwrap().len(), 1);
        assert_eq!(store.meter_infos().unwrap()[0].name.as_deref(), Some("A2"));
    }

    #[test]
    fn test_delete_meter() {
        let (_dir, store) = store();
        assert!(!store.delete_meter(&id("00:01")).unwrap());

        store.record_reading(reading("00:01", datetime!(2024-05-01 12:00 UTC), 1.0)).unwrap();
        store
            .record_status_event(&id("00:01"), PowerState::On, datetime!(2024-05-01 12:01 UTC))
            .unwrap();
        store.record_reading(reading("00:02", datetime!(2024-05-01 12:00 UTC), 1.0)).unwrap();

        assert!(store.delete_meter(&id("00:01")).unwrap());
        assert!(store.meter_detail(&id("00:01")).unwrap().is_none());
        assert_eq!(store.list_meters().unwrap().len(), 1);
    }
}
