//! Latest-result cache keyed by (skill, time bucket).
//!
//! Reads only ever see the current bucket unless a caller asks for a specific
//! retained bucket. Every write prunes buckets that fell out of the skill's
//! retention window and persists the full bucket map before returning.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use quill_core::{lock_unpoisoned, Clock};
use serde::Serialize;

use crate::bucket_policy::BucketPolicy;
use crate::cache_store::{BucketMap, CacheEntry, CacheStore};
use crate::error::SkillCacheError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// One slot of a skill's bucket set, with or without data.
pub struct BucketAvailability {
    pub bucket_key: String,
    pub has_data: bool,
    pub is_current: bool,
    pub starts_at: DateTime<Utc>,
    pub generated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Outcome of reloading persisted buckets at startup.
pub struct CacheLoadReport {
    pub loaded_skills: usize,
    pub loaded_buckets: usize,
    pub pruned_buckets: usize,
    pub ignored_buckets: usize,
    pub failed_skills: Vec<String>,
}

pub struct WindowedCache {
    policies: BTreeMap<String, BucketPolicy>,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, BucketMap>>,
}

impl std::fmt::Debug for WindowedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowedCache")
            .field("skills", &self.policies.keys().collect::<Vec<_>>())
            .field("store", &self.store)
            .finish()
    }
}

impl WindowedCache {
    pub fn new(
        policies: BTreeMap<String, BucketPolicy>,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies,
            store,
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self, skill_id: &str) -> Option<&BucketPolicy> {
        self.policies.get(skill_id)
    }

    pub fn skill_ids(&self) -> Vec<String> {
        self.policies.keys().cloned().collect()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Reloads every known skill from the store, drops buckets that aged out
    /// while the process was down, and re-persists pruned maps.
    pub fn load_all(&self) -> CacheLoadReport {
        let now = self.clock.now();
        let mut report = CacheLoadReport::default();
        let mut buckets = lock_unpoisoned(&self.buckets);
        for (skill_id, policy) in &self.policies {
            let loaded = match self.store.load(skill_id) {
                Ok(Some(loaded)) => loaded,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(skill_id = %skill_id, error = %error, "failed to load skill cache");
                    report.failed_skills.push(skill_id.clone());
                    continue;
                }
            };
            let mut map = loaded.buckets;
            let pruned = prune_buckets(policy, &mut map, now);
            report.loaded_skills += 1;
            report.loaded_buckets += map.len();
            report.pruned_buckets += pruned;
            report.ignored_buckets += loaded.malformed_buckets;
            if pruned > 0 || loaded.malformed_buckets > 0 {
                if let Err(error) = self.store.save(skill_id, &map) {
                    tracing::warn!(skill_id = %skill_id, error = %error, "failed to persist pruned skill cache");
                }
            }
            buckets.insert(skill_id.clone(), map);
        }
        tracing::debug!(
            loaded_skills = report.loaded_skills,
            pruned_buckets = report.pruned_buckets,
            "skill cache loaded"
        );
        report
    }

    /// Returns the entry for the skill's current bucket, never an older one.
    pub fn get(&self, skill_id: &str) -> Option<CacheEntry> {
        let policy = self.policies.get(skill_id)?;
        let slot = policy.current_slot(self.clock.now());
        let buckets = lock_unpoisoned(&self.buckets);
        buckets
            .get(skill_id)
            .and_then(|map| map.get(&slot.key))
            .filter(|entry| slot.contains(entry.generated_at))
            .cloned()
    }

    /// Returns the entry stored under `bucket_key` while that bucket is still retained.
    pub fn get_by_bucket(&self, skill_id: &str, bucket_key: &str) -> Option<CacheEntry> {
        let policy = self.policies.get(skill_id)?;
        let now = self.clock.now();
        let buckets = lock_unpoisoned(&self.buckets);
        buckets
            .get(skill_id)
            .and_then(|map| map.get(bucket_key))
            .filter(|entry| policy.retains(bucket_key, entry.generated_at, now))
            .cloned()
    }

    /// Stores `content` as the current bucket's entry, prunes, and persists.
    ///
    /// When persistence fails the entry stays visible in memory and the error
    /// is returned so the caller can report it.
    pub fn set(&self, skill_id: &str, content: impl Into<String>) -> Result<CacheEntry, SkillCacheError> {
        if skill_id.trim().is_empty() {
            return Err(SkillCacheError::InvalidSkillId);
        }
        let policy = self
            .policies
            .get(skill_id)
            .ok_or_else(|| SkillCacheError::UnknownSkill(skill_id.to_string()))?;
        let now = self.clock.now();
        let slot = policy.current_slot(now);
        let entry = CacheEntry {
            skill_id: skill_id.to_string(),
            bucket_key: slot.key.clone(),
            content: content.into(),
            generated_at: now,
        };

        let mut buckets = lock_unpoisoned(&self.buckets);
        let map = buckets.entry(skill_id.to_string()).or_default();
        map.insert(slot.key, entry.clone());
        let pruned = prune_buckets(policy, map, now);
        tracing::debug!(
            skill_id = %skill_id,
            bucket = %entry.bucket_key,
            pruned,
            "skill cache entry stored"
        );
        self.store
            .save(skill_id, map)
            .map_err(|error| SkillCacheError::Persist {
                skill_id: skill_id.to_string(),
                message: format!("{error:#}"),
            })?;
        Ok(entry)
    }

    /// Enumerates the policy's bucket set, most recent first, whether or not
    /// each bucket holds data.
    pub fn list_available_buckets(&self, skill_id: &str) -> Vec<BucketAvailability> {
        let Some(policy) = self.policies.get(skill_id) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let buckets = lock_unpoisoned(&self.buckets);
        let map = buckets.get(skill_id);
        policy
            .retained_slots(now)
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                let generated_at = map
                    .and_then(|map| map.get(&slot.key))
                    .filter(|entry| slot.contains(entry.generated_at))
                    .map(|entry| entry.generated_at);
                BucketAvailability {
                    has_data: generated_at.is_some(),
                    is_current: index == 0,
                    bucket_key: slot.key,
                    starts_at: slot.starts_at,
                    generated_at,
                }
            })
            .collect()
    }

    /// Drops buckets outside the retention window; returns how many were removed.
    pub fn cleanup(&self, skill_id: &str) -> Result<usize, SkillCacheError> {
        let Some(policy) = self.policies.get(skill_id) else {
            return Ok(0);
        };
        let now = self.clock.now();
        let mut buckets = lock_unpoisoned(&self.buckets);
        let Some(map) = buckets.get_mut(skill_id) else {
            return Ok(0);
        };
        let pruned = prune_buckets(policy, map, now);
        if pruned > 0 {
            self.store
                .save(skill_id, map)
                .map_err(|error| SkillCacheError::Persist {
                    skill_id: skill_id.to_string(),
                    message: format!("{error:#}"),
                })?;
        }
        Ok(pruned)
    }

    pub fn clear(&self, skill_id: &str) -> Result<(), SkillCacheError> {
        lock_unpoisoned(&self.buckets).remove(skill_id);
        self.store
            .remove(skill_id)
            .map_err(|error| SkillCacheError::Persist {
                skill_id: skill_id.to_string(),
                message: format!("{error:#}"),
            })
    }

    pub fn clear_all(&self) -> Result<(), SkillCacheError> {
        let mut skill_ids = self.skill_ids();
        {
            let mut buckets = lock_unpoisoned(&self.buckets);
            skill_ids.extend(buckets.keys().cloned());
            buckets.clear();
        }
        skill_ids.sort();
        skill_ids.dedup();
        for skill_id in skill_ids {
            self.store
                .remove(&skill_id)
                .map_err(|error| SkillCacheError::Persist {
                    skill_id: skill_id.clone(),
                    message: format!("{error:#}"),
                })?;
        }
        Ok(())
    }

    /// Copy of the in-memory bucket map, including buckets not yet pruned.
    pub fn snapshot(&self, skill_id: &str) -> BucketMap {
        lock_unpoisoned(&self.buckets)
            .get(skill_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn prune_buckets(policy: &BucketPolicy, map: &mut BucketMap, now: DateTime<Utc>) -> usize {
    let before = map.len();
    map.retain(|key, entry| policy.retains(key, entry.generated_at, now));
    before - map.len()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use chrono_tz::Tz;
    use quill_core::ManualClock;

    use super::WindowedCache;
    use crate::bucket_policy::{default_periodic_slots, BucketPolicy};
    use crate::cache_store::{CacheStore, FileCacheStore, MemoryCacheStore};
    use crate::error::SkillCacheError;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, day, hour, minute, 0)
            .single()
            .expect("valid instant")
    }

    fn policies() -> BTreeMap<String, BucketPolicy> {
        BTreeMap::from([
            (
                "alpha".to_string(),
                BucketPolicy::frequent(3, Tz::UTC).expect("frequent"),
            ),
            (
                "digest".to_string(),
                BucketPolicy::periodic(default_periodic_slots(), Tz::UTC).expect("periodic"),
            ),
        ])
    }

    fn cache_with(store: Arc<dyn CacheStore>, clock: &ManualClock) -> WindowedCache {
        WindowedCache::new(policies(), store, Arc::new(clock.clone()))
    }

    #[test]
    fn functional_get_only_returns_current_bucket() {
        let clock = ManualClock::new(at(14, 9, 5));
        let cache = cache_with(Arc::new(MemoryCacheStore::new()), &clock);

        let entry = cache.set("alpha", "v1").expect("set");
        assert_eq!(entry.bucket_key, "09");
        assert_eq!(cache.get("alpha").map(|entry| entry.content), Some("v1".to_string()));

        clock.set(at(14, 10, 0));
        assert!(cache.get("alpha").is_none());
        assert_eq!(
            cache.get_by_bucket("alpha", "09").map(|entry| entry.content),
            Some("v1".to_string())
        );
    }

    #[test]
    fn functional_set_replaces_entry_in_same_bucket() {
        let clock = ManualClock::new(at(14, 9, 5));
        let cache = cache_with(Arc::new(MemoryCacheStore::new()), &clock);
        cache.set("alpha", "v1").expect("first");
        clock.advance(Duration::minutes(20));
        cache.set("alpha", "v2").expect("second");
        assert_eq!(cache.snapshot("alpha").len(), 1);
        assert_eq!(cache.get("alpha").map(|entry| entry.content), Some("v2".to_string()));
    }

    #[test]
    fn functional_frequent_window_keeps_only_most_recent_buckets() {
        let clock = ManualClock::new(at(14, 6, 30));
        let cache = cache_with(Arc::new(MemoryCacheStore::new()), &clock);
        // Window of 3 hours, five consecutive inserts.
        for step in 0..5 {
            cache.set("alpha", format!("run-{step}")).expect("set");
            clock.advance(Duration::hours(1));
        }
        clock.advance(Duration::hours(-1));
        let keys = cache.snapshot("alpha").into_keys().collect::<Vec<_>>();
        assert_eq!(keys, vec!["08", "09", "10"]);
        assert!(cache.get_by_bucket("alpha", "07").is_none());
    }

    #[test]
    fn functional_list_available_buckets_includes_empty_slots() {
        let clock = ManualClock::new(at(14, 13, 0));
        let cache = cache_with(Arc::new(MemoryCacheStore::new()), &clock);
        cache.set("digest", "afternoon report").expect("set");

        let buckets = cache.list_available_buckets("digest");
        let summary = buckets
            .iter()
            .map(|bucket| (bucket.bucket_key.as_str(), bucket.has_data, bucket.is_current))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("afternoon", true, true),
                ("morning", false, false),
                ("evening", false, false)
            ]
        );
        assert!(cache.list_available_buckets("unknown").is_empty());
    }

    #[test]
    fn functional_periodic_bucket_is_replaced_by_next_occurrence() {
        let clock = ManualClock::new(at(14, 7, 0));
        let cache = cache_with(Arc::new(MemoryCacheStore::new()), &clock);
        cache.set("digest", "monday morning").expect("set");

        clock.set(at(15, 5, 0));
        assert_eq!(
            cache.get_by_bucket("digest", "morning").map(|entry| entry.content),
            Some("monday morning".to_string())
        );
        clock.set(at(15, 6, 0));
        assert!(cache.get_by_bucket("digest", "morning").is_none());
        assert_eq!(cache.cleanup("digest").expect("cleanup"), 1);
    }

    #[test]
    fn integration_persistence_round_trip_drops_buckets_aged_out_during_downtime() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn CacheStore> = Arc::new(FileCacheStore::new(temp.path()));
        let clock = ManualClock::new(at(14, 8, 10));
        let before = cache_with(store.clone(), &clock);
        before.set("alpha", "eight").expect("set 08");
        clock.advance(Duration::hours(1));
        before.set("alpha", "nine").expect("set 09");
        before.set("digest", "morning").expect("set digest");
        let expected_digest = before.snapshot("digest");

        // Restart two hours later: "08" left the three hour window.
        clock.advance(Duration::hours(2));
        let after = cache_with(store.clone(), &clock);
        let report = after.load_all();
        assert_eq!(report.loaded_skills, 2);
        assert_eq!(report.pruned_buckets, 1);
        assert!(report.failed_skills.is_empty());

        let alpha = after.snapshot("alpha");
        assert_eq!(alpha.keys().collect::<Vec<_>>(), vec!["09"]);
        assert_eq!(alpha["09"], before.snapshot("alpha")["09"]);
        assert_eq!(after.snapshot("digest"), expected_digest);

        let persisted = store.load("alpha").expect("load").expect("present");
        assert_eq!(persisted.buckets.keys().collect::<Vec<_>>(), vec!["09"]);
    }

    #[test]
    fn regression_load_all_ignores_malformed_buckets_and_rewrites_file() {
        let store = Arc::new(MemoryCacheStore::new());
        store.insert_raw(
            "alpha",
            r#"{"09":{"content":"ok","generatedAt":"2026-05-14T09:01:00Z"},"10":{"bad":true}}"#,
        );
        store.insert_raw("digest", "not json");
        let clock = ManualClock::new(at(14, 9, 30));
        let cache = cache_with(store.clone(), &clock);
        let report = cache.load_all();
        assert_eq!(report.ignored_buckets, 1);
        assert_eq!(report.failed_skills, vec!["digest".to_string()]);
        assert_eq!(cache.get("alpha").map(|entry| entry.content), Some("ok".to_string()));
        assert!(!store.raw("alpha").expect("rewritten").contains("bad"));
    }

    #[test]
    fn unit_set_rejects_unknown_and_empty_skill_ids() {
        let clock = ManualClock::new(at(14, 9, 0));
        let cache = cache_with(Arc::new(MemoryCacheStore::new()), &clock);
        assert_eq!(cache.set("  ", "x"), Err(SkillCacheError::InvalidSkillId));
        assert_eq!(
            cache.set("gamma", "x"),
            Err(SkillCacheError::UnknownSkill("gamma".to_string()))
        );
        assert!(cache.get("gamma").is_none());
    }

    #[test]
    fn regression_set_and_get_agree_on_padded_skill_ids() {
        let clock = ManualClock::new(at(14, 9, 0));
        let cache = cache_with(Arc::new(MemoryCacheStore::new()), &clock);
        assert_eq!(
            cache.set(" alpha", "x"),
            Err(SkillCacheError::UnknownSkill(" alpha".to_string()))
        );
        assert!(cache.get(" alpha").is_none());
        assert!(cache.get("alpha").is_none());
    }

    #[test]
    fn functional_clear_and_clear_all_remove_memory_and_disk_state() {
        let store = Arc::new(MemoryCacheStore::new());
        let clock = ManualClock::new(at(14, 9, 0));
        let cache = cache_with(store.clone(), &clock);
        cache.set("alpha", "a").expect("alpha");
        cache.set("digest", "d").expect("digest");

        cache.clear("alpha").expect("clear");
        assert!(cache.get("alpha").is_none());
        assert!(store.raw("alpha").is_none());
        assert!(cache.get("digest").is_some());

        cache.clear_all().expect("clear all");
        assert!(cache.get("digest").is_none());
        assert!(store.raw("digest").is_none());
    }
}
