//! Wall-clock bucketing rules for skill results.
//!
//! `Frequent` skills get one bucket per hour and keep a sliding window of the
//! most recent hours. `Periodic` skills get a fixed set of labels recurring
//! daily and keep only the latest occurrence of each label.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::SkillCacheError;

pub const MAX_FREQUENT_WINDOW_HOURS: u32 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One recurring daily label of a periodic skill, starting at `start_hour` local time.
pub struct PeriodicSlot {
    pub label: String,
    pub start_hour: u32,
}

impl PeriodicSlot {
    pub fn new(label: impl Into<String>, start_hour: u32) -> Self {
        Self {
            label: label.into(),
            start_hour,
        }
    }
}

pub fn default_periodic_slots() -> Vec<PeriodicSlot> {
    vec![
        PeriodicSlot::new("morning", 6),
        PeriodicSlot::new("afternoon", 12),
        PeriodicSlot::new("evening", 18),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Enumerates supported `SkillClass` values.
pub enum SkillClass {
    Frequent {
        window_hours: u32,
    },
    Periodic {
        #[serde(default = "default_periodic_slots")]
        slots: Vec<PeriodicSlot>,
    },
}

impl SkillClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frequent { .. } => "frequent",
            Self::Periodic { .. } => "periodic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// One occurrence of a bucket: its label and the half-open interval it covers.
pub struct BucketSlot {
    pub key: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl BucketSlot {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.starts_at <= instant && instant < self.ends_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPolicy {
    class: SkillClass,
    timezone: Tz,
}

impl BucketPolicy {
    pub fn new(class: SkillClass, timezone: Tz) -> Result<Self, SkillCacheError> {
        validate_skill_class(&class)?;
        let class = match class {
            SkillClass::Periodic { mut slots } => {
                slots.sort_by_key(|slot| slot.start_hour);
                SkillClass::Periodic { slots }
            }
            frequent => frequent,
        };
        Ok(Self { class, timezone })
    }

    pub fn frequent(window_hours: u32, timezone: Tz) -> Result<Self, SkillCacheError> {
        Self::new(SkillClass::Frequent { window_hours }, timezone)
    }

    pub fn periodic(slots: Vec<PeriodicSlot>, timezone: Tz) -> Result<Self, SkillCacheError> {
        Self::new(SkillClass::Periodic { slots }, timezone)
    }

    pub fn class(&self) -> &SkillClass {
        &self.class
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Returns the bucket that `now` falls into.
    pub fn current_slot(&self, now: DateTime<Utc>) -> BucketSlot {
        match &self.class {
            SkillClass::Frequent { .. } => self.hourly_slot(self.hour_start(now)),
            SkillClass::Periodic { slots } => self
                .periodic_occurrences(slots, now)
                .into_iter()
                .next()
                .unwrap_or_else(|| self.hourly_slot(self.hour_start(now))),
        }
    }

    /// Returns every bucket the policy retains at `now`, most recent first.
    /// The first element is always the current bucket.
    pub fn retained_slots(&self, now: DateTime<Utc>) -> Vec<BucketSlot> {
        match &self.class {
            SkillClass::Frequent { window_hours } => {
                let current_start = self.hour_start(now);
                let mut seen = BTreeSet::new();
                (0..i64::from(*window_hours))
                    .map(|offset| self.hourly_slot(current_start - Duration::hours(offset)))
                    .filter(|slot| seen.insert(slot.key.clone()))
                    .collect()
            }
            SkillClass::Periodic { slots } => self.periodic_occurrences(slots, now),
        }
    }

    /// Returns the retained occurrence labelled `key`, if the policy knows the label.
    pub fn retained_slot(&self, key: &str, now: DateTime<Utc>) -> Option<BucketSlot> {
        self.retained_slots(now)
            .into_iter()
            .find(|slot| slot.key == key)
    }

    /// True when an entry stored under `key` at `generated_at` is still inside
    /// the retention window at `now`.
    pub fn retains(&self, key: &str, generated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.retained_slot(key, now)
            .is_some_and(|slot| slot.contains(generated_at))
    }

    fn hour_start(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let local = instant.with_timezone(&self.timezone);
        let into_hour = Duration::minutes(i64::from(local.minute()))
            + Duration::seconds(i64::from(local.second()))
            + Duration::nanoseconds(i64::from(local.nanosecond()));
        instant - into_hour
    }

    fn hourly_slot(&self, starts_at: DateTime<Utc>) -> BucketSlot {
        BucketSlot {
            key: format!("{:02}", starts_at.with_timezone(&self.timezone).hour()),
            starts_at,
            ends_at: starts_at + Duration::hours(1),
        }
    }

    fn periodic_occurrences(&self, slots: &[PeriodicSlot], now: DateTime<Utc>) -> Vec<BucketSlot> {
        let today = now.with_timezone(&self.timezone).date_naive();
        let mut starts = Vec::with_capacity(slots.len() * 3);
        for day_offset in -1..=1_i64 {
            let Some(day) = today.checked_add_signed(Duration::days(day_offset)) else {
                continue;
            };
            for slot in slots {
                starts.push((
                    local_hour_start(self.timezone, day, slot.start_hour),
                    slot.label.as_str(),
                ));
            }
        }
        starts.sort_by_key(|(start, _)| *start);

        let mut seen = BTreeSet::new();
        let mut occurrences = Vec::with_capacity(slots.len());
        for (index, (starts_at, label)) in starts.iter().enumerate().rev() {
            if *starts_at > now || !seen.insert(*label) {
                continue;
            }
            let ends_at = starts
                .get(index + 1)
                .map(|(next, _)| *next)
                .unwrap_or_else(|| *starts_at + Duration::days(1));
            occurrences.push(BucketSlot {
                key: (*label).to_string(),
                starts_at: *starts_at,
                ends_at,
            });
        }
        occurrences
    }
}

fn local_hour_start(timezone: Tz, day: NaiveDate, hour: u32) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default());
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(value) => value.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // Inside a DST gap the slot opens at the first valid local instant.
        LocalResult::None => timezone
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|value| value.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

fn validate_skill_class(class: &SkillClass) -> Result<(), SkillCacheError> {
    match class {
        SkillClass::Frequent { window_hours } => {
            if *window_hours == 0 || *window_hours > MAX_FREQUENT_WINDOW_HOURS {
                return Err(SkillCacheError::InvalidPolicy(format!(
                    "frequent window_hours must be in 1..={MAX_FREQUENT_WINDOW_HOURS}, got {window_hours}"
                )));
            }
        }
        SkillClass::Periodic { slots } => {
            if slots.is_empty() {
                return Err(SkillCacheError::InvalidPolicy(
                    "periodic class requires at least one slot".to_string(),
                ));
            }
            let mut labels = BTreeSet::new();
            let mut hours = BTreeSet::new();
            for slot in slots {
                let label = slot.label.trim();
                if label.is_empty() {
                    return Err(SkillCacheError::InvalidPolicy(
                        "periodic slot label must be non-empty".to_string(),
                    ));
                }
                if slot.start_hour > 23 {
                    return Err(SkillCacheError::InvalidPolicy(format!(
                        "periodic slot '{label}' start_hour must be in 0..=23"
                    )));
                }
                if !labels.insert(label.to_string()) {
                    return Err(SkillCacheError::InvalidPolicy(format!(
                        "duplicate periodic slot label '{label}'"
                    )));
                }
                if !hours.insert(slot.start_hour) {
                    return Err(SkillCacheError::InvalidPolicy(format!(
                        "duplicate periodic slot start_hour {}",
                        slot.start_hour
                    )));
                }
            }
        }
    }
    Ok(())
}
