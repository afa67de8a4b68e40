//! Daily representative selection.
//!
//! For every local calendar day pick the first full set captured at or after
//! local noon. Days where every set is earlier than noon contribute nothing.

use crate::catalog::ExposureSet;
use crate::config::{ConfigValidationError, TimelapseConfig};
use crate::naming::CaptureTimestamp;
use chrono::{DateTime, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use tracing::debug;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Sets captured on one local calendar day, sorted by timestamp.
#[derive(Debug, Clone)]
pub struct DayBucket<'a> {
    pub date: NaiveDate,
    pub sets: Vec<&'a ExposureSet>,
}

/// Time-zone aware day bucketing and noon selection.
#[derive(Debug, Clone, Copy)]
pub struct DailySelector {
    tz: Tz,
}

impl DailySelector {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn from_config(config: &TimelapseConfig) -> Result<Self, ConfigValidationError> {
        Ok(Self::new(config.time_zone()?))
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    pub fn local_time(&self, timestamp: CaptureTimestamp) -> DateTime<Tz> {
        timestamp.utc().with_timezone(&self.tz)
    }

    pub fn local_day(&self, timestamp: CaptureTimestamp) -> NaiveDate {
        self.local_time(timestamp).date_naive()
    }

    /// Signed seconds between local noon and the local wall clock time.
    ///
    /// Computed on the naive local clock, so a DST shift earlier in the day
    /// does not move noon.
    pub fn seconds_since_local_noon(&self, timestamp: CaptureTimestamp) -> i64 {
        let local = self.local_time(timestamp).naive_local();
        let noon = local.date().and_time(NaiveTime::MIN) + chrono::Duration::hours(12);
        (local - noon).num_seconds()
    }

    pub fn hours_since_local_noon(&self, timestamp: CaptureTimestamp) -> f64 {
        self.seconds_since_local_noon(timestamp) as f64 / SECONDS_PER_HOUR
    }

    /// Group sets by local calendar date, both levels in ascending order.
    pub fn bucket_by_day<'a>(
        &self,
        sets: impl IntoIterator<Item = &'a ExposureSet>,
    ) -> Vec<DayBucket<'a>> {
        let mut days: BTreeMap<NaiveDate, Vec<&'a ExposureSet>> = BTreeMap::new();
        for set in sets {
            days.entry(self.local_day(set.id())).or_default().push(set);
        }
        days.into_iter()
            .map(|(date, mut sets)| {
                sets.sort_by_key(|s| s.id());
                DayBucket { date, sets }
            })
            .collect()
    }

    /// One full set per local day: the earliest at or after local noon.
    /// Output is ordered by set identifier.
    pub fn select<'a>(
        &self,
        sets: impl IntoIterator<Item = &'a ExposureSet>,
    ) -> Vec<&'a ExposureSet> {
        let buckets = self.bucket_by_day(sets.into_iter().filter(|s| s.is_full()));

        let mut selected: Vec<&'a ExposureSet> = buckets
            .iter()
            .filter_map(|bucket| {
                let chosen = bucket
                    .sets
                    .iter()
                    .copied()
                    .map(|s| (self.seconds_since_local_noon(s.id()), s))
                    .filter(|(since_noon, _)| *since_noon >= 0)
                    .min_by_key(|(since_noon, _)| *since_noon)
                    .map(|(_, s)| s);
                if chosen.is_none() {
                    debug!(date = %bucket.date, "No set at or after local noon");
                }
                chosen
            })
            .collect();

        selected.sort_by_key(|s| s.id());
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CapturedImage;
    use crate::naming::{ExposureLevel, ExposureLevels};
    use std::path::PathBuf;

    fn levels() -> ExposureLevels {
        ExposureLevels::new(&[20, 50, 100]).unwrap()
    }

    fn set(series: &str, percents: &[u32]) -> ExposureSet {
        let id = CaptureTimestamp::parse(series).unwrap();
        let images = percents.iter().map(|&p| CapturedImage {
            timestamp: id,
            level: ExposureLevel::new(p),
            path: PathBuf::from(format!("{series}-{p}.jpg")),
        });
        ExposureSet::build(id, images, &levels()).unwrap()
    }

    fn full(series: &str) -> ExposureSet {
        set(series, &[20, 50, 100])
    }

    fn jerusalem() -> DailySelector {
        DailySelector::new(chrono_tz::Asia::Jerusalem)
    }

    fn names(sets: &[&ExposureSet]) -> Vec<String> {
        sets.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn test_local_hour_in_winter() {
        let ts = CaptureTimestamp::parse("2022-12-23T10-21-18").unwrap();
        let local = jerusalem().local_time(ts);
        assert_eq!(chrono::Timelike::hour(&local), 12);
        assert_eq!(jerusalem().seconds_since_local_noon(ts), 21 * 60 + 18);
    }

    #[test]
    fn test_picks_first_set_after_noon() {
        // UTC+3 on this date: 11:00 and 13:30 local
        let sets = vec![full("2022-03-26T08-00-00"), full("2022-03-26T10-30-00")];
        let selected = jerusalem().select(&sets);
        assert_eq!(names(&selected), vec!["2022-03-26T10-30-00"]);
    }

    #[test]
    fn test_closest_to_noon_wins() {
        let sets = vec![
            full("2022-03-26T13-00-00"),
            full("2022-03-26T09-10-00"),
            full("2022-03-26T09-00-00"),
        ];
        let selected = jerusalem().select(&sets);
        assert_eq!(names(&selected), vec!["2022-03-26T09-00-00"]);
    }

    #[test]
    fn test_morning_only_day_contributes_nothing() {
        let sets = vec![full("2022-03-26T06-00-00")];
        assert!(jerusalem().select(&sets).is_empty());
    }

    #[test]
    fn test_partial_sets_are_never_selected() {
        let sets = vec![
            set("2022-03-26T09-05-00", &[20, 50]),
            full("2022-03-26T10-00-00"),
        ];
        let selected = jerusalem().select(&sets);
        assert_eq!(names(&selected), vec!["2022-03-26T10-00-00"]);
    }

    #[test]
    fn test_late_utc_evening_belongs_to_next_local_day() {
        let sets = vec![
            full("2022-03-26T22-30-00"),
            full("2022-03-27T09-30-00"),
            full("2022-03-26T12-00-00"),
        ];
        let selector = jerusalem();

        let buckets = selector.bucket_by_day(&sets);
        let dates: Vec<_> = buckets.iter().map(|b| b.date.to_string()).collect();
        assert_eq!(dates, vec!["2022-03-26", "2022-03-27"]);
        assert_eq!(names(&buckets[1].sets), vec!["2022-03-26T22-30-00", "2022-03-27T09-30-00"]);

        let selected = selector.select(&sets);
        assert_eq!(
            names(&selected),
            vec!["2022-03-26T12-00-00", "2022-03-27T09-30-00"]
        );
    }

    #[test]
    fn test_utc_selector_uses_utc_noon() {
        let selector = DailySelector::new(chrono_tz::UTC);
        let sets = vec![full("2022-03-26T11-59-59"), full("2022-03-26T12-00-00")];
        assert_eq!(names(&selector.select(&sets)), vec!["2022-03-26T12-00-00"]);
    }
}
