//! Calendar-day partition identifier

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one day-scoped slice of a patient's history.
///
/// Field order makes the derived `Ord` chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl PartitionKey {
    pub fn new(year: i32, month: u32, day: u32) -> Self {
        Self { year, month, day }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }

    /// Partition of an instant, using the local calendar at `offset`
    pub fn from_timestamp(timestamp: DateTime<Utc>, offset: &FixedOffset) -> Self {
        Self::from_date(timestamp.with_timezone(offset).date_naive())
    }

    /// `None` when the fields do not name a real calendar day
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }

    /// Whether `timestamp` can fall on this local day under some UTC offset.
    ///
    /// Real offsets stay within 14 hours, so the UTC date must be the key's
    /// date or one of its neighbours.
    pub fn admits(&self, timestamp: DateTime<Utc>) -> bool {
        let Some(date) = self.date() else {
            return false;
        };
        (-1..=1).contains(&(timestamp.date_naive() - date).num_days())
    }

    /// Store path of this partition for a patient (`history/{id}/{yyyy}/{mm}/{dd}`)
    pub fn node_path(&self, patient_id: &str) -> String {
        format!(
            "history/{}/{}/{:02}/{:02}",
            patient_id, self.year, self.month, self.day
        )
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl From<NaiveDate> for PartitionKey {
    fn from(date: NaiveDate) -> Self {
        Self::from_date(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_uses_local_calendar() {
        // 2024-03-07 23:30 UTC is already 2024-03-08 at UTC+2
        let ts = Utc.with_ymd_and_hms(2024, 3, 7, 23, 30, 0).unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();

        assert_eq!(PartitionKey::from_timestamp(ts, &utc), PartitionKey::new(2024, 3, 7));
        assert_eq!(PartitionKey::from_timestamp(ts, &plus_two), PartitionKey::new(2024, 3, 8));
    }

    #[test]
    fn test_keys_order_chronologically() {
        let mut keys = vec![
            PartitionKey::new(2024, 12, 1),
            PartitionKey::new(2023, 12, 31),
            PartitionKey::new(2024, 2, 29),
        ];
        keys.sort();

        assert_eq!(keys[0], PartitionKey::new(2023, 12, 31));
        assert_eq!(keys[2], PartitionKey::new(2024, 12, 1));
    }

    #[test]
    fn test_node_path_and_display() {
        let key = PartitionKey::new(2024, 3, 7);
        assert_eq!(key.to_string(), "2024-03-07");
        assert_eq!(key.node_path("p-17"), "history/p-17/2024/03/07");
        assert!(PartitionKey::new(2023, 2, 29).date().is_none());
    }

    #[test]
    fn test_admits_neighbouring_utc_days_only() {
        let key = PartitionKey::new(2024, 3, 7);

        assert!(key.admits(Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap()));
        // 2024-03-07 local at UTC+14 and UTC-12
        assert!(key.admits(Utc.with_ymd_and_hms(2024, 3, 6, 10, 0, 0).unwrap()));
        assert!(key.admits(Utc.with_ymd_and_hms(2024, 3, 8, 11, 0, 0).unwrap()));

        assert!(!key.admits(Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap()));
        assert!(!key.admits(Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap()));
        assert!(!PartitionKey::new(2024, 2, 30).admits(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
    }
}
