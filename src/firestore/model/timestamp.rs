use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// A point in time with nanosecond precision.
///
/// Also used as the snapshot version of documents and targets, where
/// [`Timestamp::min`] stands for "no version".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Default for Timestamp {
    /// No version: the same as [`Timestamp::min`].
    fn default() -> Self {
        Self::min()
    }
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    pub fn now() -> Self {
        let now = Utc::now();
        Self::new(now.timestamp(), now.timestamp_subsec_nanos() as i32)
    }

    pub fn min() -> Self {
        Self { seconds: 0, nanos: 0 }
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(millis.div_euclid(1000), (millis.rem_euclid(1000) * 1_000_000) as i32)
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1000 + i64::from(self.nanos / 1_000_000)
    }

    pub fn to_rfc3339(&self) -> String {
        Utc.timestamp_opt(self.seconds, self.nanos as u32)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn parse_rfc3339(value: &str) -> FirestoreResult<Self> {
        let datetime = DateTime::parse_from_rfc3339(value)
            .map_err(|err| invalid_argument(format!("Invalid timestamp '{value}': {err}")))?;
        let datetime_utc = datetime.with_timezone(&Utc);
        Ok(Timestamp::new(
            datetime_utc.timestamp(),
            datetime_utc.timestamp_subsec_nanos() as i32,
        ))
    }

    fn normalize(&mut self) {
        let extra_seconds = self.nanos.div_euclid(1_000_000_000);
        self.seconds += extra_seconds as i64;
        self.nanos = self.nanos.rem_euclid(1_000_000_000);
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.seconds.cmp(&other.seconds) {
            Ordering::Equal => self.nanos.cmp(&other.nanos),
            ordering => ordering,
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}
