use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// A latitude/longitude pair stored as a `geoPointValue` field.
///
/// Values compare by latitude, then longitude.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    /// Fails with `invalid-argument` outside [-90, 90] x [-180, 180]. NaN is
    /// never in range.
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        check_degrees("latitude", latitude, 90.0)?;
        check_degrees("longitude", longitude, 180.0)?;
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

fn check_degrees(axis: &str, value: f64, bound: f64) -> FirestoreResult<()> {
    if (-bound..=bound).contains(&value) {
        Ok(())
    } else {
        Err(invalid_argument(format!(
            "GeoPoint {axis} must be within [-{bound}, {bound}], got {value}"
        )))
    }
}

impl Display for GeoPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}
