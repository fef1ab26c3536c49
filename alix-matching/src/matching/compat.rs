use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

/// What a user will accept in a peer. Empty filters accept anyone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct MatchFilters {
    pub gender: Option<Gender>,
    #[validate(range(min = 0.1, max = 20000.0))]
    pub max_distance_km: Option<f64>,
}

/// The matchable facts about a user, supplied with each request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Profile {
    pub gender: Option<Gender>,
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: Option<f64>,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: Option<f64>,
}

/// One-sided check: does `peer` pass `filters`?
///
/// A gender filter requires the peer to have declared that gender.
/// A distance cap only applies when both sides have coordinates.
fn accepts(filters: &MatchFilters, own: &Profile, peer: &Profile) -> bool {
    if let Some(wanted) = filters.gender {
        if peer.gender != Some(wanted) {
            return false;
        }
    }

    if let Some(cap_km) = filters.max_distance_km {
        if let (Some(lat1), Some(lng1), Some(lat2), Some(lng2)) =
            (own.latitude, own.longitude, peer.latitude, peer.longitude)
        {
            if haversine_km(lat1, lng1, lat2, lng2) > cap_km {
                return false;
            }
        }
    }

    true
}

/// Mutual acceptance: both users' filters must pass against the other's profile.
pub fn compatible(
    a_filters: &MatchFilters,
    a_profile: &Profile,
    b_filters: &MatchFilters,
    b_profile: &Profile,
) -> bool {
    accepts(a_filters, a_profile, b_profile) && accepts(b_filters, b_profile, a_profile)
}

/// Haversine distance in km between two lat/lng points.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const R: f64 = 6371.0; // Earth radius in km
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    R * c
}
