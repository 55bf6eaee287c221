use geo::{Distance, Haversine, Point};

use crate::models::WorkSite;

/// Great-circle distance between two coordinates in meters.
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    // geo points are (x, y) = (lon, lat)
    Haversine.distance(Point::new(lon1, lat1), Point::new(lon2, lat2))
}

/// Two fences overlap when their center distance is less than the sum of
/// their radii. Active fences must never overlap.
pub fn fences_overlap(a: &WorkSite, b: &WorkSite) -> bool {
    let d = distance_m(a.latitude, a.longitude, b.latitude, b.longitude);
    d < a.radius_m + b.radius_m
}
