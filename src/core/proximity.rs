//! Nearest-neighbour queries over a position snapshot
//!
//! A linear scan over the snapshot; fine for a few thousand live sessions.
//! Larger deployments would need a spatial index (geohash buckets or an
//! R-tree) in front of this.

use serde::Serialize;
use std::collections::HashMap;

use crate::constants::EARTH_RADIUS_KM;
use crate::core::position::{Coordinates, PositionRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyEntry {
    pub id: String,
    pub coordinates: Coordinates,
    pub distance_km: f64,
}

/// Great-circle distance (haversine) in kilometres
pub fn distance_km(a: &Coordinates, b: &Coordinates) -> f64 {
    let (lat1, lat2) = (a.latitude().to_radians(), b.latitude().to_radians());
    let d_lat = lat2 - lat1;
    let d_lng = (b.longitude() - a.longitude()).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Entries within `radius_km` of `origin`, closest first, ties broken by id
pub fn nearby<'a, I>(origin: &Coordinates, radius_km: f64, points: I) -> Vec<NearbyEntry>
where
    I: IntoIterator<Item = (&'a String, &'a Coordinates)>,
{
    let mut found: Vec<NearbyEntry> = points
        .into_iter()
        .filter_map(|(id, coordinates)| {
            let distance = distance_km(origin, coordinates);
            (distance <= radius_km).then(|| NearbyEntry {
                id: id.clone(),
                coordinates: *coordinates,
                distance_km: distance,
            })
        })
        .collect();

    found.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.id.cmp(&b.id))
    });
    found
}

/// `nearby` over the registry's position snapshot
pub fn nearby_positions(
    origin: &Coordinates,
    radius_km: f64,
    snapshot: &HashMap<String, PositionRecord>,
) -> Vec<NearbyEntry> {
    nearby(
        origin,
        radius_km,
        snapshot.iter().map(|(id, record)| (id, &record.coordinates)),
    )
}
