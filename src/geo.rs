//! Great-circle helpers for the `crow()` predicate.

use geo::{HaversineDistance, Point};

/// Mean earth radius in kilometres, the same radius `geo` uses.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Haversine distance between two lat/lon pairs, in kilometres.
pub fn crow_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let a = Point::new(lon1, lat1);
    let b = Point::new(lon2, lat2);
    a.haversine_distance(&b) / 1000.0
}

/// Lat/lon window that contains every point within some distance of a centre.
/// Longitude is one or two intervals; two when the window crosses the antimeridian.
#[derive(Clone, Debug, PartialEq)]
pub struct GeoBox {
    pub lat: (f64, f64),
    pub lon: Vec<(f64, f64)>,
}

impl GeoBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.lat.0
            && lat <= self.lat.1
            && self.lon.iter().any(|(lo, hi)| lon >= *lo && lon <= *hi)
    }
}

const SLACK: f64 = 1e-9;

pub fn bounding_box(lat: f64, lon: f64, km: f64) -> GeoBox {
    let angular = km.max(0.0) / EARTH_RADIUS_KM;
    let dlat = angular.to_degrees() + SLACK;
    let lat_lo = (lat - dlat).max(-90.0);
    let lat_hi = (lat + dlat).min(90.0);

    // a pole inside the circle means every longitude is reachable
    if lat - dlat <= -90.0 || lat + dlat >= 90.0 {
        return GeoBox { lat: (lat_lo, lat_hi), lon: vec![(-180.0, 180.0)] };
    }
    let ratio = angular.sin() / lat.to_radians().cos();
    if angular >= std::f64::consts::FRAC_PI_2 || ratio >= 1.0 {
        return GeoBox { lat: (lat_lo, lat_hi), lon: vec![(-180.0, 180.0)] };
    }
    let dlon = ratio.asin().to_degrees() + SLACK;
    let (lo, hi) = (lon - dlon, lon + dlon);
    let lon = if lo < -180.0 {
        vec![(lo + 360.0, 180.0), (-180.0, hi)]
    } else if hi > 180.0 {
        vec![(lo, 180.0), (-180.0, hi - 360.0)]
    } else {
        vec![(lo, hi)]
    };
    GeoBox { lat: (lat_lo, lat_hi), lon }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_crow_known_distance() {
        // Jakarta to Bandung, about 115 km
        let d = crow_km(-6.2088, 106.8456, -6.9175, 107.6191);
        assert!((d - 115.0).abs() < 10.0, "got {d}");
        assert_eq!(crow_km(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    #[test]
    fn test_box_contains_circle() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let (clat, clon) = (rng.gen_range(-89.0..89.0), rng.gen_range(-180.0..180.0));
            let km = rng.gen_range(1.0..3000.0);
            let bx = bounding_box(clat, clon, km);
            for _ in 0..200 {
                let (lat, lon) = (rng.gen_range(-90.0..90.0), rng.gen_range(-180.0..180.0));
                if crow_km(clat, clon, lat, lon) < km {
                    assert!(bx.contains(lat, lon), "({lat},{lon}) outside box of ({clat},{clon}) r={km}");
                }
            }
        }
    }

    #[test]
    fn test_antimeridian_split() {
        let bx = bounding_box(0.0, 179.5, 200.0);
        assert_eq!(bx.lon.len(), 2);
        assert!(bx.contains(0.0, -179.5));
        let polar = bounding_box(89.5, 0.0, 100.0);
        assert_eq!(polar.lon, vec![(-180.0, 180.0)]);
    }
}
