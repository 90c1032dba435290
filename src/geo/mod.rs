use crate::error::AppError;
use crate::models::coordinate::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;
const CITY_SPEED_KMH: f64 = 40.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

pub fn validate(point: &GeoPoint) -> Result<(), AppError> {
    if !point.lat.is_finite() || !(-90.0..=90.0).contains(&point.lat) {
        return Err(AppError::BadRequest(format!(
            "invalid coordinates: latitude {} must be between -90 and 90",
            point.lat
        )));
    }
    if !point.lng.is_finite() || !(-180.0..=180.0).contains(&point.lng) {
        return Err(AppError::BadRequest(format!(
            "invalid coordinates: longitude {} must be between -180 and 180",
            point.lng
        )));
    }
    Ok(())
}

/// Minutes needed to cover `distance_km` at average city speed, rounded up.
pub fn travel_minutes(distance_km: f64) -> i32 {
    ((distance_km.max(0.0) / CITY_SPEED_KMH) * 60.0).ceil() as i32
}

#[cfg(test)]
mod tests {
    use super::{haversine_km, travel_minutes, validate};
    use crate::models::coordinate::GeoPoint;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 55.7558,
            lng: 37.6173,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint {
            lat: 51.5074,
            lng: -0.1278,
        };
        let paris = GeoPoint {
            lat: 48.8566,
            lng: 2.3522,
        };
        let distance = haversine_km(&london, &paris);
        assert!((distance - 343.0).abs() < 5.0);
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        assert!(validate(&GeoPoint { lat: 91.0, lng: 0.0 }).is_err());
        assert!(validate(&GeoPoint { lat: 0.0, lng: -180.5 }).is_err());
        assert!(validate(&GeoPoint { lat: f64::NAN, lng: 0.0 }).is_err());
        assert!(validate(&GeoPoint { lat: -90.0, lng: 180.0 }).is_ok());
    }

    #[test]
    fn travel_time_rounds_up() {
        assert_eq!(travel_minutes(0.0), 0);
        assert_eq!(travel_minutes(10.0), 15);
        assert_eq!(travel_minutes(10.1), 16);
    }
}
