use crate::geo::{haversine_km, travel_minutes};
use crate::models::coordinate::GeoPoint;
use crate::models::ride::VehicleType;

/// Share of the fare paid out to the driver.
pub const DRIVER_SHARE: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FareQuote {
    pub distance_km: f64,
    pub duration_minutes: i32,
    pub fare: f64,
}

pub fn quote(pickup: &GeoPoint, destination: &GeoPoint, vehicle: VehicleType) -> FareQuote {
    let distance_km = haversine_km(pickup, destination);

    FareQuote {
        distance_km,
        duration_minutes: travel_minutes(distance_km),
        fare: fare_for(distance_km, vehicle),
    }
}

pub fn fare_for(distance_km: f64, vehicle: VehicleType) -> f64 {
    let (base, per_km) = tariff(vehicle);
    round_cents(base + distance_km.max(0.0) * per_km)
}

pub fn driver_earnings(fare: f64) -> f64 {
    round_cents(fare * DRIVER_SHARE)
}

fn tariff(vehicle: VehicleType) -> (f64, f64) {
    match vehicle {
        VehicleType::Economy => (50.0, 15.0),
        VehicleType::Premium => (100.0, 25.0),
        VehicleType::Xl => (80.0, 20.0),
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::{driver_earnings, fare_for, quote};
    use crate::models::coordinate::GeoPoint;
    use crate::models::ride::VehicleType;

    #[test]
    fn premium_costs_more_than_economy_for_same_trip() {
        let economy = fare_for(8.0, VehicleType::Economy);
        let premium = fare_for(8.0, VehicleType::Premium);
        let xl = fare_for(8.0, VehicleType::Xl);

        assert_eq!(economy, 170.0);
        assert_eq!(premium, 300.0);
        assert_eq!(xl, 240.0);
    }

    #[test]
    fn fare_is_rounded_to_cents() {
        let fare = fare_for(1.23456, VehicleType::Economy);
        assert_eq!(fare, 68.52);
    }

    #[test]
    fn driver_keeps_eighty_percent() {
        assert_eq!(driver_earnings(170.0), 136.0);
    }

    #[test]
    fn quote_combines_distance_duration_and_fare() {
        let pickup = GeoPoint {
            lat: 55.7558,
            lng: 37.6173,
        };
        let destination = GeoPoint {
            lat: 55.7858,
            lng: 37.6173,
        };

        let q = quote(&pickup, &destination, VehicleType::Economy);
        assert!((q.distance_km - 3.34).abs() < 0.05);
        assert_eq!(q.duration_minutes, 6);
        assert!(q.fare > 50.0);
    }
}
