use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};
use uuid::Uuid;

use crate::bus::Publisher;
use crate::error::AppError;
use crate::geo;
use crate::models::coordinate::{Coordinate, EntityType, GeoPoint, LocationHistory};
use crate::models::events::{Event, LocationBroadcast};
use crate::models::frames::LocationUpdateFrame;
use crate::observability::metrics::Metrics;
use crate::store::LocationRepository;

#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub point: GeoPoint,
    pub accuracy_meters: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub heading_degrees: Option<f64>,
    pub ride_id: Option<Uuid>,
}

impl From<LocationUpdateFrame> for LocationUpdate {
    fn from(frame: LocationUpdateFrame) -> Self {
        Self {
            point: GeoPoint {
                lat: frame.latitude,
                lng: frame.longitude,
            },
            accuracy_meters: frame.accuracy_meters,
            speed_kmh: frame.speed_kmh,
            heading_degrees: frame.heading_degrees,
            ride_id: frame.ride_id,
        }
    }
}

/// Tracked drivers idle for a full interval are forgotten this often.
pub const PRUNE_EVERY: Duration = Duration::from_secs(60);

type DriverLimiter<C> =
    RateLimiter<Uuid, DashMapStateStore<Uuid>, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Ingests driver positions: per-driver rate limit, atomic swap of the current
/// row, then best-effort history and fan-out.
pub struct LocationService<C: Clock = DefaultClock> {
    locations: Arc<dyn LocationRepository>,
    publisher: Publisher,
    metrics: Metrics,
    limiter: DriverLimiter<C>,
    clock: C,
}

impl LocationService {
    pub fn new(
        locations: Arc<dyn LocationRepository>,
        publisher: Publisher,
        metrics: Metrics,
        min_interval: Duration,
    ) -> Self {
        Self::with_clock(locations, publisher, metrics, min_interval, DefaultClock::default())
    }
}

impl<C: Clock> LocationService<C> {
    /// One accepted update per driver every `min_interval`, no burst.
    pub fn with_clock(
        locations: Arc<dyn LocationRepository>,
        publisher: Publisher,
        metrics: Metrics,
        min_interval: Duration,
        clock: C,
    ) -> Self {
        let quota = Quota::with_period(min_interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
            .allow_burst(NonZeroU32::MIN);

        Self {
            locations,
            publisher,
            metrics,
            limiter: RateLimiter::dashmap_with_clock(quota, &clock),
            clock,
        }
    }

    pub async fn update(
        &self,
        driver_id: Uuid,
        update: LocationUpdate,
    ) -> Result<Coordinate, AppError> {
        geo::validate(&update.point)?;

        if let Err(not_until) = self.limiter.check_key(&driver_id) {
            self.count("rate_limited");
            let wait = not_until.wait_time_from(self.clock.now());
            return Err(AppError::RateLimited(format!(
                "location update too frequent, retry in {}ms",
                wait.as_millis()
            )));
        }

        let now = Utc::now();
        let coordinate = Coordinate::current(driver_id, EntityType::Driver, update.point, "", now);

        if let Err(err) = self.locations.replace_current(&coordinate).await {
            self.count("failed");
            return Err(err);
        }

        let history = LocationHistory {
            id: Uuid::new_v4(),
            coordinate_id: coordinate.id,
            driver_id,
            latitude: update.point.lat,
            longitude: update.point.lng,
            accuracy_meters: update.accuracy_meters,
            speed_kmh: update.speed_kmh,
            heading_degrees: update.heading_degrees,
            ride_id: update.ride_id,
            recorded_at: now,
        };
        if let Err(err) = self.locations.append_history(&history).await {
            error!(driver_id = %driver_id, error = %err, "failed to append location history");
        }

        let broadcast = Event::LocationUpdated(LocationBroadcast {
            driver_id,
            ride_id: update.ride_id,
            location: update.point,
            speed_kmh: update.speed_kmh.unwrap_or_default(),
            heading_degrees: update.heading_degrees.unwrap_or_default(),
            timestamp: now,
        });
        if let Err(err) = self.publisher.publish(&broadcast).await {
            error!(driver_id = %driver_id, error = %err, "failed to fan out location update");
        }

        self.count("accepted");
        debug!(
            driver_id = %driver_id,
            lat = update.point.lat,
            lng = update.point.lng,
            "location updated"
        );
        Ok(coordinate)
    }

    /// `Ok(None)` is "no location yet", distinct from a storage failure.
    pub async fn current(&self, driver_id: Uuid) -> Result<Option<Coordinate>, AppError> {
        self.locations.current(driver_id, EntityType::Driver).await
    }

    /// Drops limiter state for drivers whose last update is a full interval
    /// old and returns how many drivers are still tracked.
    pub fn prune(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        self.limiter.len()
    }

    /// Calls [`prune`](Self::prune) every `every` until `shutdown` flips.
    pub async fn run_pruner(&self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let tracked = self.prune();
                    debug!(tracked, "location limiter pruned");
                }
            }
        }
    }

    fn count(&self, outcome: &str) {
        self.metrics
            .location_updates_total
            .with_label_values(&[outcome])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use governor::clock::FakeRelativeClock;
    use uuid::Uuid;

    use super::{LocationService, LocationUpdate};
    use crate::bus::memory::InMemoryBus;
    use crate::bus::{declare_topology, MessageBus, Publisher};
    use crate::error::AppError;
    use crate::models::coordinate::{Coordinate, EntityType, GeoPoint, LocationHistory};
    use crate::models::events::LOCATION_FANOUT;
    use crate::observability::metrics::Metrics;
    use crate::store::memory::MemoryStore;
    use crate::store::LocationRepository;

    fn update(lat: f64, lng: f64) -> LocationUpdate {
        LocationUpdate {
            point: GeoPoint { lat, lng },
            accuracy_meters: Some(5.0),
            speed_kmh: Some(40.0),
            heading_degrees: Some(180.0),
            ride_id: None,
        }
    }

    async fn service_with_clock(
        locations: Arc<dyn LocationRepository>,
        clock: FakeRelativeClock,
    ) -> (LocationService<FakeRelativeClock>, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new(10));
        declare_topology(bus.as_ref()).await.unwrap();
        bus.declare_queue("test_fanout").await.unwrap();
        bus.bind("test_fanout", LOCATION_FANOUT, "").await.unwrap();

        let publisher = Publisher::new(bus.clone(), Duration::from_secs(5));
        let service = LocationService::with_clock(
            locations,
            publisher,
            Metrics::new(),
            Duration::from_secs(3),
            clock,
        );
        (service, bus)
    }

    async fn service(
        locations: Arc<dyn LocationRepository>,
    ) -> (LocationService<FakeRelativeClock>, Arc<InMemoryBus>) {
        service_with_clock(locations, FakeRelativeClock::default()).await
    }

    #[tokio::test]
    async fn accepted_update_writes_current_history_and_one_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let (service, bus) = service(store.clone()).await;
        let driver_id = Uuid::new_v4();

        let coordinate = service
            .update(driver_id, update(55.7558, 37.6173))
            .await
            .unwrap();

        let rows = store.coordinates_of(driver_id, EntityType::Driver);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_current);
        assert_eq!(store.history_of(driver_id).len(), 1);
        assert_eq!(store.history_of(driver_id)[0].coordinate_id, coordinate.id);

        let mut fanout = bus.consume("test_fanout").await.unwrap();
        fanout.next().await.unwrap().ack();
        let more = tokio::time::timeout(Duration::from_millis(50), fanout.next()).await;
        assert!(more.is_err());
    }

    #[tokio::test]
    async fn second_update_inside_window_is_rate_limited() {
        let store = Arc::new(MemoryStore::new());
        let clock = FakeRelativeClock::default();
        let (service, _bus) = service_with_clock(store.clone(), clock.clone()).await;
        let driver_id = Uuid::new_v4();

        service.update(driver_id, update(55.75, 37.61)).await.unwrap();
        clock.advance(Duration::from_secs(1));

        let err = service
            .update(driver_id, update(55.76, 37.61))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimited(_)));
        assert!(err.to_string().contains("retry in 2000ms"));
        assert_eq!(store.coordinates_of(driver_id, EntityType::Driver).len(), 1);

        clock.advance(Duration::from_secs(2));
        service.update(driver_id, update(55.76, 37.61)).await.unwrap();

        let rows = store.coordinates_of(driver_id, EntityType::Driver);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|c| c.is_current).count(), 1);
    }

    #[tokio::test]
    async fn other_drivers_are_not_limited() {
        let store = Arc::new(MemoryStore::new());
        let (service, _bus) = service(store).await;

        service.update(Uuid::new_v4(), update(55.75, 37.61)).await.unwrap();
        service.update(Uuid::new_v4(), update(55.75, 37.61)).await.unwrap();
    }

    #[tokio::test]
    async fn idle_drivers_are_pruned_from_the_limiter() {
        let store = Arc::new(MemoryStore::new());
        let clock = FakeRelativeClock::default();
        let (service, _bus) = service_with_clock(store, clock.clone()).await;

        for _ in 0..5 {
            service.update(Uuid::new_v4(), update(55.75, 37.61)).await.unwrap();
        }
        assert_eq!(service.prune(), 5);

        clock.advance(Duration::from_secs(3));
        let active = Uuid::new_v4();
        service.update(active, update(55.75, 37.61)).await.unwrap();
        assert_eq!(service.prune(), 1);

        let err = service
            .update(active, update(55.75, 37.61))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimited(_)));
    }

    #[tokio::test]
    async fn invalid_coordinates_are_rejected_before_rate_limit() {
        let store = Arc::new(MemoryStore::new());
        let (service, _bus) = service(store).await;
        let driver_id = Uuid::new_v4();

        let err = service
            .update(driver_id, update(123.0, 37.61))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        service.update(driver_id, update(55.75, 37.61)).await.unwrap();
    }

    #[tokio::test]
    async fn no_location_yet_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let (service, _bus) = service(store).await;

        assert!(service.current(Uuid::new_v4()).await.unwrap().is_none());
    }

    struct DownStore;

    #[async_trait]
    impl LocationRepository for DownStore {
        async fn replace_current(&self, _coordinate: &Coordinate) -> Result<(), AppError> {
            Err(AppError::Unavailable("db down".into()))
        }

        async fn current(
            &self,
            _entity_id: Uuid,
            _entity_type: EntityType,
        ) -> Result<Option<Coordinate>, AppError> {
            Err(AppError::Unavailable("db down".into()))
        }

        async fn insert_coordinate(&self, _coordinate: &Coordinate) -> Result<(), AppError> {
            Err(AppError::Unavailable("db down".into()))
        }

        async fn find_coordinate(&self, _id: Uuid) -> Result<Option<Coordinate>, AppError> {
            Err(AppError::Unavailable("db down".into()))
        }

        async fn append_history(&self, _entry: &LocationHistory) -> Result<(), AppError> {
            Err(AppError::Unavailable("db down".into()))
        }
    }

    #[tokio::test]
    async fn failed_write_is_surfaced_and_still_counts_against_the_limit() {
        let (service, _bus) = service(Arc::new(DownStore)).await;
        let driver_id = Uuid::new_v4();

        let first = service.update(driver_id, update(55.75, 37.61)).await;
        assert!(matches!(first, Err(AppError::Unavailable(_))));

        let second = service.update(driver_id, update(55.75, 37.61)).await;
        assert!(matches!(second, Err(AppError::RateLimited(_))));
        assert!(matches!(
            service.current(driver_id).await,
            Err(AppError::Unavailable(_))
        ));
    }
}
