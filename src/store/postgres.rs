use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    AssignOutcome, DriverRepository, LocationRepository, NearbyDriver, NearbyQuery, RideRepository,
};
use crate::error::AppError;
use crate::models::coordinate::{Coordinate, EntityType, GeoPoint, LocationHistory, TripEstimate};
use crate::models::driver::{Driver, DriverSession, DriverStatus, VehicleInfo};
use crate::models::ride::{Ride, RideStatus, VehicleType};

/// Postgres-backed store. The schema lives in `migrations/`; money and
/// distance columns are numeric and read back as `float8`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

const RIDE_COLUMNS: &str = r#"
    id, ride_number, passenger_id, driver_id, vehicle_type, status, priority,
    requested_at, matched_at, arrived_at, started_at, completed_at, cancelled_at,
    cancellation_reason, estimated_fare::float8 AS estimated_fare,
    final_fare::float8 AS final_fare, pickup_coordinate_id, destination_coordinate_id,
    created_at, updated_at
"#;

const DRIVER_COLUMNS: &str = r#"
    d.id, COALESCE(u.email, '') AS name, d.vehicle_type, d.vehicle_attrs, d.status,
    d.is_verified, d.rating::float8 AS rating, d.total_rides::int8 AS total_rides,
    d.total_earnings::float8 AS total_earnings, d.created_at, d.updated_at
"#;

const SESSION_COLUMNS: &str = r#"
    id, driver_id, started_at, ended_at, total_rides::int8 AS total_rides,
    total_earnings::float8 AS total_earnings
"#;

const COORDINATE_COLUMNS: &str = r#"
    id, entity_id, entity_type, address, latitude::float8 AS latitude,
    longitude::float8 AS longitude, fare_amount::float8 AS fare_amount,
    distance_km::float8 AS distance_km, duration_minutes, is_current, created_at, updated_at
"#;

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies pending migrations. Safe to run from several instances at once.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| AppError::Internal(format!("migration failed: {err}")))?;
        info!("database migrations applied");
        Ok(())
    }

    async fn ride_in(
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
    ) -> Result<Option<Ride>, AppError> {
        let row = sqlx::query_as::<_, RideRow>(&format!("SELECT {RIDE_COLUMNS} FROM rides WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Ride::try_from).transpose()
    }
}

#[async_trait]
impl RideRepository for PgStore {
    async fn insert_ride(&self, ride: &Ride) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO rides (
                id, ride_number, passenger_id, driver_id, vehicle_type, status, priority,
                requested_at, matched_at, arrived_at, started_at, completed_at, cancelled_at,
                cancellation_reason, estimated_fare, final_fare,
                pickup_coordinate_id, destination_coordinate_id, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
            )
            "#,
        )
        .bind(ride.id)
        .bind(&ride.ride_number)
        .bind(ride.passenger_id)
        .bind(ride.driver_id)
        .bind(ride.vehicle_type.as_str())
        .bind(ride.status.as_str())
        .bind(ride.priority)
        .bind(ride.requested_at)
        .bind(ride.matched_at)
        .bind(ride.arrived_at)
        .bind(ride.started_at)
        .bind(ride.completed_at)
        .bind(ride.cancelled_at)
        .bind(&ride.cancellation_reason)
        .bind(ride.estimated_fare)
        .bind(ride.final_fare)
        .bind(ride.pickup_coordinate_id)
        .bind(ride.destination_coordinate_id)
        .bind(ride.created_at)
        .bind(ride.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_ride(&self, id: Uuid) -> Result<Option<Ride>, AppError> {
        let row = sqlx::query_as::<_, RideRow>(&format!("SELECT {RIDE_COLUMNS} FROM rides WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Ride::try_from).transpose()
    }

    async fn assign_driver(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AssignOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        // Concurrent acceptors queue on the ride row; once the winner commits
        // the others re-evaluate the predicate and match nothing.
        let matched = sqlx::query_as::<_, RideRow>(&format!(
            r#"
            UPDATE rides
            SET driver_id = $2, status = 'MATCHED', matched_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'REQUESTED' AND driver_id IS NULL
            RETURNING {RIDE_COLUMNS}
            "#
        ))
        .bind(ride_id)
        .bind(driver_id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(matched) = matched else {
            let exists = Self::ride_in(&mut tx, ride_id).await?.is_some();
            tx.rollback().await?;
            return Ok(if exists {
                AssignOutcome::AlreadyTaken
            } else {
                AssignOutcome::RideNotFound
            });
        };

        let claimed = sqlx::query(
            r#"
            UPDATE drivers
            SET status = 'EN_ROUTE', updated_at = $2
            WHERE id = $1 AND status = 'AVAILABLE' AND is_verified = true
            "#,
        )
        .bind(driver_id)
        .bind(at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(AssignOutcome::DriverUnavailable);
        }

        tx.commit().await?;
        Ok(AssignOutcome::Assigned(Ride::try_from(matched)?))
    }

    async fn begin_trip(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<Ride>, AppError> {
        let mut tx = self.pool.begin().await?;

        let started = sqlx::query_as::<_, RideRow>(&format!(
            r#"
            UPDATE rides
            SET status = 'IN_PROGRESS', started_at = $3, updated_at = $3
            WHERE id = $1 AND driver_id = $2 AND status = 'MATCHED'
            RETURNING {RIDE_COLUMNS}
            "#
        ))
        .bind(ride_id)
        .bind(driver_id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(started) = started else {
            tx.rollback().await?;
            return Ok(None);
        };

        let busy = sqlx::query(
            r#"
            UPDATE drivers
            SET status = 'BUSY', updated_at = $2
            WHERE id = $1 AND status IN ('AVAILABLE', 'EN_ROUTE')
            "#,
        )
        .bind(driver_id)
        .bind(at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if busy == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ride::try_from(started).map(Some)
    }

    async fn finish_trip(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        final_fare: f64,
        driver_earnings: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<Ride>, AppError> {
        let mut tx = self.pool.begin().await?;

        let completed = sqlx::query_as::<_, RideRow>(&format!(
            r#"
            UPDATE rides
            SET status = 'COMPLETED', final_fare = $3, completed_at = $4, updated_at = $4
            WHERE id = $1 AND driver_id = $2 AND status = 'IN_PROGRESS'
            RETURNING {RIDE_COLUMNS}
            "#
        ))
        .bind(ride_id)
        .bind(driver_id)
        .bind(final_fare)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(completed) = completed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let released = sqlx::query(
            r#"
            UPDATE drivers
            SET status = 'AVAILABLE',
                total_rides = total_rides + 1,
                total_earnings = total_earnings + $2,
                updated_at = $3
            WHERE id = $1 AND status = 'BUSY'
            "#,
        )
        .bind(driver_id)
        .bind(driver_earnings)
        .bind(at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if released == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let credited = sqlx::query(
            r#"
            UPDATE driver_sessions
            SET total_rides = total_rides + 1, total_earnings = total_earnings + $2
            WHERE driver_id = $1 AND ended_at IS NULL
            "#,
        )
        .bind(driver_id)
        .bind(driver_earnings)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if credited == 0 {
            warn!(driver_id = %driver_id, ride_id = %ride_id, "completed ride without an open session");
        }

        tx.commit().await?;
        Ride::try_from(completed).map(Some)
    }

    async fn cancel_ride(
        &self,
        ride_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Ride>, AppError> {
        let mut tx = self.pool.begin().await?;

        let cancelled = sqlx::query_as::<_, RideRow>(&format!(
            r#"
            UPDATE rides
            SET status = 'CANCELLED', cancellation_reason = $2, cancelled_at = $3, updated_at = $3
            WHERE id = $1 AND status IN ('REQUESTED', 'MATCHED')
            RETURNING {RIDE_COLUMNS}
            "#
        ))
        .bind(ride_id)
        .bind(reason)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(cancelled) = cancelled else {
            tx.rollback().await?;
            return Ok(None);
        };

        if let Some(driver_id) = cancelled.driver_id {
            sqlx::query(
                r#"
                UPDATE drivers
                SET status = 'AVAILABLE', updated_at = $2
                WHERE id = $1 AND status = 'EN_ROUTE'
                "#,
            )
            .bind(driver_id)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ride::try_from(cancelled).map(Some)
    }
}

#[async_trait]
impl DriverRepository for PgStore {
    async fn insert_driver(&self, driver: &Driver) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO drivers (
                id, vehicle_type, vehicle_attrs, status, is_verified, rating,
                total_rides, total_earnings, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(driver.id)
        .bind(driver.vehicle_type.as_str())
        .bind(Json(&driver.vehicle))
        .bind(driver.status.as_str())
        .bind(driver.is_verified)
        .bind(driver.rating)
        .bind(driver.total_rides)
        .bind(driver.total_earnings)
        .bind(driver.created_at)
        .bind(driver.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_driver(&self, id: Uuid) -> Result<Option<Driver>, AppError> {
        let row = sqlx::query_as::<_, DriverRow>(&format!(
            r#"
            SELECT {DRIVER_COLUMNS}
            FROM drivers d
            LEFT JOIN users u ON u.id = d.id
            WHERE d.id = $1
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Driver::try_from).transpose()
    }

    async fn find_nearby(&self, query: &NearbyQuery) -> Result<Vec<NearbyDriver>, AppError> {
        let rows = sqlx::query_as::<_, NearbyRow>(&format!(
            r#"
            SELECT {DRIVER_COLUMNS},
                   c.latitude::float8 AS latitude,
                   c.longitude::float8 AS longitude,
                   ST_Distance(
                       ST_MakePoint(c.longitude, c.latitude)::geography,
                       ST_MakePoint($1, $2)::geography
                   ) / 1000 AS distance_km
            FROM drivers d
            LEFT JOIN users u ON u.id = d.id
            JOIN coordinates c ON c.entity_id = d.id
              AND c.entity_type = 'driver'
              AND c.is_current = true
            WHERE d.status = 'AVAILABLE'
              AND d.vehicle_type = $3
              AND d.is_verified = true
              AND ST_DWithin(
                    ST_MakePoint(c.longitude, c.latitude)::geography,
                    ST_MakePoint($1, $2)::geography,
                    $4
                  )
            ORDER BY distance_km, d.rating DESC
            LIMIT $5
            "#
        ))
        .bind(query.point.lng)
        .bind(query.point.lat)
        .bind(query.vehicle_type.as_str())
        .bind(query.radius_km * 1000.0)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let location = GeoPoint {
                    lat: row.latitude,
                    lng: row.longitude,
                };
                Ok(NearbyDriver {
                    driver: Driver::try_from(row.driver)?,
                    location,
                    distance_km: row.distance_km,
                })
            })
            .collect()
    }

    async fn open_session(
        &self,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DriverSession>, AppError> {
        let mut tx = self.pool.begin().await?;

        let online = sqlx::query(
            r#"
            UPDATE drivers
            SET status = 'AVAILABLE', updated_at = $2
            WHERE id = $1 AND status = 'OFFLINE' AND is_verified = true
            "#,
        )
        .bind(driver_id)
        .bind(at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if online == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let session = DriverSession::open(driver_id, at);
        sqlx::query(
            r#"
            INSERT INTO driver_sessions (id, driver_id, started_at, total_rides, total_earnings)
            VALUES ($1, $2, $3, 0, 0)
            "#,
        )
        .bind(session.id)
        .bind(driver_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(session))
    }

    async fn close_session(
        &self,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DriverSession>, AppError> {
        let mut tx = self.pool.begin().await?;

        let offline = sqlx::query(
            r#"
            UPDATE drivers
            SET status = 'OFFLINE', updated_at = $2
            WHERE id = $1 AND status = 'AVAILABLE'
            "#,
        )
        .bind(driver_id)
        .bind(at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if offline == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let closed = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE driver_sessions
            SET ended_at = $2
            WHERE driver_id = $1 AND ended_at IS NULL
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(driver_id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(closed) = closed else {
            tx.rollback().await?;
            return Ok(None);
        };

        tx.commit().await?;
        Ok(Some(closed.into()))
    }

    async fn find_open_session(&self, driver_id: Uuid) -> Result<Option<DriverSession>, AppError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM driver_sessions
            WHERE driver_id = $1 AND ended_at IS NULL
            ORDER BY started_at DESC
            LIMIT 1
            "#
        ))
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DriverSession::from))
    }
}

#[async_trait]
impl LocationRepository for PgStore {
    async fn replace_current(&self, coordinate: &Coordinate) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        // Serializes writers of one entity even when it has no current row yet,
        // which row locks alone cannot do.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}", coordinate.entity_type, coordinate.entity_id))
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE coordinates
            SET is_current = false, updated_at = $3
            WHERE entity_id = $1 AND entity_type = $2 AND is_current = true
            "#,
        )
        .bind(coordinate.entity_id)
        .bind(coordinate.entity_type.as_str())
        .bind(coordinate.created_at)
        .execute(&mut *tx)
        .await?;

        insert_coordinate(&mut tx, coordinate, true).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn current(
        &self,
        entity_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Option<Coordinate>, AppError> {
        let row = sqlx::query_as::<_, CoordinateRow>(&format!(
            r#"
            SELECT {COORDINATE_COLUMNS}
            FROM coordinates
            WHERE entity_id = $1 AND entity_type = $2 AND is_current = true
            LIMIT 1
            "#
        ))
        .bind(entity_id)
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Coordinate::try_from).transpose()
    }

    async fn insert_coordinate(&self, coordinate: &Coordinate) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        insert_coordinate(&mut tx, coordinate, false).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_coordinate(&self, id: Uuid) -> Result<Option<Coordinate>, AppError> {
        let row = sqlx::query_as::<_, CoordinateRow>(&format!(
            "SELECT {COORDINATE_COLUMNS} FROM coordinates WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Coordinate::try_from).transpose()
    }

    async fn append_history(&self, entry: &LocationHistory) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO location_history (
                id, coordinate_id, driver_id, latitude, longitude, accuracy_meters,
                speed_kmh, heading_degrees, ride_id, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.coordinate_id)
        .bind(entry.driver_id)
        .bind(entry.latitude)
        .bind(entry.longitude)
        .bind(entry.accuracy_meters)
        .bind(entry.speed_kmh)
        .bind(entry.heading_degrees)
        .bind(entry.ride_id)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

async fn insert_coordinate(
    tx: &mut Transaction<'static, Postgres>,
    coordinate: &Coordinate,
    is_current: bool,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO coordinates (
            id, entity_id, entity_type, address, latitude, longitude,
            fare_amount, distance_km, duration_minutes, is_current, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(coordinate.id)
    .bind(coordinate.entity_id)
    .bind(coordinate.entity_type.as_str())
    .bind(&coordinate.address)
    .bind(coordinate.latitude)
    .bind(coordinate.longitude)
    .bind(coordinate.estimate.fare_amount)
    .bind(coordinate.estimate.distance_km)
    .bind(coordinate.estimate.duration_minutes)
    .bind(is_current)
    .bind(coordinate.created_at)
    .bind(coordinate.updated_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn corrupt(column: &str, err: AppError) -> AppError {
    AppError::Internal(format!("unreadable {column} column: {err}"))
}

#[derive(FromRow)]
struct RideRow {
    id: Uuid,
    ride_number: String,
    passenger_id: Uuid,
    driver_id: Option<Uuid>,
    vehicle_type: String,
    status: String,
    priority: i32,
    requested_at: DateTime<Utc>,
    matched_at: Option<DateTime<Utc>>,
    arrived_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    estimated_fare: Option<f64>,
    final_fare: Option<f64>,
    pickup_coordinate_id: Uuid,
    destination_coordinate_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RideRow> for Ride {
    type Error = AppError;

    fn try_from(row: RideRow) -> Result<Self, Self::Error> {
        Ok(Ride {
            id: row.id,
            ride_number: row.ride_number,
            passenger_id: row.passenger_id,
            driver_id: row.driver_id,
            vehicle_type: row
                .vehicle_type
                .parse::<VehicleType>()
                .map_err(|err| corrupt("rides.vehicle_type", err))?,
            status: row
                .status
                .parse::<RideStatus>()
                .map_err(|err| corrupt("rides.status", err))?,
            priority: row.priority,
            requested_at: row.requested_at,
            matched_at: row.matched_at,
            arrived_at: row.arrived_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            estimated_fare: row.estimated_fare.unwrap_or_default(),
            final_fare: row.final_fare,
            pickup_coordinate_id: row.pickup_coordinate_id,
            destination_coordinate_id: row.destination_coordinate_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct DriverRow {
    id: Uuid,
    name: String,
    vehicle_type: String,
    vehicle_attrs: Option<Json<VehicleInfo>>,
    status: String,
    is_verified: bool,
    rating: f64,
    total_rides: i64,
    total_earnings: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DriverRow> for Driver {
    type Error = AppError;

    fn try_from(row: DriverRow) -> Result<Self, Self::Error> {
        Ok(Driver {
            id: row.id,
            name: row.name,
            vehicle_type: row
                .vehicle_type
                .parse::<VehicleType>()
                .map_err(|err| corrupt("drivers.vehicle_type", err))?,
            vehicle: row.vehicle_attrs.map(|Json(v)| v).unwrap_or_default(),
            status: row
                .status
                .parse::<DriverStatus>()
                .map_err(|err| corrupt("drivers.status", err))?,
            is_verified: row.is_verified,
            rating: row.rating,
            total_rides: row.total_rides,
            total_earnings: row.total_earnings,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct NearbyRow {
    #[sqlx(flatten)]
    driver: DriverRow,
    latitude: f64,
    longitude: f64,
    distance_km: f64,
}

#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    driver_id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    total_rides: i64,
    total_earnings: f64,
}

impl From<SessionRow> for DriverSession {
    fn from(row: SessionRow) -> Self {
        DriverSession {
            id: row.id,
            driver_id: row.driver_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            total_rides: row.total_rides,
            total_earnings: row.total_earnings,
        }
    }
}

#[derive(FromRow)]
struct CoordinateRow {
    id: Uuid,
    entity_id: Uuid,
    entity_type: String,
    address: Option<String>,
    latitude: f64,
    longitude: f64,
    fare_amount: Option<f64>,
    distance_km: Option<f64>,
    duration_minutes: Option<i32>,
    is_current: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CoordinateRow> for Coordinate {
    type Error = AppError;

    fn try_from(row: CoordinateRow) -> Result<Self, Self::Error> {
        Ok(Coordinate {
            id: row.id,
            entity_id: row.entity_id,
            entity_type: row
                .entity_type
                .parse::<EntityType>()
                .map_err(|err| corrupt("coordinates.entity_type", err))?,
            address: row.address.unwrap_or_default(),
            latitude: row.latitude,
            longitude: row.longitude,
            estimate: TripEstimate {
                fare_amount: row.fare_amount,
                distance_km: row.distance_km,
                duration_minutes: row.duration_minutes,
            },
            is_current: row.is_current,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
