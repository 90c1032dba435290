use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: String,
    pub request_timeout: Duration,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub hub: HubConfig,
    pub dispatch: DispatchConfig,
    pub location: LocationConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_frame_bytes: usize,
    pub outbound_queue_size: usize,
    pub channel_size: usize,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub radius_km: f64,
    pub candidate_limit: usize,
    pub fan_out: usize,
    pub offer_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub min_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub amqp_url: Option<String>,
    pub prefetch: usize,
    pub publish_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_frame_bytes: 8192,
            outbound_queue_size: 256,
            channel_size: 256,
        }
    }
}

impl HubConfig {
    /// Heartbeat period for the write task. A zero interval would panic the timer.
    pub fn ping_period(&self) -> Duration {
        self.ping_interval.max(Duration::from_secs(1))
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            radius_km: 5.0,
            candidate_limit: 10,
            fan_out: 3,
            offer_ttl: Duration::from_secs(30),
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(3),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            amqp_url: None,
            prefetch: 10,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
            request_timeout: Duration::from_secs(10),
            database_url: None,
            database_max_connections: 10,
            jwt_secret: "dev-secret-change-me".to_string(),
            jwt_issuer: "ride-hail".to_string(),
            hub: HubConfig::default(),
            dispatch: DispatchConfig::default(),
            location: LocationConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: env::var("LOG_FORMAT").unwrap_or(defaults.log_format),
            request_timeout: secs_or_default("REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_or_default(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            jwt_secret: env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or(defaults.jwt_issuer),
            hub: HubConfig {
                auth_timeout: secs_or_default("WS_AUTH_TIMEOUT_SECS", defaults.hub.auth_timeout)?,
                ping_interval: secs_or_default(
                    "WS_PING_INTERVAL_SECS",
                    defaults.hub.ping_interval,
                )?,
                pong_wait: secs_or_default("WS_PONG_WAIT_SECS", defaults.hub.pong_wait)?,
                write_wait: secs_or_default("WS_WRITE_WAIT_SECS", defaults.hub.write_wait)?,
                max_frame_bytes: parse_or_default(
                    "WS_MAX_FRAME_BYTES",
                    defaults.hub.max_frame_bytes,
                )?,
                outbound_queue_size: parse_or_default(
                    "WS_OUTBOUND_QUEUE_SIZE",
                    defaults.hub.outbound_queue_size,
                )?,
                channel_size: parse_or_default("HUB_CHANNEL_SIZE", defaults.hub.channel_size)?,
            },
            dispatch: DispatchConfig {
                radius_km: parse_or_default("DISPATCH_RADIUS_KM", defaults.dispatch.radius_km)?,
                candidate_limit: parse_or_default(
                    "DISPATCH_CANDIDATE_LIMIT",
                    defaults.dispatch.candidate_limit,
                )?,
                fan_out: parse_or_default("DISPATCH_FAN_OUT", defaults.dispatch.fan_out)?,
                offer_ttl: secs_or_default("OFFER_TTL_SECS", defaults.dispatch.offer_ttl)?,
            },
            location: LocationConfig {
                min_interval: Duration::from_millis(parse_or_default(
                    "LOCATION_MIN_INTERVAL_MS",
                    defaults.location.min_interval.as_millis() as u64,
                )?),
            },
            bus: BusConfig {
                amqp_url: env::var("AMQP_URL").ok().filter(|url| !url.trim().is_empty()),
                prefetch: parse_or_default("BUS_PREFETCH", defaults.bus.prefetch)?,
                publish_timeout: secs_or_default(
                    "PUBLISH_TIMEOUT_SECS",
                    defaults.bus.publish_timeout,
                )?,
            },
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

fn secs_or_default(key: &str, default: Duration) -> Result<Duration, AppError> {
    parse_or_default(key, default.as_secs()).map(Duration::from_secs)
}
