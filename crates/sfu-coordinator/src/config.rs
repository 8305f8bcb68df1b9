//! SFU coordinator configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default; malformed or zero values are rejected rather than silently
//! replaced.

use common::config::ObservabilityConfig;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

pub const DEFAULT_MAX_ROOMS: usize = 1000;

pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 100;

/// Default bound on a single media-engine call, in milliseconds.
pub const DEFAULT_MEDIA_CALL_TIMEOUT_MS: u64 = 10_000;

/// Default per-connection outbound queue size.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Default time a client may leave its outbound queue full before it is
/// disconnected, in milliseconds.
pub const DEFAULT_OUTBOUND_STALL_TIMEOUT_MS: u64 = 5_000;

/// Default address advertised in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// SFU coordinator configuration.
#[derive(Clone)]
pub struct Config {
    /// Signaling WebSocket bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: SocketAddr,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: SocketAddr,

    /// Unique identifier for this instance, used in logs.
    pub sfu_id: String,

    /// Maximum concurrent rooms.
    pub max_rooms: usize,

    /// Maximum peers in one room.
    pub max_peers_per_room: usize,

    /// Bound on each media-engine call.
    pub media_call_timeout: Duration,

    /// Slots in each connection's outbound queue.
    pub outbound_buffer: usize,

    /// How long a room notice may wait for outbound queue space before the
    /// connection is closed.
    pub outbound_stall_timeout: Duration,

    /// Address advertised in ICE candidates.
    pub announced_ip: String,

    pub observability: ObservabilityConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("sfu_id", &self.sfu_id)
            .field("max_rooms", &self.max_rooms)
            .field("max_peers_per_room", &self.max_peers_per_room)
            .field("media_call_timeout", &self.media_call_timeout)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("outbound_stall_timeout", &self.outbound_stall_timeout)
            .field("announced_ip", &self.announced_ip)
            .field("json_logs", &self.observability.json_logs)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = parse_or(
            vars,
            "SFU_SIGNALING_BIND_ADDRESS",
            DEFAULT_SIGNALING_BIND_ADDRESS,
        )?;
        let health_bind_address =
            parse_or(vars, "SFU_HEALTH_BIND_ADDRESS", DEFAULT_HEALTH_BIND_ADDRESS)?;

        let max_rooms = positive_or(vars, "SFU_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;
        let max_peers_per_room =
            positive_or(vars, "SFU_MAX_PEERS_PER_ROOM", DEFAULT_MAX_PEERS_PER_ROOM)?;
        let media_call_timeout = Duration::from_millis(positive_or(
            vars,
            "SFU_MEDIA_CALL_TIMEOUT_MS",
            DEFAULT_MEDIA_CALL_TIMEOUT_MS,
        )?);
        let outbound_buffer = positive_or(vars, "SFU_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?;
        let outbound_stall_timeout = Duration::from_millis(positive_or(
            vars,
            "SFU_OUTBOUND_STALL_TIMEOUT_MS",
            DEFAULT_OUTBOUND_STALL_TIMEOUT_MS,
        )?);

        let announced_ip = vars
            .get("SFU_ANNOUNCED_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ANNOUNCED_IP.to_string());
        if announced_ip.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "SFU_ANNOUNCED_IP must not be empty".to_string(),
            ));
        }

        let json_logs = match vars.get("SFU_LOG_JSON").map(|s| s.to_ascii_lowercase()) {
            None => false,
            Some(v) if v == "true" || v == "1" => true,
            Some(v) if v == "false" || v == "0" => false,
            Some(v) => {
                return Err(ConfigError::InvalidValue(format!(
                    "SFU_LOG_JSON must be true or false, got '{v}'"
                )))
            }
        };

        // Generate SFU instance ID
        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            sfu_id,
            max_rooms,
            max_peers_per_room,
            media_call_timeout,
            outbound_buffer,
            outbound_stall_timeout,
            announced_ip,
            observability: ObservabilityConfig {
                json_logs,
                ..ObservabilityConfig::default()
            },
        })
    }
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> Result<T, ConfigError> {
    let raw = vars.get(key).map_or(default, String::as_str);
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{key} has invalid value '{raw}'")))
}

fn positive_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
{
    let Some(raw) = vars.get(key) else {
        return Ok(default);
    };
    let value: T = raw
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{key} has invalid value '{raw}'")))?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!("{key} must be greater than zero")));
    }
    Ok(value)
}
