//! Cast service configuration.
//!
//! Configuration is loaded from `CAST_*` environment variables. Every field
//! has a default; values that are present but unparseable are errors rather
//! than silently replaced by the default.

use common::config::{LogFormat, ObservabilityConfig};
use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP + WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8002";

/// Default IP participant transports listen on.
pub const DEFAULT_LISTEN_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default IP announced in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default number of producing participants required to composite.
pub const DEFAULT_REQUIRED_PARTICIPANTS: usize = 2;

/// Default per-request signaling timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default session descriptor path.
pub const DEFAULT_SDP_PATH: &str = "./ffmpeg_stream.sdp";

/// Default directory for static files.
pub const DEFAULT_PUBLIC_DIR: &str = "./public";

/// Default playlist output directory.
pub const DEFAULT_HLS_DIR: &str = "./public/hls";

/// Default encoder binary.
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";

/// Default HLS segment duration in seconds.
pub const DEFAULT_HLS_SEGMENT_SECONDS: u32 = 4;

/// Default HLS sliding window size (segments).
pub const DEFAULT_HLS_WINDOW_SIZE: u32 = 5;

/// Default first RTP port handed to the encoder (RTCP is +1).
pub const DEFAULT_RTP_BASE_PORT: u16 = 5004;

/// Default encoder readiness timeout in milliseconds.
pub const DEFAULT_ENCODER_READY_TIMEOUT_MS: u64 = 5_000;

/// Default encoder spawn attempts.
pub const DEFAULT_ENCODER_SPAWN_ATTEMPTS: u32 = 3;

/// Default warm-up after encoder readiness in milliseconds.
pub const DEFAULT_ENCODER_WARMUP_MS: u64 = 2_000;

/// Default `EnvFilter` directive.
pub const DEFAULT_LOG_FILTER: &str = "cast_service=debug,tower_http=debug";

/// Cast service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP + WebSocket bind address (default: "0.0.0.0:8002").
    pub bind_address: String,

    /// IP participant transports listen on (default: 0.0.0.0).
    pub listen_ip: IpAddr,

    /// IP announced to participants (default: 127.0.0.1).
    pub announced_ip: IpAddr,

    /// Producing participants required before compositing may start.
    pub required_participants: usize,

    /// Deadline for a single signaling request.
    pub request_timeout: Duration,

    /// Where the session descriptor is written.
    pub sdp_path: PathBuf,

    /// Directory served as static files (contains the HLS output).
    pub public_dir: PathBuf,

    /// Playlist and segment output directory. Wiped before each job.
    pub hls_dir: PathBuf,

    /// Encoder binary name or path.
    pub ffmpeg_path: PathBuf,

    /// HLS segment duration in seconds.
    pub hls_segment_seconds: u32,

    /// Number of segments kept in the playlist.
    pub hls_window_size: u32,

    /// First RTP port in the descriptor.
    pub rtp_base_port: u16,

    /// How long to wait for the encoder's first diagnostic line.
    pub encoder_ready_timeout: Duration,

    /// Spawn attempts before a job fails.
    pub encoder_spawn_attempts: u32,

    /// Delay between encoder readiness and linking media.
    pub encoder_warmup: Duration,

    /// Stop compositing when the last producing participant leaves.
    pub auto_stop: bool,

    /// Logging setup.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("CAST_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let listen_ip = parse_var(vars, "CAST_LISTEN_IP", DEFAULT_LISTEN_IP)?;
        let announced_ip = parse_var(vars, "CAST_ANNOUNCED_IP", DEFAULT_ANNOUNCED_IP)?;

        let required_participants =
            parse_var(vars, "CAST_REQUIRED_PARTICIPANTS", DEFAULT_REQUIRED_PARTICIPANTS)?;
        if required_participants == 0 {
            return Err(invalid("CAST_REQUIRED_PARTICIPANTS", "must be at least 1"));
        }

        let request_timeout = Duration::from_millis(parse_var(
            vars,
            "CAST_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?);

        let sdp_path = path_var(vars, "CAST_SDP_PATH", DEFAULT_SDP_PATH);
        let public_dir = path_var(vars, "CAST_PUBLIC_DIR", DEFAULT_PUBLIC_DIR);
        let hls_dir = path_var(vars, "CAST_HLS_DIR", DEFAULT_HLS_DIR);
        let ffmpeg_path = path_var(vars, "CAST_FFMPEG_PATH", DEFAULT_FFMPEG_PATH);

        let hls_segment_seconds =
            parse_var(vars, "CAST_HLS_SEGMENT_SECONDS", DEFAULT_HLS_SEGMENT_SECONDS)?;
        let hls_window_size = parse_var(vars, "CAST_HLS_WINDOW_SIZE", DEFAULT_HLS_WINDOW_SIZE)?;
        if hls_segment_seconds == 0 || hls_window_size == 0 {
            return Err(invalid(
                "CAST_HLS_SEGMENT_SECONDS/CAST_HLS_WINDOW_SIZE",
                "must be at least 1",
            ));
        }

        let rtp_base_port = parse_var(vars, "CAST_RTP_BASE_PORT", DEFAULT_RTP_BASE_PORT)?;
        if rtp_base_port == 0 || rtp_base_port == u16::MAX {
            return Err(invalid("CAST_RTP_BASE_PORT", "must leave room for RTCP"));
        }

        let encoder_ready_timeout = Duration::from_millis(parse_var(
            vars,
            "CAST_ENCODER_READY_TIMEOUT_MS",
            DEFAULT_ENCODER_READY_TIMEOUT_MS,
        )?);

        let encoder_spawn_attempts = parse_var(
            vars,
            "CAST_ENCODER_SPAWN_ATTEMPTS",
            DEFAULT_ENCODER_SPAWN_ATTEMPTS,
        )?;
        if encoder_spawn_attempts == 0 {
            return Err(invalid("CAST_ENCODER_SPAWN_ATTEMPTS", "must be at least 1"));
        }

        let encoder_warmup = Duration::from_millis(parse_var(
            vars,
            "CAST_ENCODER_WARMUP_MS",
            DEFAULT_ENCODER_WARMUP_MS,
        )?);

        let auto_stop = match vars.get("CAST_AUTO_STOP") {
            Some(raw) => parse_bool(raw).ok_or_else(|| invalid("CAST_AUTO_STOP", raw))?,
            None => true,
        };

        let log_format = match vars.get("CAST_LOG_FORMAT") {
            Some(raw) => LogFormat::parse(raw).ok_or_else(|| invalid("CAST_LOG_FORMAT", raw))?,
            None => LogFormat::default(),
        };
        let log_filter = vars
            .get("CAST_LOG_FILTER")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(Config {
            bind_address,
            listen_ip,
            announced_ip,
            required_participants,
            request_timeout,
            sdp_path,
            public_dir,
            hls_dir,
            ffmpeg_path,
            hls_segment_seconds,
            hls_window_size,
            rtp_base_port,
            encoder_ready_timeout,
            encoder_spawn_attempts,
            encoder_warmup,
            auto_stop,
            observability: ObservabilityConfig {
                log_filter,
                log_format,
            },
        })
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn path_var(vars: &HashMap<String, String>, key: &str, default: &str) -> PathBuf {
    PathBuf::from(vars.get(key).map_or(default, String::as_str))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(&HashMap::new()).unwrap();

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.announced_ip, DEFAULT_ANNOUNCED_IP);
        assert_eq!(config.required_participants, 2);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.sdp_path, PathBuf::from("./ffmpeg_stream.sdp"));
        assert_eq!(config.hls_dir, PathBuf::from("./public/hls"));
        assert_eq!(config.rtp_base_port, 5004);
        assert_eq!(config.encoder_ready_timeout, Duration::from_secs(5));
        assert_eq!(config.encoder_spawn_attempts, 3);
        assert_eq!(config.encoder_warmup, Duration::from_secs(2));
        assert!(config.auto_stop);
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_vars(&vars(&[
            ("CAST_ANNOUNCED_IP", "203.0.113.7"),
            ("CAST_REQUIRED_PARTICIPANTS", "3"),
            ("CAST_REQUEST_TIMEOUT_MS", "250"),
            ("CAST_HLS_DIR", "/var/lib/duocast/hls"),
            ("CAST_AUTO_STOP", "off"),
            ("CAST_LOG_FORMAT", "json"),
        ]))
        .unwrap();

        assert_eq!(config.announced_ip.to_string(), "203.0.113.7");
        assert_eq!(config.required_participants, 3);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.hls_dir, PathBuf::from("/var/lib/duocast/hls"));
        assert!(!config.auto_stop);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_numbers_are_errors() {
        let err = Config::from_vars(&vars(&[("CAST_REQUEST_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("CAST_REQUEST_TIMEOUT_MS"));

        assert!(Config::from_vars(&vars(&[("CAST_RTP_BASE_PORT", "70000")])).is_err());
        assert!(Config::from_vars(&vars(&[("CAST_REQUIRED_PARTICIPANTS", "0")])).is_err());
        assert!(Config::from_vars(&vars(&[("CAST_ENCODER_SPAWN_ATTEMPTS", "0")])).is_err());
    }

    #[test]
    fn test_invalid_enums_are_errors() {
        assert!(Config::from_vars(&vars(&[("CAST_AUTO_STOP", "maybe")])).is_err());
        assert!(Config::from_vars(&vars(&[("CAST_LOG_FORMAT", "xml")])).is_err());
        assert!(Config::from_vars(&vars(&[("CAST_ANNOUNCED_IP", "localhost")])).is_err());
    }
}
