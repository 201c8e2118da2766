//! # Configuration Management
//!
//! Loads the proxy configuration once at startup from several sources:
//! - Legacy flat environment variables (`WS_URL`, `DEVICE_TOKEN`, ...)
//! - Environment variables with the `APP__` prefix (`APP__PROXY__MAX_SESSIONS=4`)
//! - `config.toml` in the working directory
//! - Default values (defined in the Default impl)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Legacy variables
//! 2. `APP__SECTION__KEY` variables
//! 3. Configuration file (config.toml)
//! 4. Defaults
//!
//! The resulting [`AppConfig`] is immutable; it is shared behind an `Arc` and
//! passed explicitly into the proxy server and the HTTP launcher.

use anyhow::Result;
use config::builder::{ConfigBuilder, DefaultState};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Opus accepts these sample rates only.
const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub backend: BackendConfig,
    pub reconnect: ReconnectConfig,
    pub audio: AudioConfig,
}

/// HTTP launcher settings (static page, health, config endpoints).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding `index.html` for the browser client.
    pub static_dir: String,
}

/// Browser-facing WebSocket listener and global limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Address browsers use to reach the proxy; rendered into the client page.
    pub public_url: String,
    pub max_sessions: usize,
    /// Largest browser message accepted, in bytes.
    pub max_message_size: usize,
    /// Messages held per session while the backend link is reconnecting.
    pub reconnect_queue_capacity: usize,
    /// 0 disables the idle policy.
    pub idle_timeout_secs: u64,
    /// Consecutive malformed control messages tolerated before closing the browser.
    pub max_protocol_errors: u32,
}

/// Backend WebSocket endpoint and device identity sent in the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub token: String,
    pub enable_token: bool,
    /// Empty means "derive from the host MAC address".
    pub device_id: String,
    /// Empty means "generate a UUID at startup".
    pub client_id: String,
    pub protocol_version: String,
    pub connect_timeout_ms: u64,
}

/// Exponential backoff used when the backend link drops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// A link that stays up this long earns a fresh set of attempts.
    pub stable_after_ms: u64,
}

/// Codec framing for the backend link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    /// Samples per codec frame (960 = 60 ms at 16 kHz).
    pub frame_samples: usize,
    pub playback_format: PlaybackFormat,
}

/// Container used for decoded audio sent to the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackFormat {
    /// Self-contained RIFF/WAVE chunk per frame.
    Wav,
    /// Bare little-endian PCM16.
    Pcm,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5001,
                static_dir: "templates".to_string(),
            },
            proxy: ProxyConfig {
                host: "0.0.0.0".to_string(),
                port: 5002,
                public_url: "ws://localhost:5002".to_string(),
                max_sessions: 32,
                max_message_size: 1024 * 1024,
                reconnect_queue_capacity: 32,
                idle_timeout_secs: 0,
                max_protocol_errors: 16,
            },
            backend: BackendConfig {
                url: "ws://localhost:9005".to_string(),
                token: "123".to_string(),
                enable_token: true,
                device_id: String::new(),
                client_id: String::new(),
                protocol_version: "1".to_string(),
                connect_timeout_ms: 5000,
            },
            reconnect: ReconnectConfig {
                max_attempts: 3,
                initial_delay_ms: 500,
                max_delay_ms: 8000,
                multiplier: 2.0,
                stable_after_ms: 10_000,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
                frame_samples: 960,
                playback_format: PlaybackFormat::Wav,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, `APP__` variables and the
    /// legacy variables, then fill in the device identity.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = apply_legacy_env(settings, |key| env::var(key).ok())?;

        let mut config: AppConfig = settings.build()?.try_deserialize()?;
        config.resolve_identity();
        Ok(config)
    }

    /// Reject configurations the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 || self.proxy.port == 0 {
            return Err(anyhow::anyhow!("Listen ports cannot be 0"));
        }

        if self.server.port == self.proxy.port && self.server.host == self.proxy.host {
            return Err(anyhow::anyhow!(
                "HTTP server and proxy cannot share {}:{}",
                self.proxy.host,
                self.proxy.port
            ));
        }

        if self.proxy.max_sessions == 0 {
            return Err(anyhow::anyhow!("Max sessions must be greater than 0"));
        }

        if self.proxy.max_message_size == 0 {
            return Err(anyhow::anyhow!("Max message size must be greater than 0"));
        }

        if self.proxy.reconnect_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Reconnect queue capacity must be greater than 0"));
        }

        let backend_url = url::Url::parse(&self.backend.url)
            .map_err(|e| anyhow::anyhow!("Invalid backend url '{}': {}", self.backend.url, e))?;
        if !matches!(backend_url.scheme(), "ws" | "wss") {
            return Err(anyhow::anyhow!(
                "Backend url must use ws:// or wss://, got {}",
                backend_url.scheme()
            ));
        }

        if self.backend.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.reconnect.multiplier < 1.0 {
            return Err(anyhow::anyhow!("Backoff multiplier must be at least 1.0"));
        }

        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(anyhow::anyhow!("Initial backoff delay exceeds the maximum delay"));
        }

        if !OPUS_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            return Err(anyhow::anyhow!(
                "Unsupported sample rate {} (use one of {:?})",
                self.audio.sample_rate,
                OPUS_SAMPLE_RATES
            ));
        }

        if !matches!(self.audio.channels, 1 | 2) {
            return Err(anyhow::anyhow!("Channels must be 1 or 2"));
        }

        // Opus frames are 2.5, 5, 10, 20, 40 or 60 ms long.
        let half_ms = self.audio.frame_samples as u64 * 2000;
        let rate = self.audio.sample_rate as u64;
        if half_ms % rate != 0 || ![5, 10, 20, 40, 80, 120].contains(&(half_ms / rate)) {
            return Err(anyhow::anyhow!(
                "Frame of {} samples is not a valid Opus frame duration at {} Hz",
                self.audio.frame_samples,
                self.audio.sample_rate
            ));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.connect_timeout_ms)
    }

    /// Fill in device and client ids when they were not configured.
    fn resolve_identity(&mut self) {
        if self.backend.device_id.is_empty() {
            self.backend.device_id = host_mac_address().unwrap_or_else(random_mac_address);
        }
        if self.backend.client_id.is_empty() {
            self.backend.client_id = uuid::Uuid::new_v4().to_string();
        }
    }
}

/// Apply the flat variable names still found in existing `.env` files.
///
/// `lookup` abstracts the environment so tests don't have to mutate the process env.
fn apply_legacy_env<F>(
    mut settings: ConfigBuilder<DefaultState>,
    lookup: F,
) -> Result<ConfigBuilder<DefaultState>>
where
    F: Fn(&str) -> Option<String>,
{
    let string_overrides = [
        ("WS_URL", "backend.url"),
        ("DEVICE_TOKEN", "backend.token"),
        ("DEVICE_ID", "backend.device_id"),
        ("CLIENT_ID", "backend.client_id"),
        ("LOCAL_PROXY_URL", "proxy.public_url"),
    ];
    for (var, key) in string_overrides {
        if let Some(value) = lookup(var).filter(|v| !v.is_empty()) {
            settings = settings.set_override(key, value)?;
        }
    }

    if let Some(flag) = lookup("ENABLE_TOKEN") {
        settings = settings.set_override("backend.enable_token", flag.eq_ignore_ascii_case("true"))?;
    }

    if let Some(port) = lookup("WEB_PORT") {
        let port: u16 = port
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid WEB_PORT '{}': {}", port, e))?;
        settings = settings.set_override("server.port", i64::from(port))?;
    }

    let proxy_port = match lookup("PROXY_PORT") {
        Some(port) => Some(
            port.parse::<u16>()
                .map_err(|e| anyhow::anyhow!("Invalid PROXY_PORT '{}': {}", port, e))?,
        ),
        None => lookup("LOCAL_PROXY_URL")
            .and_then(|raw| url::Url::parse(&raw).ok())
            .and_then(|parsed| parsed.port()),
    };
    if let Some(port) = proxy_port {
        settings = settings.set_override("proxy.port", i64::from(port))?;
    }

    Ok(settings)
}

/// MAC address of the first non-loopback interface, formatted `aa:bb:cc:dd:ee:ff`.
fn host_mac_address() -> Option<String> {
    let mut interfaces: Vec<_> = std::fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != "lo")
        .map(|entry| entry.path())
        .collect();
    interfaces.sort();

    interfaces.into_iter().find_map(|path| {
        let address = std::fs::read_to_string(path.join("address")).ok()?;
        let address = address.trim().to_lowercase();
        (address.len() == 17 && address != "00:00:00:00:00:00").then_some(address)
    })
}

/// Random unicast, locally administered MAC address.
fn random_mac_address() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let first = (bytes[0] | 0x02) & 0xfe;
    std::iter::once(first)
        .chain(bytes[1..6].iter().copied())
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn build_with(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);
        let builder = apply_legacy_env(builder, |key| vars.get(key).cloned())?;
        Ok(builder.build()?.try_deserialize()?)
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.proxy.port, 5002);
        assert_eq!(config.server.port, 5001);
        assert_eq!(config.audio.frame_samples, 960);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.proxy.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backend.url = "http://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_samples = 1000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_samples = 320;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_legacy_variables_override_defaults() {
        let config = build_with(&[
            ("WS_URL", "wss://backend.example/ws"),
            ("DEVICE_TOKEN", "secret"),
            ("ENABLE_TOKEN", "False"),
            ("WEB_PORT", "8001"),
            ("PROXY_PORT", "8002"),
        ])
        .unwrap();

        assert_eq!(config.backend.url, "wss://backend.example/ws");
        assert_eq!(config.backend.token, "secret");
        assert!(!config.backend.enable_token);
        assert_eq!(config.server.port, 8001);
        assert_eq!(config.proxy.port, 8002);
    }

    #[test]
    fn test_local_proxy_url_sets_port_when_proxy_port_missing() {
        let config = build_with(&[("LOCAL_PROXY_URL", "ws://192.168.1.7:6100")]).unwrap();
        assert_eq!(config.proxy.port, 6100);
        assert_eq!(config.proxy.public_url, "ws://192.168.1.7:6100");

        let config = build_with(&[
            ("LOCAL_PROXY_URL", "ws://192.168.1.7:6100"),
            ("PROXY_PORT", "7000"),
        ])
        .unwrap();
        assert_eq!(config.proxy.port, 7000);
    }

    #[test]
    fn test_invalid_legacy_port_is_rejected() {
        assert!(build_with(&[("WEB_PORT", "not-a-port")]).is_err());
    }

    #[test]
    fn test_identity_is_filled_in() {
        let mut config = AppConfig::default();
        config.resolve_identity();
        assert_eq!(config.backend.device_id.len(), 17);
        assert!(uuid::Uuid::parse_str(&config.backend.client_id).is_ok());

        let mut config = AppConfig::default();
        config.backend.device_id = "11:22:33:44:55:66".to_string();
        config.resolve_identity();
        assert_eq!(config.backend.device_id, "11:22:33:44:55:66");
    }

    #[test]
    fn test_random_mac_is_locally_administered_unicast() {
        let mac = random_mac_address();
        let first = u8::from_str_radix(&mac[0..2], 16).unwrap();
        assert_eq!(first & 0x02, 0x02);
        assert_eq!(first & 0x01, 0x00);
    }
}
