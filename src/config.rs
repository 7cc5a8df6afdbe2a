//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - The upstream credential variables (XUNFEI_APP_ID, XUNFEI_API_KEY, XUNFEI_API_SECRET)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, XUNFEI_*)
//! 2. Environment variables (APP_SERVER__PORT, APP_SPEECH__RECEIVE_TIMEOUT_SECS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::speech::{Credential, Endpoint, GatewayConfig, SessionParameters};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The HTTP shell (server, limits) and the speech gateway (speech) change for
/// different reasons, so each gets its own section in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub speech: SpeechConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Limits enforced by the HTTP layer before the gateway is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted upload in bytes (10 MiB by default)
    pub max_upload_bytes: usize,
}

/// Upstream speech recognizer settings.
///
/// ## Fields:
/// - `app_id`, `api_key`, `api_secret`: Credentials issued by the recognizer. Empty by
///   default; the gateway refuses to connect until all three are set.
/// - `scheme`, `host`, `path`: Where the streaming endpoint lives.
/// - `language` .. `dwa`: Session parameters sent on the first frame.
/// - `frame_size`, `frame_interval_ms`: How audio is cut and paced (1280 bytes every 40ms
///   is exactly real time for 16kHz 16-bit mono).
/// - `connect_timeout_secs`, `receive_timeout_secs`: Bounds on the handshake and on each
///   wait for an inbound message.
/// - `transcoder_path`: External transcoder used as a last-resort audio converter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub app_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub language: String,
    pub domain: String,
    pub accent: String,
    pub vad_eos_ms: u32,
    pub dwa: String,
    pub frame_size: usize,
    pub frame_interval_ms: u64,
    pub connect_timeout_secs: u64,
    pub receive_timeout_secs: u64,
    pub transcoder_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8000,
            },
            limits: LimitsConfig {
                max_upload_bytes: 10 * 1024 * 1024,
            },
            speech: SpeechConfig {
                app_id: String::new(),
                api_key: String::new(),
                api_secret: String::new(),
                scheme: "wss".to_string(),
                host: "iat-api.xfyun.cn".to_string(),
                path: "/v2/iat".to_string(),
                language: "zh_cn".to_string(),
                domain: "iat".to_string(),
                accent: "mandarin".to_string(),
                vad_eos_ms: 5000,
                dwa: "wpgs".to_string(),  // Dynamic correction: partial results may replace earlier ones
                frame_size: 1280,
                frame_interval_ms: 40,
                connect_timeout_secs: 10,
                receive_timeout_secs: 15,
                transcoder_path: "ffmpeg".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and the XUNFEI_* credentials
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SPEECH__RECEIVE_TIMEOUT_SECS=20`: Wait longer for recognition results
    /// - `XUNFEI_API_SECRET=...`: Credential, same variable name the frontend team already uses
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Field names contain underscores, so nesting uses a double underscore
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        for (var, key) in [
            ("XUNFEI_APP_ID", "speech.app_id"),
            ("XUNFEI_API_KEY", "speech.api_key"),
            ("XUNFEI_API_SECRET", "speech.api_secret"),
        ] {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Upload limit is greater than 0
    /// - Frame size is a positive, even number of bytes (frames must not split a sample)
    /// - Receive timeout is greater than 0
    ///
    /// ## What this does NOT check:
    /// Missing credentials. The server still starts without them and every recognition
    /// request reports a configuration error instead, so the rest of the API stays usable.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.limits.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Upload limit must be greater than 0"));
        }

        if self.speech.frame_size == 0 || self.speech.frame_size % 2 != 0 {
            return Err(anyhow::anyhow!(
                "Frame size must be a positive even number of bytes, got {}",
                self.speech.frame_size
            ));
        }

        if self.speech.receive_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Receive timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. For example
    /// `{"speech": {"vad_eos_ms": 3000}}` changes only the silence window.
    ///
    /// ## Credentials:
    /// `app_id`, `api_key` and `api_secret` are ignored here; they only come
    /// from the environment or config.toml.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = narrow("server.port", port)?;
            }
        }

        if let Some(limits) = partial_config.get("limits") {
            if let Some(max) = limits.get("max_upload_bytes").and_then(|v| v.as_u64()) {
                self.limits.max_upload_bytes = narrow("limits.max_upload_bytes", max)?;
            }
        }

        if let Some(speech) = partial_config.get("speech") {
            let text = |key: &str| speech.get(key).and_then(|v| v.as_str()).map(str::to_string);
            let number = |key: &str| speech.get(key).and_then(|v| v.as_u64());

            if let Some(language) = text("language") {
                self.speech.language = language;
            }
            if let Some(domain) = text("domain") {
                self.speech.domain = domain;
            }
            if let Some(accent) = text("accent") {
                self.speech.accent = accent;
            }
            if let Some(dwa) = text("dwa") {
                self.speech.dwa = dwa;
            }
            if let Some(vad_eos_ms) = number("vad_eos_ms") {
                self.speech.vad_eos_ms = narrow("speech.vad_eos_ms", vad_eos_ms)?;
            }
            if let Some(frame_size) = number("frame_size") {
                self.speech.frame_size = narrow("speech.frame_size", frame_size)?;
            }
            if let Some(interval) = number("frame_interval_ms") {
                self.speech.frame_interval_ms = interval;
            }
            if let Some(timeout) = number("connect_timeout_secs") {
                self.speech.connect_timeout_secs = timeout;
            }
            if let Some(timeout) = number("receive_timeout_secs") {
                self.speech.receive_timeout_secs = timeout;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Copy of this configuration that is safe to return over HTTP or log.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        copy.speech.api_key = mask_secret(&copy.speech.api_key);
        copy.speech.api_secret = mask_secret(&copy.speech.api_secret);
        copy
    }
}

impl SpeechConfig {
    /// True when all three credential values are non-empty.
    pub fn has_credentials(&self) -> bool {
        self.credential().is_complete()
    }

    pub fn credential(&self) -> Credential {
        Credential {
            app_id: self.app_id.clone(),
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
        }
    }

    /// Build the per-request gateway settings from this section.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            credential: self.credential(),
            endpoint: Endpoint {
                scheme: self.scheme.clone(),
                host: self.host.clone(),
                path: self.path.clone(),
            },
            session: SessionParameters {
                language: self.language.clone(),
                domain: self.domain.clone(),
                accent: self.accent.clone(),
                vad_eos: self.vad_eos_ms,
                dwa: self.dwa.clone(),
            },
            frame_size: self.frame_size,
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            receive_timeout: Duration::from_secs(self.receive_timeout_secs),
        }
    }
}

/// Fit a JSON number into the field's type, rejecting values that would wrap.
fn narrow<T: TryFrom<u64>>(key: &str, value: u64) -> Result<T> {
    T::try_from(value).map_err(|_| anyhow::anyhow!("{} is out of range: {}", key, value))
}

/// Hide all but the last four characters of a secret.
fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count == 0 {
        return String::new();
    }
    if count <= 4 {
        return "****".to_string();
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("****{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.limits.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.speech.frame_size, 1280);
        assert_eq!(config.speech.frame_interval_ms, 40);
        assert_eq!(config.speech.receive_timeout_secs, 15);
        assert!(config.validate().is_ok());
        // No credentials out of the box, but that is not a validation failure
        assert!(!config.speech.has_credentials());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.speech.frame_size = 1279;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.speech.receive_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "speech": {"vad_eos_ms": 3000, "language": "en_us"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.speech.vad_eos_ms, 3000);
        assert_eq!(config.speech.language, "en_us");
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_ignores_credentials() {
        let mut config = AppConfig::default();
        let json = r#"{"speech": {"api_secret": "stolen", "app_id": "x"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert!(config.speech.api_secret.is_empty());
        assert!(config.speech.app_id.is_empty());
    }

    #[test]
    fn test_config_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        let json = r#"{"speech": {"frame_size": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_config_update_rejects_out_of_range_numbers() {
        let mut config = AppConfig::default();
        let err = config
            .update_from_json(r#"{"server": {"port": 70000}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("server.port"));
        assert_eq!(config.server.port, 8000);

        let json = r#"{"speech": {"vad_eos_ms": 4294972296}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.speech.vad_eos_ms, 5000);
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut config = AppConfig::default();
        config.speech.app_id = "5f3a9c01".to_string();
        config.speech.api_key = "abcdef123456".to_string();
        config.speech.api_secret = "xyz".to_string();

        let redacted = config.redacted();
        assert_eq!(redacted.speech.app_id, "5f3a9c01");
        assert_eq!(redacted.speech.api_key, "****3456");
        assert_eq!(redacted.speech.api_secret, "****");
    }

    #[test]
    fn test_gateway_config_mapping() {
        let mut config = AppConfig::default();
        config.speech.app_id = "app".to_string();
        config.speech.api_key = "key".to_string();
        config.speech.api_secret = "secret".to_string();

        let gateway = config.speech.gateway_config();
        assert!(gateway.credential.is_complete());
        assert_eq!(gateway.endpoint.base_url(), "wss://iat-api.xfyun.cn/v2/iat");
        assert_eq!(gateway.session.vad_eos, 5000);
        assert_eq!(gateway.frame_interval, Duration::from_millis(40));
        assert_eq!(gateway.receive_timeout, Duration::from_secs(15));
    }
}
