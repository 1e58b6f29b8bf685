//! Voice channel configuration.
//!
//! Defaults match a local `voice-relay` (signaling on 8000, roster on 8001).
//! Any field can be overridden from JSON or from `STACKNOTE_VOICE_*`
//! environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VoiceError;
use crate::ice::{default_stun_servers, IceServerConfig};

/// Analyser parameters (same meaning as a Web Audio `AnalyserNode`)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyserConfig {
    /// FFT window in samples, power of two
    pub fft_size: usize,
    /// Averaging constant between consecutive frames (0.0 - 1.0)
    pub smoothing: f32,
    /// Magnitude mapped to byte value 0
    pub min_decibels: f32,
    /// Magnitude mapped to byte value 255
    pub max_decibels: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

/// Top-level configuration for a voice client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Base WebSocket URL of the signaling relay; room and session are appended
    pub signaling_url: String,
    /// Base HTTP URL of the roster endpoint
    pub roster_url: String,
    /// ICE servers used by every peer connection
    pub ice_servers: Vec<IceServerConfig>,
    /// Average byte magnitude above which a participant counts as speaking
    pub speaking_threshold: f32,
    /// Delay before the speaking loop samples again
    pub tick_interval_ms: u64,
    /// Roster polling period
    pub roster_poll_ms: u64,
    pub analyser: AnalyserConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8000/ws".to_string(),
            roster_url: "http://localhost:8001".to_string(),
            ice_servers: default_stun_servers(),
            speaking_threshold: 15.0,
            tick_interval_ms: 16,
            roster_poll_ms: 3000,
            analyser: AnalyserConfig::default(),
        }
    }
}

impl VoiceConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, VoiceError> {
        let config: VoiceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `STACKNOTE_VOICE_*` environment variables
    pub fn from_env() -> Result<Self, VoiceError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, VoiceError> {
        let mut config = VoiceConfig::default();

        if let Some(url) = lookup("STACKNOTE_VOICE_SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Some(url) = lookup("STACKNOTE_VOICE_ROSTER_URL") {
            config.roster_url = url;
        }
        if let Some(url) = lookup("STACKNOTE_VOICE_STUN_URL") {
            config.ice_servers = vec![IceServerConfig::stun(&url)];
        }
        if let Some(raw) = lookup("STACKNOTE_VOICE_SPEAKING_THRESHOLD") {
            config.speaking_threshold = raw.parse().map_err(|_| {
                VoiceError::Config(format!("STACKNOTE_VOICE_SPEAKING_THRESHOLD is not a number: {}", raw))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the rest of the crate cannot work with
    pub fn validate(&self) -> Result<(), VoiceError> {
        let signaling = url::Url::parse(&self.signaling_url)
            .map_err(|e| VoiceError::Config(format!("signaling_url: {}", e)))?;
        if signaling.scheme() != "ws" && signaling.scheme() != "wss" {
            return Err(VoiceError::Config(format!(
                "signaling_url must be ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        let roster = url::Url::parse(&self.roster_url)
            .map_err(|e| VoiceError::Config(format!("roster_url: {}", e)))?;
        if roster.scheme() != "http" && roster.scheme() != "https" {
            return Err(VoiceError::Config(format!(
                "roster_url must be http:// or https://, got {}",
                self.roster_url
            )));
        }

        let fft = self.analyser.fft_size;
        if fft < 32 || !fft.is_power_of_two() {
            return Err(VoiceError::Config(format!(
                "analyser.fft_size must be a power of two >= 32, got {}",
                fft
            )));
        }
        if !(0.0..=1.0).contains(&self.analyser.smoothing) {
            return Err(VoiceError::Config("analyser.smoothing must be within 0..=1".to_string()));
        }
        if self.analyser.min_decibels >= self.analyser.max_decibels {
            return Err(VoiceError::Config(
                "analyser.min_decibels must be below max_decibels".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(VoiceError::Config("tick_interval_ms must be non-zero".to_string()));
        }
        if self.roster_poll_ms == 0 {
            return Err(VoiceError::Config("roster_poll_ms must be non-zero".to_string()));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn roster_poll_interval(&self) -> Duration {
        Duration::from_millis(self.roster_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = VoiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_millis(16));
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = VoiceConfig::from_json(r#"{"speaking_threshold": 22.5, "analyser": {"fft_size": 512}}"#)
            .unwrap();
        assert_eq!(config.speaking_threshold, 22.5);
        assert_eq!(config.analyser.fft_size, 512);
        assert_eq!(config.analyser.smoothing, 0.8);
        assert_eq!(config.signaling_url, "ws://localhost:8000/ws");
    }

    #[test]
    fn test_rejects_http_signaling_url() {
        let err = VoiceConfig::from_json(r#"{"signaling_url": "http://localhost:8000/ws"}"#).unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_fft_size() {
        let mut config = VoiceConfig::default();
        config.analyser.fft_size = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STACKNOTE_VOICE_SIGNALING_URL", "wss://voice.example.com/ws"),
            ("STACKNOTE_VOICE_STUN_URL", "stun:stun.example.com:3478"),
            ("STACKNOTE_VOICE_SPEAKING_THRESHOLD", "30"),
        ]
        .into_iter()
        .collect();

        let config = VoiceConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.signaling_url, "wss://voice.example.com/ws");
        assert_eq!(config.ice_servers[0].urls[0], "stun:stun.example.com:3478");
        assert_eq!(config.speaking_threshold, 30.0);
    }

    #[test]
    fn test_env_threshold_must_parse() {
        let err = VoiceConfig::from_lookup(|k| {
            (k == "STACKNOTE_VOICE_SPEAKING_THRESHOLD").then(|| "loud".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("loud"));
    }
}
