use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Default maximum simultaneous transfers
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default lifetime requested for new presigned URLs (1 hour)
pub const DEFAULT_PRESIGN_EXPIRES_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadConfig {
    /// Max simultaneous transfers.
    pub concurrency: usize,
    /// Automatic attempts after the first failure before a task stays in `error`.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Presigned URLs are refreshed this long before they expire.
    pub safety_margin_ms: u64,
    pub presign_expires_secs: u64,
    pub max_file_size_bytes: Option<u64>,
    /// Exact MIME types or `type/*` patterns. Empty allows everything.
    pub allowed_mime_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: 2,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            safety_margin_ms: 30_000,
            presign_expires_secs: DEFAULT_PRESIGN_EXPIRES_SECS,
            max_file_size_bytes: None,
            allowed_mime_types: Vec::new(),
        }
    }
}

impl UploadConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: UploadConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if i64::try_from(self.safety_margin_ms).is_err() {
            return Err(ConfigError::Invalid(format!(
                "safetyMarginMs ({}) is out of range",
                self.safety_margin_ms
            )));
        }
        if self.presign_expires_secs.saturating_mul(1000) <= self.safety_margin_ms {
            return Err(ConfigError::Invalid(format!(
                "presignExpiresSecs ({}s) must exceed safetyMarginMs ({}ms)",
                self.presign_expires_secs, self.safety_margin_ms
            )));
        }
        Ok(())
    }

    /// Delay before retry number `retry_count + 1`: base * 2^retry_count, capped.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn safety_margin(&self) -> chrono::Duration {
        i64::try_from(self.safety_margin_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = UploadConfig {
            backoff_base_ms: 500,
            backoff_max_ms: 3_000,
            ..UploadConfig::default()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(3_000));
        assert_eq!(config.backoff_delay(70), Duration::from_millis(3_000));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = UploadConfig::from_json(
            r#"{"concurrency": 2, "allowedMimeTypes": ["image/*"], "maxFileSizeBytes": 1024}"#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.allowed_mime_types, vec!["image/*".to_string()]);
        assert_eq!(config.max_file_size_bytes, Some(1024));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = UploadConfig::from_json(r#"{"concurrency": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn safety_margin_past_i64_is_rejected() {
        let config = UploadConfig {
            safety_margin_ms: i64::MAX as u64 + 1,
            presign_expires_secs: u64::MAX,
            ..UploadConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(message) if message.contains("safetyMarginMs")));
        assert_eq!(config.safety_margin(), chrono::Duration::MAX);
    }
}
