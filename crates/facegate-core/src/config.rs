use std::time::Duration;
use thiserror::Error;

use crate::camera::CameraConstraints;
use crate::detector::DetectorOptions;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("stabilization delay ({stabilization_ms} ms) must be shorter than the no-face timeout ({timeout_ms} ms)")]
    StabilizationTooLong { stabilization_ms: u64, timeout_ms: u64 },
    #[error("score threshold {0} is outside 0.0..=1.0")]
    ScoreThreshold(String),
}

/// Gate timing and detection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    /// Interval between detection polls while the camera is live.
    pub poll_interval: Duration,
    /// A single face must persist this long before the still capture.
    pub stabilization_delay: Duration,
    /// Time allowed in detection before giving up.
    pub no_face_timeout: Duration,
    /// How long the success message is shown before switching screens.
    pub success_display_delay: Duration,
    /// Delay before a failed session restarts by itself.
    pub auto_restart_delay: Duration,
    /// Pause after releasing the camera so the hardware is free again.
    pub retry_settle_delay: Duration,
    pub detector: DetectorOptions,
    pub camera: CameraConstraints,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stabilization_delay: Duration::from_millis(1000),
            no_face_timeout: Duration::from_millis(7000),
            success_display_delay: Duration::from_millis(1500),
            auto_restart_delay: Duration::from_millis(5000),
            retry_settle_delay: Duration::from_millis(500),
            detector: DetectorOptions::default(),
            camera: CameraConstraints::default(),
        }
    }
}

impl GateConfig {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_ms("FACEGATE_POLL_INTERVAL_MS", d.poll_interval),
            stabilization_delay: env_ms("FACEGATE_STABILIZATION_MS", d.stabilization_delay),
            no_face_timeout: env_ms("FACEGATE_NO_FACE_TIMEOUT_MS", d.no_face_timeout),
            success_display_delay: env_ms("FACEGATE_SUCCESS_DISPLAY_MS", d.success_display_delay),
            auto_restart_delay: env_ms("FACEGATE_AUTO_RESTART_MS", d.auto_restart_delay),
            retry_settle_delay: env_ms("FACEGATE_RETRY_SETTLE_MS", d.retry_settle_delay),
            detector: DetectorOptions {
                score_threshold: env_f32(
                    "FACEGATE_SCORE_THRESHOLD",
                    d.detector.score_threshold,
                ),
            },
            camera: d.camera,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("poll interval", self.poll_interval),
            ("stabilization delay", self.stabilization_delay),
            ("no-face timeout", self.no_face_timeout),
            ("auto-restart delay", self.auto_restart_delay),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.stabilization_delay >= self.no_face_timeout {
            return Err(ConfigError::StabilizationTooLong {
                stabilization_ms: self.stabilization_delay.as_millis() as u64,
                timeout_ms: self.no_face_timeout.as_millis() as u64,
            });
        }
        let t = self.detector.score_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(ConfigError::ScoreThreshold(t.to_string()));
        }
        Ok(())
    }
}

fn env_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
