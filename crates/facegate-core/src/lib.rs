//! Face-gated capture and verification.
//!
//! The [`session::GateSession`] actor drives a camera and a face detector
//! through setup, polling, stabilization and a final still-frame check, and
//! reports progress through a [`sink::UiSink`].

pub mod auth;
pub mod camera;
pub mod config;
pub mod detector;
pub mod replay;
pub mod session;
pub mod sink;
pub mod timers;

pub use camera::{CameraError, CameraSource, CameraStream, Frame};
pub use config::{ConfigError, GateConfig};
pub use detector::{DetectionResult, DetectorAdapter, DetectorOptions, FaceModel};
pub use session::{GateError, GateSession, GateSnapshot, GateState, VerificationOutcome};
pub use sink::{ChannelSink, UiEvent, UiSink};
