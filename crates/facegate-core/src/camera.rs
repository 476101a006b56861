//! Camera capture contract and the owned camera session.
//!
//! The gate never talks to capture hardware directly. A [`CameraSource`]
//! hands out a [`CameraStream`] when access is granted, and the gate wraps it
//! in a [`CameraSession`] so that every exit path stops the underlying tracks.

use std::future::Future;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("camera stream already stopped")]
    Stopped,
}

/// Where a frame came from: the running video feed or a single still grab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Live,
    Still,
}

/// A packed RGB8 image.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub source: FrameSource,
    pub captured_at: Instant,
}

impl Frame {
    pub fn rgb(width: u32, height: u32, data: Vec<u8>, source: FrameSource) -> Self {
        Self {
            width,
            height,
            data,
            source,
            captured_at: Instant::now(),
        }
    }

    /// A black frame of the given size.
    pub fn blank(width: u32, height: u32, source: FrameSource) -> Self {
        let len = width as usize * height as usize * 3;
        Self::rgb(width, height, vec![0; len], source)
    }

    /// Non-zero dimensions and a buffer that matches them.
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == self.width as usize * self.height as usize * 3
    }
}

/// Which way the requested camera should face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

/// Preferred capture settings passed to [`CameraSource::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing: FacingMode,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 640,
            ideal_height: 480,
            facing: FacingMode::User,
        }
    }
}

/// Read-only view of the camera handed to display code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraInfo {
    pub active: bool,
    pub width: u32,
    pub height: u32,
}

/// Grants access to a camera.
pub trait CameraSource: Send + 'static {
    type Stream: CameraStream;

    /// Request access and start streaming. May suspend while the user
    /// answers a permission prompt.
    fn open(
        &mut self,
        constraints: &CameraConstraints,
    ) -> impl Future<Output = Result<Self::Stream, CameraError>> + Send;
}

/// A running video stream.
pub trait CameraStream: Send + 'static {
    /// Negotiated frame size.
    fn dimensions(&self) -> (u32, u32);

    /// The frame currently shown by the live feed.
    fn live_frame(&mut self) -> Result<Frame, CameraError>;

    /// Grab a single still frame for the final check.
    fn capture_still(&mut self) -> Result<Frame, CameraError>;

    /// Stop every underlying track. Called exactly once per stream.
    fn stop(&mut self);
}

/// The gate's exclusive handle on an acquired stream.
///
/// Release is idempotent and also happens on drop, so a session can never
/// outlive its owner with the hardware still running.
pub struct CameraSession<S: CameraStream> {
    stream: S,
    active: bool,
}

impl<S: CameraStream> CameraSession<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            active: true,
        }
    }

    pub fn info(&self) -> CameraInfo {
        let (width, height) = self.stream.dimensions();
        CameraInfo {
            active: self.active,
            width,
            height,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn live_frame(&mut self) -> Result<Frame, CameraError> {
        if !self.active {
            return Err(CameraError::Stopped);
        }
        self.stream.live_frame()
    }

    pub fn capture_still(&mut self) -> Result<Frame, CameraError> {
        if !self.active {
            return Err(CameraError::Stopped);
        }
        self.stream.capture_still()
    }

    pub fn release(&mut self) {
        if self.active {
            self.stream.stop();
            self.active = false;
            tracing::debug!("camera released");
        }
    }
}

impl<S: CameraStream> Drop for CameraSession<S> {
    fn drop(&mut self) {
        self.release();
    }
}
