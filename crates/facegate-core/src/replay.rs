//! Scripted camera and face model for running the gate without hardware.
//!
//! A [`ReplayScript`] lists how many faces the "model" reports for successive
//! live frames and still captures. Scripts load from TOML:
//!
//! ```toml
//! live = [{ faces = 0, ticks = 20 }, { faces = 1, ticks = 15 }]
//! still = [{ faces = 1 }]
//!
//! [timing]
//! no_face_timeout_ms = 10000
//! ```
//!
//! The last segment of each list repeats forever.

use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::camera::{CameraConstraints, CameraError, CameraSource, CameraStream, Frame, FrameSource};
use crate::config::GateConfig;
use crate::detector::{BoundingBox, DetectorError, FaceLandmarks, FaceModel, LoadError, Point, RawFace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Segment {
    pub faces: usize,
    #[serde(default = "one")]
    pub ticks: usize,
}

fn one() -> usize {
    1
}

/// Optional overrides applied on top of a [`GateConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TimingOverrides {
    pub poll_interval_ms: Option<u64>,
    pub stabilization_ms: Option<u64>,
    pub no_face_timeout_ms: Option<u64>,
    pub success_display_ms: Option<u64>,
    pub auto_restart_ms: Option<u64>,
    pub retry_settle_ms: Option<u64>,
}

impl TimingOverrides {
    pub fn apply(&self, config: &mut GateConfig) {
        let set = |slot: &mut Duration, ms: Option<u64>| {
            if let Some(ms) = ms {
                *slot = Duration::from_millis(ms);
            }
        };
        set(&mut config.poll_interval, self.poll_interval_ms);
        set(&mut config.stabilization_delay, self.stabilization_ms);
        set(&mut config.no_face_timeout, self.no_face_timeout_ms);
        set(&mut config.success_display_delay, self.success_display_ms);
        set(&mut config.auto_restart_delay, self.auto_restart_ms);
        set(&mut config.retry_settle_delay, self.retry_settle_ms);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReplayScript {
    #[serde(default)]
    pub live: Vec<Segment>,
    #[serde(default)]
    pub still: Vec<Segment>,
    /// Make every model load fail.
    #[serde(default)]
    pub fail_model_load: bool,
    /// Refuse camera access.
    #[serde(default)]
    pub deny_camera: bool,
    /// Hand out frames whose buffer does not match their size.
    #[serde(default)]
    pub corrupt_frames: bool,
    #[serde(default)]
    pub timing: TimingOverrides,
}

impl ReplayScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Append `ticks` live frames showing `faces` faces.
    pub fn live(mut self, faces: usize, ticks: usize) -> Self {
        self.live.push(Segment { faces, ticks });
        self
    }

    /// Append a still capture showing `faces` faces.
    pub fn still(mut self, faces: usize) -> Self {
        self.still.push(Segment { faces, ticks: 1 });
        self
    }

    pub fn fail_model_load(mut self) -> Self {
        self.fail_model_load = true;
        self
    }

    pub fn deny_camera(mut self) -> Self {
        self.deny_camera = true;
        self
    }

    pub fn corrupt_frames(mut self) -> Self {
        self.corrupt_frames = true;
        self
    }

    pub fn with_timing(mut self, timing: TimingOverrides) -> Self {
        self.timing = timing;
        self
    }

    /// Build the scripted model and camera plus the counters they share.
    pub fn build(&self) -> (ScriptedModel, ScriptedCamera, ReplayStats) {
        let stats = ReplayStats::default();
        let model = ScriptedModel {
            live: Sequence::new(&self.live),
            still: Sequence::new(&self.still),
            fail_load: self.fail_model_load,
            stats: stats.clone(),
        };
        let camera = ScriptedCamera {
            deny: self.deny_camera,
            corrupt: self.corrupt_frames,
            stats: stats.clone(),
        };
        (model, camera, stats)
    }
}

/// Expanded run-length list; the final value repeats once exhausted.
#[derive(Debug, Clone)]
struct Sequence {
    values: Vec<usize>,
    pos: usize,
}

impl Sequence {
    fn new(segments: &[Segment]) -> Self {
        let values = segments
            .iter()
            .flat_map(|s| std::iter::repeat(s.faces).take(s.ticks))
            .collect();
        Self { values, pos: 0 }
    }

    fn advance(&mut self) -> usize {
        let Some(last) = self.values.len().checked_sub(1) else {
            return 0;
        };
        let value = self.values[self.pos.min(last)];
        self.pos += 1;
        value
    }
}

#[derive(Debug, Default)]
struct Counters {
    model_loads: AtomicUsize,
    camera_opens: AtomicUsize,
    camera_stops: AtomicUsize,
    still_captures: AtomicUsize,
    live_detections: AtomicUsize,
}

/// Shared counters observed by tests and the CLI.
#[derive(Debug, Clone, Default)]
pub struct ReplayStats(Arc<Counters>);

impl ReplayStats {
    pub fn model_loads(&self) -> usize {
        self.0.model_loads.load(Ordering::SeqCst)
    }

    pub fn camera_opens(&self) -> usize {
        self.0.camera_opens.load(Ordering::SeqCst)
    }

    pub fn camera_stops(&self) -> usize {
        self.0.camera_stops.load(Ordering::SeqCst)
    }

    pub fn still_captures(&self) -> usize {
        self.0.still_captures.load(Ordering::SeqCst)
    }

    pub fn live_detections(&self) -> usize {
        self.0.live_detections.load(Ordering::SeqCst)
    }
}

pub struct ScriptedModel {
    live: Sequence,
    still: Sequence,
    fail_load: bool,
    stats: ReplayStats,
}

impl FaceModel for ScriptedModel {
    async fn load(&mut self) -> Result<(), LoadError> {
        self.stats.0.model_loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(LoadError::Unavailable("scripted load failure".into()));
        }
        Ok(())
    }

    async fn infer(&mut self, frame: &Frame) -> Result<Vec<RawFace>, DetectorError> {
        let count = match frame.source {
            FrameSource::Live => {
                self.stats.0.live_detections.fetch_add(1, Ordering::SeqCst);
                self.live.advance()
            }
            FrameSource::Still => self.still.advance(),
        };
        Ok((0..count).map(synthetic_face).collect())
    }
}

fn synthetic_face(index: usize) -> RawFace {
    let x = 8.0 + index as f32 * 20.0;
    RawFace {
        bbox: BoundingBox {
            x,
            y: 8.0,
            width: 16.0,
            height: 20.0,
        },
        score: 0.9,
        landmarks: (0..FaceLandmarks::POINT_COUNT)
            .map(|i| Point {
                x: x + (i % 16) as f32,
                y: 8.0 + (i / 4) as f32,
            })
            .collect(),
    }
}

const REPLAY_WIDTH: u32 = 64;
const REPLAY_HEIGHT: u32 = 48;

pub struct ScriptedCamera {
    deny: bool,
    corrupt: bool,
    stats: ReplayStats,
}

impl CameraSource for ScriptedCamera {
    type Stream = ScriptedStream;

    async fn open(&mut self, _constraints: &CameraConstraints) -> Result<ScriptedStream, CameraError> {
        self.stats.0.camera_opens.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(CameraError::PermissionDenied);
        }
        Ok(ScriptedStream {
            corrupt: self.corrupt,
            stats: self.stats.clone(),
        })
    }
}

pub struct ScriptedStream {
    corrupt: bool,
    stats: ReplayStats,
}

impl ScriptedStream {
    fn frame(&self, source: FrameSource) -> Frame {
        if self.corrupt {
            return Frame::rgb(REPLAY_WIDTH, REPLAY_HEIGHT, vec![0; 3], source);
        }
        Frame::blank(REPLAY_WIDTH, REPLAY_HEIGHT, source)
    }
}

impl CameraStream for ScriptedStream {
    fn dimensions(&self) -> (u32, u32) {
        (REPLAY_WIDTH, REPLAY_HEIGHT)
    }

    fn live_frame(&mut self) -> Result<Frame, CameraError> {
        Ok(self.frame(FrameSource::Live))
    }

    fn capture_still(&mut self) -> Result<Frame, CameraError> {
        self.stats.0.still_captures.fetch_add(1, Ordering::SeqCst);
        Ok(self.frame(FrameSource::Still))
    }

    fn stop(&mut self) {
        self.stats.0.camera_stops.fetch_add(1, Ordering::SeqCst);
    }
}
