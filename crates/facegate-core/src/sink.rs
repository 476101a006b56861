//! Presentation boundary. The gate reports progress through [`UiSink`] and
//! never renders anything itself.

use tokio::sync::mpsc;

use crate::detector::DetectionResult;
use crate::session::GateState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    /// Camera preview with the face status line.
    Capture,
    /// Credential form shown after a successful capture.
    Login,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub offer_retry: bool,
}

pub trait UiSink: Send + 'static {
    fn on_status(&mut self, message: &str, level: StatusLevel);

    fn on_screen_change(&mut self, screen: Screen);

    fn on_show_alert(&mut self, alert: Alert);

    /// Every state the gate enters, in order.
    fn on_state(&mut self, _state: GateState) {}

    /// Raw poll results, for drawing boxes and landmarks over the preview.
    fn on_detections(&mut self, _result: &DetectionResult) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Status { message: String, level: StatusLevel },
    Screen(Screen),
    Alert(Alert),
    State(GateState),
    Faces(usize),
}

/// Forwards every callback as a [`UiEvent`].
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: UiEvent) {
        // Receiver gone means nobody is watching any more.
        let _ = self.tx.send(event);
    }
}

impl UiSink for ChannelSink {
    fn on_status(&mut self, message: &str, level: StatusLevel) {
        self.emit(UiEvent::Status {
            message: message.to_string(),
            level,
        });
    }

    fn on_screen_change(&mut self, screen: Screen) {
        self.emit(UiEvent::Screen(screen));
    }

    fn on_show_alert(&mut self, alert: Alert) {
        self.emit(UiEvent::Alert(alert));
    }

    fn on_state(&mut self, state: GateState) {
        self.emit(UiEvent::State(state));
    }

    fn on_detections(&mut self, result: &DetectionResult) {
        self.emit(UiEvent::Faces(result.face_count()));
    }
}
