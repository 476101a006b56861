//! Headless gate runs against a replay script.

use anyhow::{Context, Result};
use facegate_core::detector::DetectorAdapter;
use facegate_core::replay::ReplayScript;
use facegate_core::sink::{Screen, StatusLevel, UiEvent};
use facegate_core::{ChannelSink, GateConfig, GateSession};
use std::path::Path;
use tokio::time::Instant;

/// How a headless run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRun {
    /// The gate handed off to the login screen.
    Passed { attempts: usize },
    /// Every allowed attempt ended in a failure alert.
    Failed { attempts: usize },
}

impl GateRun {
    pub fn passed(self) -> bool {
        matches!(self, GateRun::Passed { .. })
    }
}

pub fn load_script(path: &Path) -> Result<ReplayScript> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    ReplayScript::from_toml(&text).with_context(|| format!("invalid replay script {}", path.display()))
}

/// Drive a gate until it passes or `max_attempts` attempts have failed.
/// Every UI event is handed to `on_event` with the time since start.
pub async fn run_gate(
    script: &ReplayScript,
    max_attempts: usize,
    mut on_event: impl FnMut(u128, &UiEvent),
) -> Result<GateRun> {
    let mut config = GateConfig::from_env();
    script.timing.apply(&mut config);
    let (model, camera, stats) = script.build();
    let (sink, mut events) = ChannelSink::new();
    let detector = DetectorAdapter::new(model, config.detector);
    let gate = GateSession::spawn(config, detector, camera, sink)?;
    gate.start()?;

    let started = Instant::now();
    let max_attempts = max_attempts.max(1);
    let mut failures = 0;
    let outcome = loop {
        let Some(event) = events.recv().await else {
            break GateRun::Failed { attempts: failures };
        };
        on_event(started.elapsed().as_millis(), &event);
        match event {
            UiEvent::Screen(Screen::Login) => break GateRun::Passed { attempts: failures + 1 },
            UiEvent::Alert(_) => {
                failures += 1;
                if failures >= max_attempts {
                    break GateRun::Failed { attempts: failures };
                }
            }
            _ => {}
        }
    };

    gate.dispose().await;
    tracing::debug!(
        opens = stats.camera_opens(),
        stills = stats.still_captures(),
        polls = stats.live_detections(),
        "replay finished"
    );
    Ok(outcome)
}

pub fn print_event(elapsed_ms: u128, event: &UiEvent) {
    match event {
        UiEvent::Status { message, level } => {
            let level = match level {
                StatusLevel::Loading => "loading",
                StatusLevel::Success => "success",
                StatusLevel::Error => "error",
            };
            println!("[{elapsed_ms:>6}ms] status  {level:<7} {message}");
        }
        UiEvent::State(state) => println!("[{elapsed_ms:>6}ms] state   {state:?}"),
        UiEvent::Screen(screen) => println!("[{elapsed_ms:>6}ms] screen  {screen:?}"),
        UiEvent::Alert(alert) => println!(
            "[{elapsed_ms:>6}ms] alert   {}: {}{}",
            alert.title,
            alert.message,
            if alert.offer_retry { " [retry]" } else { "" }
        ),
        // Per-tick face counts are too noisy to print.
        UiEvent::Faces(_) => {}
    }
}

/// `facegate simulate`.
pub async fn run(script: &Path, attempts: usize) -> Result<()> {
    let script = load_script(script)?;
    match run_gate(&script, attempts, print_event).await? {
        GateRun::Passed { attempts } => println!("gate passed after {attempts} attempt(s)"),
        GateRun::Failed { attempts } => println!("gate failed {attempts} attempt(s)"),
    }
    Ok(())
}
