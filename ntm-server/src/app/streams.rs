use crate::app::events::EventBus;
use crate::app::tasks::PeriodicTask;
use crate::domain::events::topics;
use crate::ports::kernel::{Kernel, KernelCall};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);
const POLL_LINES: u32 = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("no stream for pane {pane} of session {session}")]
    NotFound { session: String, pane: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub session: String,
    pub pane: u32,
    pub topic: String,
    pub interval_ms: u64,
    pub started_at: DateTime<Utc>,
}

pub fn clamp_interval(requested: Option<Duration>) -> Duration {
    requested
        .unwrap_or(DEFAULT_POLL_INTERVAL)
        .clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

struct Running {
    info: StreamInfo,
    task: PeriodicTask,
}

/// Pane output pollers publishing `pane.output` on `panes:<session>:<idx>`.
pub struct PaneStreams {
    kernel: Arc<dyn Kernel>,
    bus: Arc<EventBus>,
    streams: Mutex<HashMap<(String, u32), Running>>,
}

impl PaneStreams {
    pub fn new(kernel: Arc<dyn Kernel>, bus: Arc<EventBus>) -> Self {
        Self {
            kernel,
            bus,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a poller, or returns the running one unchanged. The flag is
    /// true when a new stream was started.
    pub fn start(&self, session: &str, pane: u32, interval: Option<Duration>) -> (StreamInfo, bool) {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (session.to_string(), pane);
        if let Some(running) = streams.get(&key) {
            return (running.info.clone(), false);
        }

        let every = clamp_interval(interval);
        let info = StreamInfo {
            session: session.to_string(),
            pane,
            topic: topics::pane(session, pane),
            interval_ms: every.as_millis() as u64,
            started_at: Utc::now(),
        };
        let task = self.spawn_poller(info.clone(), every);
        info!(session, pane, interval_ms = info.interval_ms, "pane stream started");
        streams.insert(key, Running {
            info: info.clone(),
            task,
        });
        (info, true)
    }

    fn spawn_poller(&self, info: StreamInfo, every: Duration) -> PeriodicTask {
        let kernel = self.kernel.clone();
        let bus = self.bus.clone();
        let previous = Arc::new(Mutex::new(Vec::<String>::new()));
        PeriodicTask::spawn("pane-stream", every, move || {
            let kernel = kernel.clone();
            let bus = bus.clone();
            let previous = previous.clone();
            let info = info.clone();
            async move {
                let call = KernelCall::new("panes.output").args(json!({
                    "session": info.session,
                    "pane": info.pane,
                    "lines": POLL_LINES,
                }));
                let output = match kernel.call(call).await {
                    Ok(output) => output,
                    Err(err) => {
                        debug!(session = %info.session, pane = info.pane, %err, "pane poll failed");
                        return;
                    }
                };
                let current = output_lines(&output);
                let fresh = {
                    let mut previous = previous.lock().unwrap_or_else(PoisonError::into_inner);
                    let fresh = new_lines(&previous, &current);
                    *previous = current;
                    fresh
                };
                if !fresh.is_empty() {
                    bus.publish(
                        &info.topic,
                        "pane.output",
                        json!({"session": info.session, "pane": info.pane, "lines": fresh}),
                    );
                }
            }
        })
    }

    pub async fn stop(&self, session: &str, pane: u32) -> Result<StreamInfo, StreamError> {
        let running = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(session.to_string(), pane))
            .ok_or_else(|| StreamError::NotFound {
                session: session.to_string(),
                pane,
            })?;
        running.task.stop().await;
        info!(session, pane, "pane stream stopped");
        Ok(running.info)
    }

    pub fn list(&self) -> Vec<StreamInfo> {
        let mut infos: Vec<StreamInfo> = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|running| running.info.clone())
            .collect();
        infos.sort_by(|a, b| (&a.session, a.pane).cmp(&(&b.session, b.pane)));
        infos
    }

    pub async fn shutdown(&self) {
        let running: Vec<Running> = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, running)| running)
            .collect();
        for stream in running {
            stream.task.stop().await;
        }
    }
}

fn output_lines(output: &Value) -> Vec<String> {
    if let Some(lines) = output.get("lines").and_then(Value::as_array) {
        return lines
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    output
        .get("output")
        .and_then(Value::as_str)
        .map(|text| text.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Lines of `current` past the longest overlap between the tail of
/// `previous` and the head of `current`.
fn new_lines(previous: &[String], current: &[String]) -> Vec<String> {
    let max = previous.len().min(current.len());
    let overlap = (0..=max)
        .rev()
        .find(|&k| previous[previous.len() - k..] == current[..k])
        .unwrap_or(0);
    current[overlap..].to_vec()
}
