use crate::app::events::EventBus;
use crate::domain::events::topics;
use crate::ports::kernel::{Kernel, KernelCall};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const JOB_TYPES: &[&str] = &[
    "spawn",
    "checkpoint",
    "export",
    "import",
    "restore",
    "pipeline",
    "scan",
];
pub const JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("unknown job type '{0}'")]
    UnknownType(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {id} already {status}")]
    Finished { id: String, status: JobStatus },
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub params: Value,
}

/// Runs long operations as `jobs.<type>` kernel calls in the background.
/// Jobs live in memory only.
pub struct JobService {
    kernel: Arc<dyn Kernel>,
    bus: Arc<EventBus>,
    jobs: RwLock<HashMap<String, Job>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl JobService {
    pub fn new(kernel: Arc<dyn Kernel>, bus: Arc<EventBus>) -> Self {
        Self {
            kernel,
            bus,
            jobs: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout: JOB_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn submit(self: &Arc<Self>, request: NewJob) -> Result<Job, JobError> {
        let job_type = request.job_type.trim().to_ascii_lowercase();
        if !JOB_TYPES.contains(&job_type.as_str()) {
            return Err(JobError::UnknownType(request.job_type));
        }
        let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let job = Job {
            id: id.clone(),
            job_type,
            status: JobStatus::Pending,
            session: request.session.filter(|session| !session.is_empty()),
            params: if request.params.is_null() {
                json!({})
            } else {
                request.params
            },
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), job.clone());
        self.emit("job.created", &job);
        info!(job = %id, kind = %job.job_type, "job submitted");

        let service = self.clone();
        let handle = tokio::spawn(async move { service.execute(id).await });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id.clone(), handle);
        Ok(job)
    }

    async fn execute(self: Arc<Self>, id: String) {
        let Some(started) = self.transition(&id, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        }) else {
            return;
        };
        self.emit("job.started", &started);

        let call = KernelCall::new(format!("jobs.{}", started.job_type))
            .args(json!({
                "job_id": started.id,
                "session": started.session,
                "params": started.params,
            }))
            .timeout(self.timeout);
        let outcome = self.kernel.call(call).await;

        let finished = self.transition(&id, |job| {
            job.finished_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    job.status = JobStatus::Completed;
                    job.result = Some(result);
                }
                Err(err) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(err.to_string());
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(job) = finished {
            match job.status {
                JobStatus::Completed => self.emit("job.completed", &job),
                _ => {
                    warn!(job = %job.id, error = ?job.error, "job failed");
                    self.emit("job.failed", &job)
                }
            }
        }
    }

    /// Applies `change` unless the job already finished (cancelled jobs stay
    /// cancelled).
    fn transition(&self, id: &str, change: impl FnOnce(&mut Job)) -> Option<Job> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get_mut(id)?;
        if job.status.is_finished() {
            return None;
        }
        change(job);
        Some(job.clone())
    }

    pub fn get(&self, id: &str) -> Result<Job, JobError> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Jobs in submission order, optionally filtered by status.
    pub fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|job| status.map_or(true, |status| job.status == status))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job_number(&job.id));
        jobs
    }

    pub fn cancel(&self, id: &str) -> Result<Job, JobError> {
        let job = {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            if job.status.is_finished() {
                return Err(JobError::Finished {
                    id: id.to_string(),
                    status: job.status,
                });
            }
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(Utc::now());
            job.clone()
        };
        if let Some(handle) = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
        {
            handle.abort();
        }
        info!(job = %id, "job cancelled");
        self.emit("job.cancelled", &job);
        Ok(job)
    }

    /// Aborts every running job task.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, handle) in tasks {
            handle.abort();
        }
    }

    fn emit(&self, event_type: &str, job: &Job) {
        let data = serde_json::to_value(job).unwrap_or_else(|_| json!({ "id": job.id }));
        self.bus
            .publish_all(&[&topics::job(&job.id), topics::JOBS], event_type, data);
    }
}

fn job_number(id: &str) -> u64 {
    id.strip_prefix("job-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}
