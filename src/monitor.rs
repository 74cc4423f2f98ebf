//! Execution status monitoring against the processing service's HTTP API.
//!
//! The service owns the authoritative execution state and file counters;
//! the gateway fetches them fresh on every query and caches nothing. The
//! remote run is fire-and-forget with a server-side delay, so repeated
//! polls are the only way to observe the RUNNING to SUCCESS transition;
//! there is no push channel and no background polling here.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::error::MonitorError;

/// Remote execution state as reported by the processing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Waiting,
    Running,
    Success,
    Error,
}

impl RunState {
    fn from_remote(value: &str) -> Option<Self> {
        match value {
            "WAITING" => Some(RunState::Waiting),
            "RUNNING" => Some(RunState::Running),
            "SUCCESS" => Some(RunState::Success),
            "ERROR" => Some(RunState::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Waiting => write!(f, "WAITING"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Success => write!(f, "SUCCESS"),
            RunState::Error => write!(f, "ERROR"),
        }
    }
}

/// Result/error file counters owned by the processing service.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct FileCounters {
    /// Number of the most recent result file.
    #[serde(rename = "latest_result_file", default)]
    pub latest_result: u64,
    /// Number of the most recent error file.
    #[serde(rename = "latest_error_file", default)]
    pub latest_error: u64,
    /// Total files the service has produced.
    #[serde(rename = "total_files", default)]
    pub total: u64,
}

/// File name listings from the service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileListing {
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// A remote execution-status snapshot, valid only for the current
/// response cycle.
#[derive(Debug, Clone)]
pub struct ExecutionStatus {
    pub state: RunState,
    pub files: FileCounters,
    pub last_command: Option<String>,
}

impl ExecutionStatus {
    /// The synthetic status returned when the service cannot be reached:
    /// the protocol has no channel for transport-level failures, so they
    /// surface as an ERROR state.
    fn unreachable() -> Self {
        Self {
            state: RunState::Error,
            files: FileCounters::default(),
            last_command: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    status: String,
    #[serde(default)]
    last_command: Option<String>,
    #[serde(default)]
    latest_result_file: Option<u64>,
    #[serde(default)]
    latest_error_file: Option<u64>,
    #[serde(default)]
    total_files: Option<u64>,
}

/// Client for the processing service's status API.
pub struct ExecutionMonitor {
    http: Client,
    api_base: String,
}

impl ExecutionMonitor {
    /// Creates a monitor for the service at `api_base`
    /// (e.g. "http://localhost:3000"); every request carries `timeout`.
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client"),
            api_base: api_base.into(),
        }
    }

    /// Kicks off a payload run. The service answers immediately; progress
    /// is observed through [`poll`](Self::poll).
    pub async fn trigger_run(&self) -> Result<(), MonitorError> {
        self.post("/RUN-MODEL").await
    }

    /// Fetches the current execution status.
    ///
    /// Transport failures and undecodable answers degrade to a synthetic
    /// ERROR status instead of failing the command.
    pub async fn poll(&self) -> ExecutionStatus {
        let payload: StatusPayload = match self.get_json("/MODEL-EXECUTION-STATUS").await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "status poll failed");
                return ExecutionStatus::unreachable();
            }
        };

        let state = RunState::from_remote(&payload.status).unwrap_or_else(|| {
            warn!(status = %payload.status, "service reported an unknown state");
            RunState::Error
        });

        ExecutionStatus {
            state,
            files: FileCounters {
                latest_result: payload.latest_result_file.unwrap_or(0),
                latest_error: payload.latest_error_file.unwrap_or(0),
                total: payload.total_files.unwrap_or(0),
            },
            last_command: payload.last_command,
        }
    }

    /// Fetches the service's file counters.
    pub async fn file_counters(&self) -> Result<FileCounters, MonitorError> {
        self.get_json("/GET-FILE-NUMBER").await
    }

    /// Fetches result and error file listings.
    pub async fn list_files(&self) -> Result<FileListing, MonitorError> {
        self.get_json("/LIST-FILES").await
    }

    /// Asks the service to record a synthetic error; fault-injection hook
    /// the service exposes for exercising the error path.
    pub async fn inject_error(&self) -> Result<(), MonitorError> {
        self.post("/CREATE-ERROR").await
    }

    /// Forwards a shutdown request to the service.
    pub async fn request_shutdown(&self) -> Result<(), MonitorError> {
        self.post("/SHUT-DOWN").await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
    ) -> Result<T, MonitorError> {
        let url = format!("{}{}", self.api_base, endpoint);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| map_transport(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::BadStatus {
                endpoint,
                code: status.as_u16(),
            });
        }

        response.json::<T>().await.map_err(|e| MonitorError::Decode {
            endpoint,
            reason: e.to_string(),
        })
    }

    async fn post(&self, endpoint: &'static str) -> Result<(), MonitorError> {
        let url = format!("{}{}", self.api_base, endpoint);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| map_transport(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::BadStatus {
                endpoint,
                code: status.as_u16(),
            });
        }

        Ok(())
    }
}

fn map_transport(endpoint: &'static str, err: reqwest::Error) -> MonitorError {
    if err.is_timeout() {
        MonitorError::Timeout { endpoint }
    } else {
        MonitorError::RequestFailed {
            endpoint,
            reason: err.to_string(),
        }
    }
}
