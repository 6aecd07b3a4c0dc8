//! Watch a scan until it finishes, a breakpoint fires, or time runs out.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::scans::{IssueCount, ScanError, ScanStatusSource, Severity};

const RECOMMENDED_INTERVAL: Duration = Duration::from_secs(10);
const STATUS_ATTEMPTS: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum PollingError {
    #[error("{0}")]
    Scan(#[from] ScanError),

    #[error("{0}")]
    Breakpoint(#[from] BreakpointError),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Breakpoint reached: {message}")]
pub struct BreakpointError {
    message: String,
}

impl BreakpointError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Inspects each issue snapshot; an error ends polling.
#[async_trait]
pub trait Breakpoint: Send + Sync {
    async fn execute(&self, issues: &[IssueCount]) -> Result<(), BreakpointError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointKind {
    Any,
    MediumIssue,
    HighIssue,
    CriticalIssue,
}

impl BreakpointKind {
    pub const ALL: [BreakpointKind; 4] = [
        BreakpointKind::Any,
        BreakpointKind::MediumIssue,
        BreakpointKind::HighIssue,
        BreakpointKind::CriticalIssue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakpointKind::Any => "any",
            BreakpointKind::MediumIssue => "medium_issue",
            BreakpointKind::HighIssue => "high_issue",
            BreakpointKind::CriticalIssue => "critical_issue",
        }
    }

    fn min_severity(&self) -> Severity {
        match self {
            BreakpointKind::Any => Severity::Low,
            BreakpointKind::MediumIssue => Severity::Medium,
            BreakpointKind::HighIssue => Severity::High,
            BreakpointKind::CriticalIssue => Severity::Critical,
        }
    }

    pub fn into_breakpoint(self) -> Box<dyn Breakpoint> {
        Box::new(SeverityBreakpoint {
            min: self.min_severity(),
        })
    }
}

impl fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BreakpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown breakpoint \"{s}\""))
    }
}

/// Fires when any issue of at least `min` severity is reported.
struct SeverityBreakpoint {
    min: Severity,
}

#[async_trait]
impl Breakpoint for SeverityBreakpoint {
    async fn execute(&self, issues: &[IssueCount]) -> Result<(), BreakpointError> {
        let found: u64 = issues
            .iter()
            .filter(|i| i.severity >= self.min)
            .map(|i| i.number)
            .sum();
        if found > 0 {
            return Err(BreakpointError::new(format!(
                "found {found} issue(s) of {:?} severity or higher",
                self.min
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub scan_id: String,
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

pub struct Polling {
    config: PollingConfig,
    source: Arc<dyn ScanStatusSource>,
    breakpoint: Box<dyn Breakpoint>,
    active: Arc<AtomicBool>,
    stopped: AtomicBool,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl Polling {
    pub fn new(
        config: PollingConfig,
        source: Arc<dyn ScanStatusSource>,
        breakpoint: Box<dyn Breakpoint>,
    ) -> Self {
        if config.timeout.is_none() {
            warn!("Warning: It looks like you've been running polling without \"timeout\" option.");
            warn!("The recommended way to install polling with a minimal timeout: 10-20min.");
        }
        if config.interval < RECOMMENDED_INTERVAL {
            warn!("Warning: polling interval is too small.");
            warn!("The recommended way to set polling interval to 10s.");
        }

        Self {
            config,
            source,
            breakpoint,
            active: Arc::new(AtomicBool::new(true)),
            stopped: AtomicBool::new(false),
            timeout_task: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Poll until done. [`stop`](Self::stop) has always run when this returns.
    pub async fn start(&self) -> Result<(), PollingError> {
        info!("Starting polling...");
        if let Some(timeout) = self.config.timeout {
            self.arm_timeout(timeout);
        }

        let result = self.poll().await;
        self.stop();
        result
    }

    /// End polling. Returns false if it had already been stopped.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if !self.active.swap(false, Ordering::SeqCst) {
            info!("Polling has been terminated by timeout.");
        }
        if let Some(task) = self
            .timeout_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
        true
    }

    fn arm_timeout(&self, timeout: Duration) {
        let active = Arc::clone(&self.active);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            active.store(false, Ordering::SeqCst);
        });
        *self.timeout_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
        debug!("The polling timeout has been set to {:?}.", timeout);
    }

    async fn poll(&self) -> Result<(), PollingError> {
        let backoff = Backoff::new(STATUS_ATTEMPTS, ScanError::is_transient);
        let scan_id = self.config.scan_id.as_str();

        while self.is_active() {
            tokio::time::sleep(self.config.interval).await;

            let state = backoff.execute(|| self.source.status(scan_id)).await?;
            if state.status.is_terminal() {
                debug!("Scan {} finished with status {:?}", scan_id, state.status);
                break;
            }

            self.breakpoint.execute(&state.issues_by_severity).await?;
        }
        Ok(())
    }
}
