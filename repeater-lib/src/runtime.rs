//! Repeater lifecycle: connect, register, serve commands, close.
//!
//! ```text
//! Idle -> Connecting -> Registering -> Running -> Closing -> Closed
//!                            |                      ^
//!                            +----> Rejected -------+
//! ```
//!
//! Registration is a request/reply exchange on the bus. Command handlers are
//! only subscribed once it succeeds, so a rejected repeater never serves a
//! command.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use semver::Version;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::bus::{Bus, Handler, Message};
use crate::error::{Error, Rejection};
use crate::messages::{
    RegistrationOutcome, RepeaterRegistering, RepeaterStatus, RepeaterStatusUpdated,
};
use crate::scripts::VirtualScripts;

pub const SERVICE_NAME: &str = "repeater-agent";
pub const SERVICE_DISPLAY_NAME: &str = "Repeater Agent";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Connecting,
    Registering,
    Running,
    Rejected,
    Closing,
    Closed,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeState::Idle => "idle",
            RuntimeState::Connecting => "connecting",
            RuntimeState::Registering => "registering",
            RuntimeState::Running => "running",
            RuntimeState::Rejected => "rejected",
            RuntimeState::Closing => "closing",
            RuntimeState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A unit the OS service manager should keep running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub display_name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
}

/// Installs the repeater as an OS service.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn install(&self, service: &ServiceDefinition) -> Result<()>;

    async fn uninstall(&self, name: &str) -> Result<()>;

    /// Called when the current process is the installed service.
    async fn run(&self) -> Result<()>;
}

struct Lifecycle {
    state: RuntimeState,
    repeater_id: Option<String>,
    heartbeat: Option<JoinHandle<()>>,
}

pub struct RepeaterRuntime {
    bus: Arc<dyn Bus>,
    scripts: Arc<VirtualScripts>,
    handlers: Vec<Arc<dyn Handler>>,
    service: Option<Arc<dyn ServiceManager>>,
    version: String,
    heartbeat_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
    terminated: watch::Sender<bool>,
}

impl RepeaterRuntime {
    /// Build the runtime and hook it to the bus's reconnection failure.
    pub fn new(
        bus: Arc<dyn Bus>,
        scripts: Arc<VirtualScripts>,
        handlers: Vec<Arc<dyn Handler>>,
        version: impl Into<String>,
    ) -> Arc<Self> {
        Self::builder(bus, scripts, handlers, version).build()
    }

    pub fn builder(
        bus: Arc<dyn Bus>,
        scripts: Arc<VirtualScripts>,
        handlers: Vec<Arc<dyn Handler>>,
        version: impl Into<String>,
    ) -> RuntimeBuilder {
        RuntimeBuilder {
            bus,
            scripts,
            handlers,
            version: version.into(),
            service: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.lock().state
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Flips to `true` after the bus gave up reconnecting and the runtime
    /// closed itself. The process should exit with a failure status.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move from `from` to `to`, failing if another path (usually `close`)
    /// changed the state in between.
    fn transition(&self, from: RuntimeState, to: RuntimeState) -> Result<()> {
        let mut lifecycle = self.lock();
        if lifecycle.state != from {
            return Err(Error::Cancelled);
        }
        lifecycle.state = to;
        Ok(())
    }

    /// Connect, register and start serving commands. Returns once the
    /// repeater is running; a no-op if it already is.
    pub async fn run(&self, repeater_id: &str, as_daemon: bool) -> Result<()> {
        {
            let mut lifecycle = self.lock();
            match lifecycle.state {
                RuntimeState::Running => return Ok(()),
                RuntimeState::Idle => {}
                other => return Err(Error::InvalidState(other)),
            }
            lifecycle.state = RuntimeState::Connecting;
            lifecycle.repeater_id = Some(repeater_id.to_string());
        }

        if as_daemon && let Some(service) = &self.service {
            service.run().await?;
        }

        info!("Starting the Repeater ({})...", self.version);

        match self.start(repeater_id).await {
            Ok(()) => {
                info!("The Repeater ({}) started", self.version);
                Ok(())
            }
            Err(e) => {
                let mut lifecycle = self.lock();
                if matches!(
                    lifecycle.state,
                    RuntimeState::Connecting | RuntimeState::Registering
                ) {
                    lifecycle.state = if matches!(e, Error::Rejected(_)) {
                        RuntimeState::Rejected
                    } else {
                        RuntimeState::Idle
                    };
                }
                Err(e)
            }
        }
    }

    async fn start(&self, repeater_id: &str) -> Result<()> {
        self.bus.init().await?;
        self.transition(RuntimeState::Connecting, RuntimeState::Registering)?;

        let registering = RepeaterRegistering {
            repeater_id: repeater_id.to_string(),
            version: self.version.clone(),
            local_scripts_used: !self.scripts.is_empty(),
        };
        let reply = self.bus.send(Message::new(&registering)?).await?;
        let outcome = RegistrationOutcome::from_value(reply.clone())
            .map_err(|_| Error::UnexpectedReply(reply.to_string()))?;

        match outcome {
            RegistrationOutcome::Rejected(reason) => {
                return Err(Rejection::new(reason, repeater_id).into());
            }
            RegistrationOutcome::Registered {
                server_version,
                script,
            } => {
                self.notify_upgrade(&server_version);
                if let Some(script) = script.filter(|s| !s.is_empty()) {
                    self.scripts.replace_remote(script.into_entries());
                }
            }
        }

        for handler in &self.handlers {
            self.bus.subscribe(Arc::clone(handler)).await?;
        }

        {
            let mut lifecycle = self.lock();
            if lifecycle.state != RuntimeState::Registering {
                return Err(Error::Cancelled);
            }
            lifecycle.heartbeat = Some(self.spawn_heartbeat(repeater_id));
            lifecycle.state = RuntimeState::Running;
        }

        self.publish_status(repeater_id, RepeaterStatus::Connected)
            .await
    }

    fn notify_upgrade(&self, server_version: &str) {
        let (Ok(server), Ok(local)) = (Version::parse(server_version), Version::parse(&self.version))
        else {
            debug!(
                "Cannot compare versions (server {}, local {})",
                server_version, self.version
            );
            return;
        };
        if server > local {
            warn!(
                "(!) IMPORTANT: A new Repeater version ({}) is available, please update",
                server
            );
        }
    }

    fn spawn_heartbeat(&self, repeater_id: &str) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let status = RepeaterStatusUpdated::new(repeater_id, RepeaterStatus::Connected);
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first status goes out right after start.
            interval.tick().await;

            loop {
                interval.tick().await;
                let message = match Message::new(&status) {
                    Ok(message) => message,
                    Err(e) => {
                        error!("Unable to encode heartbeat: {}", e);
                        return;
                    }
                };
                if let Err(e) = bus.publish(message).await {
                    debug!("Heartbeat not delivered: {}", e);
                }
            }
        })
    }

    async fn publish_status(&self, repeater_id: &str, status: RepeaterStatus) -> Result<()> {
        let message = Message::new(&RepeaterStatusUpdated::new(repeater_id, status))?;
        self.bus.publish(message).await
    }

    /// Stop serving commands and disconnect. Safe to call at any point and
    /// more than once.
    pub async fn close(&self) -> Result<()> {
        let (was_running, heartbeat, repeater_id) = {
            let mut lifecycle = self.lock();
            if matches!(lifecycle.state, RuntimeState::Closing | RuntimeState::Closed) {
                return Ok(());
            }
            let was_running = lifecycle.state == RuntimeState::Running;
            lifecycle.state = RuntimeState::Closing;
            (
                was_running,
                lifecycle.heartbeat.take(),
                lifecycle.repeater_id.clone(),
            )
        };

        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }

        if was_running && let Some(id) = repeater_id {
            if let Err(e) = self.publish_status(&id, RepeaterStatus::Disconnected).await {
                warn!("Unable to publish disconnected status: {}", e);
            }
        }

        let result = self.bus.destroy().await;
        self.lock().state = RuntimeState::Closed;
        info!("The Repeater stopped");
        result
    }

    fn service(&self) -> Result<&Arc<dyn ServiceManager>> {
        self.service
            .as_ref()
            .ok_or_else(|| Error::Service("no service manager available".to_string()))
    }

    /// Register this repeater as an OS service running `command args`.
    pub async fn install(&self, command: PathBuf, args: Vec<String>) -> Result<()> {
        let service = ServiceDefinition {
            name: SERVICE_NAME.to_string(),
            display_name: SERVICE_DISPLAY_NAME.to_string(),
            command,
            args,
        };
        self.service()?.install(&service).await?;
        info!(
            "A Repeater daemon process was initiated successfully (SERVICE: {})",
            SERVICE_NAME
        );
        Ok(())
    }

    pub async fn uninstall(&self) -> Result<()> {
        self.service()?.uninstall(SERVICE_NAME).await?;
        info!(
            "The Repeater daemon process (SERVICE: {}) was stopped and deleted successfully",
            SERVICE_NAME
        );
        Ok(())
    }

    fn on_reconnection_failure(weak: Weak<Self>, err: Error) {
        error!("{}", err);
        let Some(runtime) = weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = runtime.close().await {
                warn!("Error while closing: {}", e);
            }
            runtime.terminated.send_replace(true);
        });
    }
}

pub struct RuntimeBuilder {
    bus: Arc<dyn Bus>,
    scripts: Arc<VirtualScripts>,
    handlers: Vec<Arc<dyn Handler>>,
    version: String,
    service: Option<Arc<dyn ServiceManager>>,
    heartbeat_interval: Duration,
}

impl RuntimeBuilder {
    pub fn service_manager(mut self, service: Arc<dyn ServiceManager>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn build(self) -> Arc<RepeaterRuntime> {
        let (terminated, _) = watch::channel(false);
        let runtime = Arc::new(RepeaterRuntime {
            bus: self.bus,
            scripts: self.scripts,
            handlers: self.handlers,
            service: self.service,
            version: self.version,
            heartbeat_interval: self.heartbeat_interval,
            lifecycle: Mutex::new(Lifecycle {
                state: RuntimeState::Idle,
                repeater_id: None,
                heartbeat: None,
            }),
            terminated,
        });

        let weak = Arc::downgrade(&runtime);
        runtime
            .bus
            .on_reconnection_failure(Box::new(move |err| {
                RepeaterRuntime::on_reconnection_failure(weak, err)
            }));
        runtime
    }
}
