//! Process shutdown: signals in, `RepeaterRuntime::close` out.

use std::fmt;
use std::future::{Future, pending};

use repeater_lib::RepeaterRuntime;
use tracing::{error, info, warn};

/// Why the agent is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// SIGINT / Ctrl-C
    Interrupted,
    /// SIGTERM, usually from the service manager
    Terminated,
    /// The bus gave up reconnecting
    ConnectionLost,
}

impl Shutdown {
    /// Shell-style exit status: 128 + signal number for signals.
    pub fn exit_code(self) -> u8 {
        match self {
            Shutdown::Interrupted => 130,
            Shutdown::Terminated => 143,
            Shutdown::ConnectionLost => 1,
        }
    }
}

impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Shutdown::Interrupted => "Ctrl-C",
            Shutdown::Terminated => "SIGTERM",
            Shutdown::ConnectionLost => "lost control-plane connection",
        })
    }
}

/// Resolves on SIGINT or SIGTERM. A handler that cannot be installed never
/// fires instead of aborting the agent.
pub async fn signal() -> Shutdown {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl-C: {}", e);
            pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = pending::<()>();

    tokio::select! {
        _ = ctrl_c => Shutdown::Interrupted,
        _ = terminate => Shutdown::Terminated,
    }
}

/// Serve until `stop` resolves or the runtime terminates on its own, then
/// close the runtime.
pub async fn close_on<F>(runtime: &RepeaterRuntime, stop: F) -> Shutdown
where
    F: Future<Output = Shutdown>,
{
    let mut terminated = runtime.terminated();

    let reason = tokio::select! {
        reason = stop => {
            info!("Received {}, shutting down...", reason);
            reason
        }
        _ = terminated.wait_for(|t| *t) => {
            error!("Connection to the control plane could not be restored");
            Shutdown::ConnectionLost
        }
    };

    if let Err(e) = runtime.close().await {
        warn!("Error while closing: {}", e);
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use repeater_lib::bus::GrpcBus;
    use repeater_lib::scripts::VirtualScripts;
    use repeater_lib::{RuntimeState, VERSION};

    use crate::config::Config;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Shutdown::Interrupted.exit_code(), 130);
        assert_eq!(Shutdown::Terminated.exit_code(), 143);
        assert_eq!(Shutdown::ConnectionLost.exit_code(), 1);
        assert_eq!(Shutdown::Terminated.to_string(), "SIGTERM");
    }

    #[tokio::test]
    async fn test_stop_closes_runtime() {
        let bus = Arc::new(GrpcBus::new(Config::default().bus_config()));
        let runtime =
            RepeaterRuntime::new(bus, Arc::new(VirtualScripts::default()), Vec::new(), VERSION);

        let reason = close_on(&runtime, async { Shutdown::Terminated }).await;
        assert_eq!(reason, Shutdown::Terminated);
        assert_eq!(runtime.state(), RuntimeState::Closed);

        // A second stop is a no-op.
        close_on(&runtime, async { Shutdown::Interrupted }).await;
        assert_eq!(runtime.state(), RuntimeState::Closed);
    }
}
