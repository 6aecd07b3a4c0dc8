//! Repeater Agent - relays control-plane requests to internal targets.
//!
//! This daemon runs inside the private network and:
//! - Registers with the control plane over a gRPC message bus
//! - Executes HTTP requests against internal hosts on its behalf
//! - Rewrites requests with per-host scripts and client certificates
//! - Reports a heartbeat every 10 seconds
//!
//! First run (saves the profile for later runs):
//! ```
//! repeater-agent run --cluster app.example.com --token API_KEY --id REPEATER_ID
//! ```
//!
//! Install as a user service:
//! ```
//! repeater-agent run --daemon
//! ```
//!
//! Wait for a scan to finish, failing on high severity issues:
//! ```
//! repeater-agent polling SCAN_ID --timeout 20m --breakpoint high_issue
//! ```

mod config;
mod error;
mod install;
mod logging;
mod shutdown;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use repeater_lib::bus::{GrpcBus, Handler};
use repeater_lib::certs::{CertificateSource, CertificateStore};
use repeater_lib::executor::{ExecutorRegistry, HttpRequestExecutor};
use repeater_lib::handlers::{NetworkTestHandler, RegisterScriptsHandler, SendRequestHandler};
use repeater_lib::polling::{BreakpointKind, Polling, PollingConfig, PollingError};
use repeater_lib::scans::RestScans;
use repeater_lib::scripts::{ScriptLoader, ScriptSandbox, VirtualScripts};
use repeater_lib::{RepeaterRuntime, VERSION};
use tracing::{error, info, warn};

use config::Config;
use error::{Error, Result};
use install::SystemdServiceManager;
use shutdown::Shutdown;

/// On-premises repeater for the scanning control plane
#[derive(Parser, Debug)]
#[command(name = "repeater-agent", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (default: platform-specific config dir)
    #[arg(short, long, global = true, env = "REPEATER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the control plane and relay requests
    #[command(alias = "repeater")]
    Run(RunArgs),
    /// Poll a scan until it finishes or a breakpoint fires
    Polling(PollingArgs),
    /// Install the repeater as a user service
    Install,
    /// Stop and remove the user service
    Uninstall,
}

#[derive(ClapArgs, Debug)]
struct ProfileArgs {
    /// Control-plane hostname
    #[arg(long, env = "REPEATER_CLUSTER")]
    cluster: Option<String>,

    /// API key with repeater scopes
    #[arg(long, env = "REPEATER_API_KEY", hide_env_values = true)]
    token: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// ID of this repeater
    #[arg(long, env = "REPEATER_ID")]
    id: Option<String>,

    #[command(flatten)]
    profile: ProfileArgs,

    /// Install as a service and exit
    #[arg(long, conflicts_with = "run")]
    daemon: bool,

    /// Started by the service manager
    #[arg(long)]
    run: bool,

    /// SOCKS5 proxy for target connections (socks5://[user:pass@]host:port)
    #[arg(long, env = "REPEATER_PROXY")]
    proxy: Option<String>,

    /// Header added to every request, "Name: value" (repeatable)
    #[arg(long = "header", value_name = "HEADER")]
    headers: Vec<String>,

    /// Client or CA certificate, "hostname:path[:passphrase]" (repeatable)
    #[arg(long = "cert", value_name = "CERT")]
    certs: Vec<String>,

    /// Response body limit in KB, -1 for unlimited
    #[arg(long, allow_hyphen_values = true)]
    max_content_length: Option<i64>,

    /// Request timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Skip control-plane certificate verification
    #[arg(long)]
    insecure: bool,
}

#[derive(ClapArgs, Debug)]
struct PollingArgs {
    /// Scan to watch
    scan_id: String,

    #[command(flatten)]
    profile: ProfileArgs,

    /// Time between status checks (e.g., 10s)
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Give up after this long (e.g., 20m)
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Stop early when issues are found
    #[arg(long, default_value = "any")]
    breakpoint: BreakpointKind,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?;

    let _log_guard = logging::init(&config.logging, &config.log_dir())?;

    match cli.command {
        Command::Run(args) => run(config, &config_path, args).await,
        Command::Polling(args) => polling(config, args).await,
        Command::Install => {
            let runtime = service_runtime(&config);
            runtime
                .install(std::env::current_exe()?, install::service_args(&config_path))
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Uninstall => {
            let runtime = service_runtime(&config);
            runtime.uninstall().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn apply_profile(config: &mut Config, profile: ProfileArgs) {
    if let Some(cluster) = profile.cluster {
        config.profile.cluster = cluster;
    }
    if let Some(token) = profile.token {
        config.profile.api_key = token;
    }
}

/// Apply CLI overrides. Returns true if the profile changed.
fn apply_run_args(config: &mut Config, args: &mut RunArgs) -> Result<bool> {
    let profile_changed =
        args.id.is_some() || args.profile.cluster.is_some() || args.profile.token.is_some();

    if let Some(id) = args.id.take() {
        config.profile.repeater_id = id;
    }
    apply_profile(
        config,
        ProfileArgs {
            cluster: args.profile.cluster.take(),
            token: args.profile.token.take(),
        },
    );

    if let Some(proxy) = args.proxy.take() {
        config.request.proxy_url = Some(proxy);
    }
    if let Some(limit) = args.max_content_length {
        config.request.max_content_length = limit;
    }
    if let Some(timeout) = args.timeout {
        config.request.timeout_ms = timeout;
    }
    if args.insecure {
        config.bus.insecure = true;
    }

    for header in &args.headers {
        let (name, value) = parse_header(header)?;
        config.request.headers.set(name, value);
    }
    for cert in &args.certs {
        config.certificates.push(parse_cert(cert)?);
    }

    Ok(profile_changed)
}

fn parse_header(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value.trim())),
        _ => Err(Error::Config(format!(
            "Invalid header \"{raw}\", expected \"Name: value\""
        ))),
    }
}

fn parse_cert(raw: &str) -> Result<CertificateSource> {
    let mut parts = raw.splitn(3, ':');
    let hostname = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    if hostname.is_empty() || path.is_empty() {
        return Err(Error::Config(format!(
            "Invalid certificate \"{raw}\", expected \"hostname:path[:passphrase]\""
        )));
    }

    Ok(CertificateSource {
        path: config::expand_tilde(Path::new(path)),
        hostname: hostname.to_string(),
        passphrase: parts.next().map(str::to_string),
    })
}

async fn run(
    mut config: Config,
    config_path: &Path,
    mut args: RunArgs,
) -> anyhow::Result<ExitCode> {
    let profile_changed = apply_run_args(&mut config, &mut args)?;
    config.validate(config_path)?;

    // Persist credentials on first run so the service can start without flags
    if profile_changed && !config_path.exists() {
        config.save(config_path)?;
        info!("Saved config to: {}", config_path.display());
    }

    info!("repeater-agent {} starting", VERSION);
    info!("Control plane: {}", config.bus_url());
    info!("Repeater ID: {}", config.profile.repeater_id);

    let sandbox = ScriptSandbox::new(config.sandbox_config());
    let scripts = Arc::new(VirtualScripts::new(sandbox));
    let loaded = ScriptLoader::new(scripts.clone())
        .load(&config.scripts)
        .await?;
    if loaded > 0 {
        info!("Loaded {} local script(s)", loaded);
    }

    let certificates = CertificateStore::load(&config.certificates).await;

    let http = HttpRequestExecutor::new(config.executor_options(), scripts.clone(), certificates)?;
    let executors = ExecutorRegistry::new().with(Arc::new(http));

    let handlers: Vec<Arc<dyn Handler>> = vec![
        Arc::new(RegisterScriptsHandler::new(scripts.clone())),
        Arc::new(NetworkTestHandler::new()),
        Arc::new(SendRequestHandler::new(executors)),
    ];

    let bus = Arc::new(GrpcBus::new(config.bus_config()));
    let runtime = RepeaterRuntime::builder(bus, scripts, handlers, VERSION)
        .service_manager(Arc::new(SystemdServiceManager::default()))
        .build();

    if args.daemon {
        runtime
            .install(std::env::current_exe()?, install::service_args(config_path))
            .await?;
        return Ok(ExitCode::SUCCESS);
    }

    // One signal future for the whole run so Ctrl-C during connect still exits
    let mut stop = std::pin::pin!(shutdown::signal());

    let started = tokio::select! {
        result = runtime.run(&config.profile.repeater_id, args.run) => result,
        reason = &mut stop => {
            info!("Received {} while connecting", reason);
            runtime.close().await?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    if let Err(e) = started {
        error!("{}", e);
        if let Err(close_err) = runtime.close().await {
            warn!("Error while closing: {}", close_err);
        }
        return Err(e.into());
    }

    // A signal is a clean stop for the service manager
    match shutdown::close_on(&runtime, stop).await {
        Shutdown::ConnectionLost => Ok(ExitCode::from(Shutdown::ConnectionLost.exit_code())),
        _ => Ok(ExitCode::SUCCESS),
    }
}

/// How a scan watch ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum ScanWatch {
    Finished,
    Interrupted(Shutdown),
}

/// Poll until the scan finishes or `stop` resolves. An interrupt is logged so
/// it cannot pass for a finished scan.
async fn watch_scan<F>(
    polling: &Polling,
    scan_id: &str,
    stop: F,
) -> Result<ScanWatch, PollingError>
where
    F: Future<Output = Shutdown>,
{
    tokio::select! {
        result = polling.start() => result.map(|()| ScanWatch::Finished),
        reason = stop => {
            polling.stop();
            warn!("Polling of scan {} interrupted by {} before it finished", scan_id, reason);
            Ok(ScanWatch::Interrupted(reason))
        }
    }
}

async fn polling(mut config: Config, args: PollingArgs) -> anyhow::Result<ExitCode> {
    apply_profile(&mut config, args.profile);

    if config.profile.cluster.is_empty() || config.profile.api_key.is_empty() {
        return Err(Error::Config(
            "polling requires --cluster and --token (or a saved profile)".to_string(),
        )
        .into());
    }

    let source = Arc::new(RestScans::new(config.api_url(), config.profile.api_key.clone())?);
    let polling = Polling::new(
        PollingConfig {
            scan_id: args.scan_id.clone(),
            interval: args.interval,
            timeout: args.timeout,
        },
        source,
        args.breakpoint.into_breakpoint(),
    );

    match watch_scan(&polling, &args.scan_id, shutdown::signal()).await {
        Ok(ScanWatch::Finished) => Ok(ExitCode::SUCCESS),
        Ok(ScanWatch::Interrupted(reason)) => Ok(ExitCode::from(reason.exit_code())),
        Err(PollingError::Breakpoint(e)) => {
            error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

/// Runtime with nothing behind the bus, for service management commands.
fn service_runtime(config: &Config) -> Arc<RepeaterRuntime> {
    let bus = Arc::new(GrpcBus::new(config.bus_config()));
    RepeaterRuntime::builder(bus, Arc::new(VirtualScripts::default()), Vec::new(), VERSION)
        .service_manager(Arc::new(SystemdServiceManager::default()))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use repeater_lib::scans::{ScanError, ScanState, ScanStatus, ScanStatusSource};

    /// A scan that never leaves the running state.
    struct NeverFinishes;

    #[async_trait]
    impl ScanStatusSource for NeverFinishes {
        async fn status(&self, _scan_id: &str) -> std::result::Result<ScanState, ScanError> {
            Ok(ScanState {
                status: ScanStatus::Running,
                issues_by_severity: Vec::new(),
            })
        }
    }

    fn endless_polling() -> Polling {
        Polling::new(
            PollingConfig {
                scan_id: "scan-1".to_string(),
                interval: Duration::from_secs(10),
                timeout: None,
            },
            Arc::new(NeverFinishes),
            BreakpointKind::CriticalIssue.into_breakpoint(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_watch_is_not_a_finish() {
        let polling = endless_polling();
        let stop = async {
            tokio::time::sleep(Duration::from_secs(35)).await;
            Shutdown::Interrupted
        };

        let outcome = watch_scan(&polling, "scan-1", stop).await.unwrap();
        assert_eq!(outcome, ScanWatch::Interrupted(Shutdown::Interrupted));
        assert_ne!(Shutdown::Interrupted.exit_code(), 0);
        assert!(!polling.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_watch() {
        struct Done;

        #[async_trait]
        impl ScanStatusSource for Done {
            async fn status(&self, _scan_id: &str) -> std::result::Result<ScanState, ScanError> {
                Ok(ScanState {
                    status: ScanStatus::Done,
                    issues_by_severity: Vec::new(),
                })
            }
        }

        let polling = Polling::new(
            PollingConfig {
                scan_id: "scan-1".to_string(),
                interval: Duration::from_secs(10),
                timeout: None,
            },
            Arc::new(Done),
            BreakpointKind::Any.into_breakpoint(),
        );
        let outcome = watch_scan(&polling, "scan-1", std::future::pending())
            .await
            .unwrap();
        assert_eq!(outcome, ScanWatch::Finished);
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(parse_header("X-Api: a:b").unwrap(), ("X-Api", "a:b"));
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_parse_cert() {
        let cert = parse_cert("*.corp:/etc/client.pfx:secret").unwrap();
        assert_eq!(cert.hostname, "*.corp");
        assert_eq!(cert.path, PathBuf::from("/etc/client.pfx"));
        assert_eq!(cert.passphrase.as_deref(), Some("secret"));

        let ca = parse_cert("internal:/etc/ca.pem").unwrap();
        assert!(ca.passphrase.is_none());

        assert!(parse_cert("internal").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "repeater-agent",
            "run",
            "--id",
            "rep-1",
            "--token",
            "key",
            "--cluster",
            "app.example.com",
            "--header",
            "X-Scanner: repeater",
            "--max-content-length",
            "-1",
            "--timeout",
            "5000",
        ])
        .unwrap();
        let Command::Run(mut args) = cli.command else {
            panic!("expected run command");
        };

        let mut config = Config::default();
        assert!(apply_run_args(&mut config, &mut args).unwrap());
        assert_eq!(config.profile.repeater_id, "rep-1");
        assert_eq!(config.bus_url(), "https://app.example.com:443");
        assert_eq!(config.request.max_content_length, -1);
        assert_eq!(config.request.timeout_ms, 5000);
        assert_eq!(config.request.headers.get("x-scanner"), Some("repeater"));
        assert!(config.validate(Path::new("config.toml")).is_ok());
    }

    #[test]
    fn test_polling_args() {
        let cli = Cli::try_parse_from([
            "repeater-agent",
            "polling",
            "scan-1",
            "--timeout",
            "20m",
            "--breakpoint",
            "high_issue",
        ])
        .unwrap();
        let Command::Polling(args) = cli.command else {
            panic!("expected polling command");
        };
        assert_eq!(args.interval, Duration::from_secs(10));
        assert_eq!(args.timeout, Some(Duration::from_secs(1200)));
        assert_eq!(args.breakpoint, BreakpointKind::HighIssue);
    }

    #[test]
    fn test_repeater_alias() {
        let cli = Cli::try_parse_from(["repeater-agent", "repeater", "--daemon"]).unwrap();
        assert!(matches!(cli.command, Command::Run(ref args) if args.daemon));
    }
}
