//! systemd user unit installation for repeater-agent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use repeater_lib::{ServiceDefinition, ServiceManager};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Get the systemd user unit directory.
pub fn unit_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("systemd/user")
}

fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,".contains(c))
    {
        arg.to_string()
    } else {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// Generate the unit file content.
pub fn generate_unit(service: &ServiceDefinition) -> String {
    let exec = std::iter::once(service.command.display().to_string())
        .chain(service.args.iter().cloned())
        .map(|a| quote(&a))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        r#"[Unit]
Description={description}
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
ExecStart={exec}
Restart=on-failure
RestartSec=10

[Install]
WantedBy=default.target
"#,
        description = service.display_name,
    )
}

async fn systemctl(args: &[&str]) -> Result<()> {
    let output = Command::new("systemctl")
        .arg("--user")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Install(format!("Failed to run systemctl: {e}")))?;

    if !output.status.success() {
        return Err(Error::Install(format!(
            "systemctl {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Installs the repeater as a systemd user service.
#[derive(Debug, Clone)]
pub struct SystemdServiceManager {
    unit_dir: PathBuf,
    /// Only write unit files, never call systemctl.
    dry_run: bool,
}

impl Default for SystemdServiceManager {
    fn default() -> Self {
        Self::new(unit_dir())
    }
}

impl SystemdServiceManager {
    pub fn new(unit_dir: PathBuf) -> Self {
        Self {
            unit_dir,
            dry_run: false,
        }
    }

    #[cfg(test)]
    fn dry_run(unit_dir: &Path) -> Self {
        Self {
            unit_dir: unit_dir.to_path_buf(),
            dry_run: true,
        }
    }

    fn unit_file(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{name}.service"))
    }

    async fn install_unit(&self, service: &ServiceDefinition) -> Result<()> {
        tokio::fs::create_dir_all(&self.unit_dir).await?;
        let path = self.unit_file(&service.name);
        tokio::fs::write(&path, generate_unit(service)).await?;
        info!("Wrote unit file {}", path.display());

        if !self.dry_run {
            systemctl(&["daemon-reload"]).await?;
            systemctl(&["enable", "--now", &service.name]).await?;
        }
        Ok(())
    }

    async fn uninstall_unit(&self, name: &str) -> Result<()> {
        if !self.dry_run
            && let Err(e) = systemctl(&["disable", "--now", name]).await
        {
            // The unit might not be loaded.
            warn!("{}", e);
        }

        let path = self.unit_file(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Removed unit file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if !self.dry_run {
            systemctl(&["daemon-reload"]).await?;
        }
        Ok(())
    }
}

fn service_error(e: Error) -> repeater_lib::Error {
    repeater_lib::Error::Service(e.to_string())
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn install(&self, service: &ServiceDefinition) -> repeater_lib::Result<()> {
        self.install_unit(service).await.map_err(service_error)
    }

    async fn uninstall(&self, name: &str) -> repeater_lib::Result<()> {
        self.uninstall_unit(name).await.map_err(service_error)
    }

    async fn run(&self) -> repeater_lib::Result<()> {
        // systemd sets INVOCATION_ID for every unit it starts.
        if std::env::var_os("INVOCATION_ID").is_none() {
            warn!("Running with --run outside of systemd");
        }
        Ok(())
    }
}

/// Arguments the installed service starts the agent with.
pub fn service_args(config_path: &Path) -> Vec<String> {
    vec![
        "--config".to_string(),
        config_path.display().to_string(),
        "run".to_string(),
        "--run".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> ServiceDefinition {
        ServiceDefinition {
            name: "repeater-agent".to_string(),
            display_name: "Repeater Agent".to_string(),
            command: PathBuf::from("/usr/local/bin/repeater-agent"),
            args: service_args(Path::new("/home/me/my config.toml")),
        }
    }

    #[test]
    fn test_generate_unit() {
        let unit = generate_unit(&definition());
        assert!(unit.contains("Description=Repeater Agent"));
        assert!(unit.contains(
            "ExecStart=/usr/local/bin/repeater-agent --config \"/home/me/my config.toml\" run --run"
        ));
        assert!(unit.contains("WantedBy=default.target"));
    }

    #[tokio::test]
    async fn test_install_and_uninstall_unit_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SystemdServiceManager::dry_run(dir.path());

        manager.install(&definition()).await.unwrap();
        let path = dir.path().join("repeater-agent.service");
        assert!(path.exists());

        manager.uninstall("repeater-agent").await.unwrap();
        assert!(!path.exists());

        // Uninstalling twice is fine.
        manager.uninstall("repeater-agent").await.unwrap();
    }
}
