use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use super::{ScriptError, ScriptOrigin, VirtualScripts};

/// Installs local scripts from files on disk.
#[derive(Debug, Clone)]
pub struct ScriptLoader {
    scripts: Arc<VirtualScripts>,
}

impl ScriptLoader {
    pub fn new(scripts: Arc<VirtualScripts>) -> Self {
        Self { scripts }
    }

    /// Read every `(hostname wildcard, path)` pair and register it as a local
    /// script. Stops at the first unreadable file.
    pub async fn load<'a, I>(&self, entries: I) -> Result<usize, ScriptError>
    where
        I: IntoIterator<Item = (&'a String, &'a PathBuf)>,
    {
        let mut loaded = 0;
        for (pattern, path) in entries {
            let source = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ScriptError::Load {
                    path: path.clone(),
                    source,
                })?;
            self.scripts.set(pattern, ScriptOrigin::Local, &source)?;
            info!("Loaded local script {} for {}", path.display(), pattern);
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_loads_local_scripts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rewrite.js");
        std::fs::write(&path, "function handle(o) { return o; }").unwrap();

        let scripts = Arc::new(VirtualScripts::default());
        let loader = ScriptLoader::new(scripts.clone());
        let entries = BTreeMap::from([("*.corp".to_string(), path)]);

        assert_eq!(loader.load(&entries).await.unwrap(), 1);
        let script = scripts.find("git.corp").unwrap();
        assert_eq!(script.origin(), ScriptOrigin::Local);
        assert!(script.source().contains("function handle"));
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let scripts = Arc::new(VirtualScripts::default());
        let loader = ScriptLoader::new(scripts.clone());
        let entries = BTreeMap::from([("*".to_string(), PathBuf::from("/nonexistent/x.js"))]);

        let err = loader.load(&entries).await.unwrap_err();
        assert!(matches!(err, ScriptError::Load { .. }));
        assert!(scripts.is_empty());
    }
}
