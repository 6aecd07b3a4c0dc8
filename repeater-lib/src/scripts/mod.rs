//! Per-hostname transformation scripts.
//!
//! The registry is read on every request and written only when scripts are
//! loaded from disk or pushed by the control plane. Readers load an immutable
//! snapshot; writers build a new list under a mutex and swap it in whole.

mod loader;
mod sandbox;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::wildcard::{HostPattern, best_match};

pub use loader::ScriptLoader;
pub use sandbox::{NODE_HARNESS, SandboxConfig, ScriptSandbox};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Invalid entrypoint name \"{0}\"")]
    InvalidEntrypoint(String),

    #[error("Entrypoint \"{0}\" is not defined by the script")]
    MissingEntrypoint(String),

    #[error("{0}")]
    Runtime(String),

    #[error("Script did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Unable to start the script sandbox: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Script sandbox exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("Malformed sandbox reply: {0}")]
    Protocol(String),

    #[error("Invalid hostname pattern \"{0}\"")]
    InvalidPattern(String),

    #[error("Error Loading Script: {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct VirtualScript {
    pattern: HostPattern,
    origin: ScriptOrigin,
    source: Arc<str>,
    sandbox: Arc<ScriptSandbox>,
}

impl VirtualScript {
    pub fn pattern(&self) -> &HostPattern {
        &self.pattern
    }

    pub fn origin(&self) -> ScriptOrigin {
        self.origin
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Call `entrypoint(args)` in an isolated interpreter.
    pub async fn exec(&self, entrypoint: &str, args: &Value) -> Result<Value, ScriptError> {
        debug!(
            "Executing {:?} script for {} ({})",
            self.origin, self.pattern, entrypoint
        );
        self.sandbox.run(&self.source, entrypoint, args).await
    }
}

pub struct VirtualScripts {
    sandbox: Arc<ScriptSandbox>,
    scripts: ArcSwap<Vec<VirtualScript>>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for VirtualScripts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualScripts")
            .field("size", &self.size())
            .finish()
    }
}

impl Default for VirtualScripts {
    fn default() -> Self {
        Self::new(ScriptSandbox::default())
    }
}

impl VirtualScripts {
    pub fn new(sandbox: ScriptSandbox) -> Self {
        Self {
            sandbox: Arc::new(sandbox),
            scripts: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    fn build(
        &self,
        pattern: &str,
        origin: ScriptOrigin,
        source: &str,
    ) -> Result<VirtualScript, ScriptError> {
        let pattern = HostPattern::new(pattern)
            .map_err(|_| ScriptError::InvalidPattern(pattern.to_string()))?;
        Ok(VirtualScript {
            pattern,
            origin,
            source: Arc::from(source),
            sandbox: self.sandbox.clone(),
        })
    }

    /// Apply `edit` to a copy of the current list and publish the result.
    fn update<R>(&self, edit: impl FnOnce(&mut Vec<VirtualScript>) -> R) -> R {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = Vec::clone(&self.scripts.load());
        let result = edit(&mut next);
        self.scripts.store(Arc::new(next));
        result
    }

    /// Store the script for `pattern`, overwriting any entry with the same
    /// pattern.
    pub fn set(&self, pattern: &str, origin: ScriptOrigin, source: &str) -> Result<(), ScriptError> {
        let script = self.build(pattern, origin, source)?;
        self.update(|scripts| upsert(scripts, script));
        Ok(())
    }

    pub fn clear(&self, origin: ScriptOrigin) {
        self.update(|scripts| scripts.retain(|s| s.origin != origin));
    }

    /// Install a new remote script set in place of the previous one.
    ///
    /// Existing remote scripts are always dropped. If a local script is
    /// loaded the incoming set is refused and `false` is returned.
    pub fn replace_remote<I>(&self, entries: I) -> bool
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut incoming = Vec::new();
        for (pattern, source) in entries {
            match self.build(&pattern, ScriptOrigin::Remote, &source) {
                Ok(script) => incoming.push(script),
                Err(e) => warn!("Error Loading Script: {}", e),
            }
        }

        let installed = self.update(|scripts| {
            scripts.retain(|s| s.origin != ScriptOrigin::Remote);
            if !scripts.is_empty() {
                return false;
            }
            for script in incoming {
                upsert(scripts, script);
            }
            true
        });

        if !installed {
            warn!(
                "Error Loading Script: Cannot accept scripts from the cloud when a local script is already loaded"
            );
        }
        installed
    }

    /// Most specific script whose pattern matches `hostname`.
    pub fn find(&self, hostname: &str) -> Option<VirtualScript> {
        let scripts = self.scripts.load();
        best_match(scripts.iter(), |s| &s.pattern, hostname).cloned()
    }

    pub fn size(&self) -> usize {
        self.scripts.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn has_local(&self) -> bool {
        self.scripts
            .load()
            .iter()
            .any(|s| s.origin == ScriptOrigin::Local)
    }

    /// The whole current set, as one consistent view.
    pub fn snapshot(&self) -> Arc<Vec<VirtualScript>> {
        self.scripts.load_full()
    }
}

fn upsert(scripts: &mut Vec<VirtualScript>, script: VirtualScript) {
    match scripts.iter_mut().find(|s| s.pattern == script.pattern) {
        Some(existing) => *existing = script,
        None => scripts.push(script),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn entries(prefix: &str, n: usize) -> Vec<(String, String)> {
        (0..n)
            .map(|i| (format!("{prefix}{i}.internal"), format!("// {prefix}")))
            .collect()
    }

    #[test]
    fn test_set_overwrites_same_pattern() {
        let scripts = VirtualScripts::default();
        scripts.set("*.internal", ScriptOrigin::Local, "a").unwrap();
        scripts.set("*.INTERNAL", ScriptOrigin::Local, "b").unwrap();
        assert_eq!(scripts.size(), 1);
        assert_eq!(scripts.find("x.internal").unwrap().source(), "b");
    }

    #[test]
    fn test_clear_by_origin() {
        let scripts = VirtualScripts::default();
        scripts.set("a", ScriptOrigin::Local, "").unwrap();
        scripts.set("b", ScriptOrigin::Remote, "").unwrap();
        scripts.clear(ScriptOrigin::Remote);
        assert_eq!(scripts.size(), 1);
        assert!(scripts.has_local());
    }

    #[test]
    fn test_remote_rejected_when_local_present() {
        let scripts = VirtualScripts::default();
        scripts
            .set("*.corp", ScriptOrigin::Local, "local")
            .unwrap();

        assert!(!scripts.replace_remote(entries("remote", 3)));

        let snapshot = scripts.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].source(), "local");
        assert_eq!(snapshot[0].origin(), ScriptOrigin::Local);
    }

    #[test]
    fn test_remote_set_replaces_previous_remote_set() {
        let scripts = VirtualScripts::default();
        assert!(scripts.replace_remote(entries("old", 2)));
        assert!(scripts.replace_remote(entries("new", 3)));

        assert_eq!(scripts.size(), 3);
        assert!(scripts.find("old0.internal").is_none());
        assert!(scripts.find("new2.internal").is_some());
    }

    #[test]
    fn test_find_prefers_exact_pattern() {
        let scripts = VirtualScripts::default();
        scripts.set("*", ScriptOrigin::Local, "all").unwrap();
        scripts
            .set("api.internal", ScriptOrigin::Local, "api")
            .unwrap();

        assert_eq!(scripts.find("api.internal").unwrap().source(), "api");
        assert_eq!(scripts.find("web.internal").unwrap().source(), "all");
    }

    #[test]
    fn test_concurrent_readers_never_see_a_mixed_set() {
        let scripts = Arc::new(VirtualScripts::default());
        scripts.replace_remote(entries("a", 16));

        let writer = {
            let scripts = scripts.clone();
            thread::spawn(move || {
                for round in 0..200 {
                    let prefix = if round % 2 == 0 { "b" } else { "a" };
                    assert!(scripts.replace_remote(entries(prefix, 16)));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let scripts = scripts.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let snapshot = scripts.snapshot();
                        assert_eq!(snapshot.len(), 16);
                        let first = snapshot[0].source().to_string();
                        assert!(snapshot.iter().all(|s| s.source() == first));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
