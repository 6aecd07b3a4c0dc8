//! Keep-alive connections to targets, reused across requests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::transport::BoxedIo;

const MAX_IDLE_PER_HOST: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub https: bool,
    pub host: String,
    pub port: u16,
}

struct Idle {
    io: BoxedIo,
    since: Instant,
}

pub(crate) struct ConnectionPool {
    idle: Mutex<HashMap<PoolKey, Vec<Idle>>>,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub(crate) fn new(idle_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Most recently returned connection for `key` that has not expired.
    pub(crate) fn take(&self, key: &PoolKey) -> Option<BoxedIo> {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let connections = idle.get_mut(key)?;
        connections.retain(|c| c.since.elapsed() < self.idle_timeout);
        let io = connections.pop().map(|c| c.io);
        if connections.is_empty() {
            idle.remove(key);
        }
        io
    }

    pub(crate) fn put(&self, key: PoolKey, io: BoxedIo) {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let connections = idle.entry(key).or_default();
        if connections.len() >= MAX_IDLE_PER_HOST {
            connections.remove(0);
        }
        connections.push(Idle {
            io,
            since: Instant::now(),
        });
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, key: &PoolKey) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .map_or(0, Vec::len)
    }
}
