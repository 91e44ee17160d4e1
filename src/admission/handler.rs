// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use super::Operation;

/// Reports whether a plugin's caches are ready.
pub type ReadyFunc = Arc<dyn Fn() -> bool + Send + Sync>;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Base for plugins: the operations they handle and their readiness.
pub struct Handler {
    operations: HashSet<Operation>,
    ready_func: RwLock<Option<ReadyFunc>>,
    ready_timeout: Duration,
}

impl Handler {
    /// Creates a handler for the given operations.
    pub fn new(operations: impl IntoIterator<Item = Operation>) -> Self {
        Self {
            operations: operations.into_iter().collect(),
            ready_func: RwLock::new(None),
            ready_timeout: Duration::from_secs(10),
        }
    }

    /// How long requests wait for the plugin to become ready.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Whether requests of `operation` are handled.
    pub fn handles(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }

    /// Sets the function reporting readiness. Without one the handler is always ready.
    pub fn set_ready_func(&self, f: ReadyFunc) {
        if let Ok(mut ready) = self.ready_func.write() {
            *ready = Some(f);
        }
    }

    fn is_ready(&self) -> bool {
        match self.ready_func.read() {
            Ok(ready) => ready.as_ref().map_or(true, |f| f()),
            Err(_) => false,
        }
    }

    /// Polls the ready function until it reports ready or the timeout
    /// passes.
    pub async fn wait_for_ready(&self) -> bool {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if self.is_ready() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_handles() {
        let handler = Handler::new([Operation::Delete]);
        assert!(handler.handles(Operation::Delete));
        assert!(!handler.handles(Operation::Create));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready() {
        let handler = Handler::new([Operation::Delete]).with_ready_timeout(Duration::from_secs(1));
        assert!(handler.wait_for_ready().await);

        let ready = Arc::new(AtomicBool::new(false));
        let flag = ready.clone();
        handler.set_ready_func(Arc::new(move || flag.load(Ordering::SeqCst)));
        assert!(!handler.wait_for_ready().await);

        ready.store(true, Ordering::SeqCst);
        assert!(handler.wait_for_ready().await);
    }
}
