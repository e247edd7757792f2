//! Captured output aggregation

use std::collections::HashMap;
use tokio::sync::Mutex;

/// Captured streams for one target. `None` means capture was not requested
/// for that stream.
#[derive(Debug, Clone, Default)]
pub struct TargetOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Buffers captured stdout/stderr per target as workers complete.
///
/// Each target's buffer is written exactly once, by its own worker, so
/// output from different targets is never interleaved in the final report.
#[derive(Debug, Default)]
pub struct OutputCollector {
    buffers: Mutex<HashMap<String, TargetOutput>>,
}

impl OutputCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed target's captured streams
    pub async fn record(&self, target: &str, stdout: Option<String>, stderr: Option<String>) {
        if stdout.is_none() && stderr.is_none() {
            return;
        }
        self.buffers
            .lock()
            .await
            .insert(target.to_string(), TargetOutput { stdout, stderr });
    }

    /// Captured output for one target, if any was recorded
    pub async fn get(&self, target: &str) -> Option<TargetOutput> {
        self.buffers.lock().await.get(target).cloned()
    }

    /// Number of targets with recorded output
    pub async fn len(&self) -> usize {
        self.buffers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffers.lock().await.is_empty()
    }
}
