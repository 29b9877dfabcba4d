//! On-disk debug traces
//!
//! When debug is enabled, every layer transition writes one JSON file under
//! `{logDir}/{port}/{date}/`. Payloads are the envelope's serialized form —
//! primitive fields and ids only, so nothing cyclic ever reaches the
//! serializer.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

use crate::error::Result;

/// Writes per-layer-transition trace files.
pub struct TraceWriter {
    dir: PathBuf,
    seq: AtomicU64,
}

impl TraceWriter {
    /// Create the writer and its dated directory.
    pub fn new(log_dir: &str, port: u16) -> Result<Self> {
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let dir = PathBuf::from(log_dir).join(port.to_string()).join(date);
        fs::create_dir_all(&dir)?;
        tracing::info!(dir = %dir.display(), "Debug tracing enabled");
        Ok(Self {
            dir,
            seq: AtomicU64::new(0),
        })
    }

    /// Write one layer-transition record. Failures are logged, never
    /// propagated — tracing must not fail requests.
    pub fn write(&self, request_id: &str, layer: &str, direction: &str, payload: &Value) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let record = json!({
            "requestId": request_id,
            "layer": layer,
            "direction": direction,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "payload": payload,
        });
        let name = format!("{request_id}_{seq:06}_{layer}_{direction}.json");
        let path = self.dir.join(sanitize(&name));
        if let Err(e) = fs::write(&path, serde_json::to_vec_pretty(&record).unwrap_or_default()) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write trace file");
        }
    }

    /// Directory trace files land in.
    #[must_use]
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

/// Keep filenames portable: request ids come from client headers.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
