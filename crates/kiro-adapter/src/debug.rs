//! Last-request debug dumps.
//!
//! When enabled, each request overwrites the previous dump set so the
//! directory always holds the most recent exchange. A process-wide mutex
//! serializes writers; debug mode is not meant for production traffic.
//! IO failures are logged and never fail the request.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

const REQUEST_BODY: &str = "request_body.json";
const KIRO_REQUEST_BODY: &str = "kiro_request_body.json";
const RAW_STREAM: &str = "response_stream_raw.txt";
const MODIFIED_STREAM: &str = "response_stream_modified.txt";

pub struct DebugSink {
    enabled: bool,
    dir: PathBuf,
    lock: Mutex<()>,
}

impl DebugSink {
    pub fn new(enabled: bool, dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, "debug")
    }

    /// Truncate the dump set for a fresh request.
    pub fn prepare_new_request(&self) {
        if !self.enabled {
            return;
        }
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "cannot create debug dir");
            return;
        }
        for name in [REQUEST_BODY, KIRO_REQUEST_BODY, RAW_STREAM, MODIFIED_STREAM] {
            if let Err(e) = File::create(self.dir.join(name)) {
                warn!(file = name, error = %e, "cannot truncate debug file");
            }
        }
    }

    pub fn log_request_body(&self, body: &serde_json::Value) {
        self.write_json(REQUEST_BODY, body);
    }

    pub fn log_kiro_request_body(&self, body: &serde_json::Value) {
        self.write_json(KIRO_REQUEST_BODY, body);
    }

    pub fn log_raw_chunk(&self, bytes: &[u8]) {
        self.append(RAW_STREAM, &String::from_utf8_lossy(bytes));
    }

    pub fn log_modified_chunk(&self, line: &str) {
        self.append(MODIFIED_STREAM, line);
        self.append(MODIFIED_STREAM, "\n");
    }

    fn write_json(&self, name: &str, body: &serde_json::Value) {
        if !self.enabled {
            return;
        }
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let rendered = match serde_json::to_string_pretty(body) {
            Ok(s) => s,
            Err(e) => {
                warn!(file = name, error = %e, "cannot render debug body");
                return;
            }
        };
        if let Err(e) = fs::write(self.dir.join(name), rendered) {
            warn!(file = name, error = %e, "cannot write debug file");
        }
    }

    fn append(&self, name: &str, text: &str) {
        if !self.enabled {
            return;
        }
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(name))
            .and_then(|mut f| f.write_all(text.as_bytes()));
        if let Err(e) = result {
            warn!(file = name, error = %e, "cannot append debug file");
        }
    }
}
