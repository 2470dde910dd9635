// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Option and default-printer persistence.
//
// Three kinds of state survive a restart:
//   - `options-<queue>`: key=value snapshot of per-queue option defaults,
//     written before a queue is deleted and merged back on (re)creation
//   - `local-default-printer`: the pre-existing local default to restore
//     when a managed default disappears for good
//   - `remote-default-printer`: a managed queue that should become default
//     again when it is re-created

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use druckwerk_core::error::Result;

const LOCAL_DEFAULT_FILE: &str = "local-default-printer";
const REMOTE_DEFAULT_FILE: &str = "remote-default-printer";

/// File-backed persistence under the daemon's cache directory.
pub struct OptionStore {
    cache_dir: PathBuf,
}

impl OptionStore {
    /// Create the store, making sure the cache directory exists.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    fn options_path(&self, queue: &str) -> PathBuf {
        self.cache_dir.join(format!("options-{queue}"))
    }

    /// Persist the option snapshot for a queue.
    pub fn save_queue_options(&self, queue: &str, options: &HashMap<String, String>) -> Result<()> {
        let mut lines: Vec<String> = options
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        lines.sort();
        let body = format!(
            "# saved {}\n{}\n",
            chrono::Utc::now().to_rfc3339(),
            lines.join("\n")
        );
        std::fs::write(self.options_path(queue), body)?;
        debug!(queue, count = options.len(), "queue options saved");
        Ok(())
    }

    /// Load the saved snapshot; empty when none exists.
    pub fn load_queue_options(&self, queue: &str) -> HashMap<String, String> {
        let path = self.options_path(queue);
        let Ok(body) = std::fs::read_to_string(&path) else {
            return HashMap::new();
        };
        let mut options = HashMap::new();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((k, v)) => {
                    options.insert(k.to_string(), v.to_string());
                }
                None => {
                    warn!(queue, line, "malformed saved option line");
                }
            }
        }
        options
    }

    pub fn delete_queue_options(&self, queue: &str) {
        let _ = std::fs::remove_file(self.options_path(queue));
    }

    // -- default-printer identity -------------------------------------------

    pub fn save_local_default(&self, queue: &str) -> Result<()> {
        write_name(&self.cache_dir.join(LOCAL_DEFAULT_FILE), queue)
    }

    pub fn load_local_default(&self) -> Option<String> {
        read_name(&self.cache_dir.join(LOCAL_DEFAULT_FILE))
    }

    pub fn clear_local_default(&self) {
        let _ = std::fs::remove_file(self.cache_dir.join(LOCAL_DEFAULT_FILE));
    }

    pub fn save_remote_default(&self, queue: &str) -> Result<()> {
        write_name(&self.cache_dir.join(REMOTE_DEFAULT_FILE), queue)
    }

    pub fn load_remote_default(&self) -> Option<String> {
        read_name(&self.cache_dir.join(REMOTE_DEFAULT_FILE))
    }

    pub fn clear_remote_default(&self) {
        let _ = std::fs::remove_file(self.cache_dir.join(REMOTE_DEFAULT_FILE));
    }
}

fn write_name(path: &Path, name: &str) -> Result<()> {
    std::fs::write(path, format!("{name}\n"))?;
    Ok(())
}

fn read_name(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (OptionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OptionStore::new(dir.path()).expect("store");
        (store, dir)
    }

    #[test]
    fn options_round_trip() {
        let (store, _dir) = store();
        let mut options = HashMap::new();
        options.insert("media".to_string(), "iso_a4_210x297mm".to_string());
        options.insert("sides".to_string(), "two-sided-long-edge".to_string());

        store.save_queue_options("Lab_Printer_lab", &options).unwrap();
        let loaded = store.load_queue_options("Lab_Printer_lab");
        assert_eq!(loaded, options);
    }

    #[test]
    fn missing_options_file_is_empty() {
        let (store, _dir) = store();
        assert!(store.load_queue_options("nope").is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let (store, dir) = store();
        std::fs::write(
            dir.path().join("options-bad"),
            "media=iso_a4_210x297mm\nnot a pair\n\n",
        )
        .unwrap();
        let loaded = store.load_queue_options("bad");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("media").map(String::as_str), Some("iso_a4_210x297mm"));
    }

    #[test]
    fn delete_is_idempotent() {
        let (store, _dir) = store();
        store
            .save_queue_options("q", &HashMap::from([("a".into(), "b".into())]))
            .unwrap();
        store.delete_queue_options("q");
        store.delete_queue_options("q");
        assert!(store.load_queue_options("q").is_empty());
    }

    #[test]
    fn default_printer_files() {
        let (store, _dir) = store();
        assert!(store.load_local_default().is_none());

        store.save_local_default("office").unwrap();
        assert_eq!(store.load_local_default().as_deref(), Some("office"));
        store.clear_local_default();
        assert!(store.load_local_default().is_none());

        store.save_remote_default("Lab_Printer_lab").unwrap();
        assert_eq!(
            store.load_remote_default().as_deref(),
            Some("Lab_Printer_lab")
        );
        store.clear_remote_default();
        assert!(store.load_remote_default().is_none());
    }
}
