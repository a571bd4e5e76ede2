//! PID/metadata records written under the run directory.
//!
//! One JSON file per running instance: `direct-<app>.pid` for an app started
//! directly, `platform-<port>.pid` for a platform controller.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Metadata about one running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidRecord {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<u64>,
    /// RFC 3339
    pub started_at: String,
}

impl PidRecord {
    /// Record for an app started directly.
    pub fn direct(app: &str, http_port: u16, workers: usize, requests: u64) -> Self {
        Self {
            pid: std::process::id(),
            app: Some(app.to_string()),
            port: None,
            http_port: Some(http_port),
            https_port: None,
            workers: Some(workers),
            requests: Some(requests),
            started_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// Record for a platform controller.
    pub fn platform(port: u16) -> Self {
        Self {
            pid: std::process::id(),
            app: None,
            port: Some(port),
            http_port: None,
            https_port: None,
            workers: None,
            requests: None,
            started_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// File name this record is stored under.
    pub fn file_name(&self) -> Result<String> {
        match (&self.app, self.port) {
            (Some(app), _) => Ok(format!("direct-{}.pid", app)),
            (None, Some(port)) => Ok(format!("platform-{}.pid", port)),
            (None, None) => Err(Error::pid_record("record has neither app nor port")),
        }
    }

    /// Write the record into `run_dir`, creating the directory if needed.
    pub fn write(&self, run_dir: impl AsRef<Path>) -> Result<PathBuf> {
        let run_dir = run_dir.as_ref();
        std::fs::create_dir_all(run_dir)?;
        let path = run_dir.join(self.file_name()?);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    /// Read one record file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// All readable records in `run_dir`, with the file each came from.
    pub fn list(run_dir: impl AsRef<Path>) -> Result<Vec<(PathBuf, PidRecord)>> {
        let run_dir = run_dir.as_ref();
        if !run_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in std::fs::read_dir(run_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            match Self::read(&path) {
                Ok(record) => records.push((path, record)),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable PID record");
                }
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    /// Remove this record's file from `run_dir`; a missing file is not an error.
    pub fn remove(&self, run_dir: impl AsRef<Path>) -> Result<()> {
        let path = run_dir.as_ref().join(self.file_name()?);
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Whether the recorded process still exists.
    pub fn is_alive(&self) -> bool {
        let Ok(raw) = i32::try_from(self.pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(
            PidRecord::direct("blog", 3000, 4, 1000).file_name().unwrap(),
            "direct-blog.pid"
        );
        assert_eq!(
            PidRecord::platform(8080).file_name().unwrap(),
            "platform-8080.pid"
        );
    }

    #[test]
    fn test_write_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");

        let direct = PidRecord::direct("blog", 3000, 4, 1000);
        let platform = PidRecord::platform(8080);
        direct.write(&run_dir).unwrap();
        platform.write(&run_dir).unwrap();
        std::fs::write(run_dir.join("garbage.pid"), b"not json").unwrap();

        let records = PidRecord::list(&run_dir).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].1, direct);
        assert_eq!(records[1].1, platform);

        direct.remove(&run_dir).unwrap();
        direct.remove(&run_dir).unwrap();
        assert_eq!(PidRecord::list(&run_dir).unwrap().len(), 1);
    }

    #[test]
    fn test_record_json_fields() {
        let json = serde_json::to_value(PidRecord::direct("blog", 3000, 4, 1000)).unwrap();
        assert_eq!(json["app"], "blog");
        assert_eq!(json["httpPort"], 3000);
        assert!(json.get("httpsPort").is_none());
        assert!(json["startedAt"].is_string());
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(PidRecord::platform(1).is_alive());
    }
}
