//! Per-job append-only log file.
//!
//! Every record is `[timestamp] [MODULE] message`, flushed on write; the
//! file handle is the only shared mutable resource and serializes concurrent
//! writers. Auto-named files follow `backup-helper-YYYYMMDDHHMMSS.log` and
//! creation of an auto-named log prunes the directory down to the most
//! recent [`RETAIN_LOGS`] files matching that pattern.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;

pub const RETAIN_LOGS: usize = 10;

const AUTO_PREFIX: &str = "backup-helper-";
const AUTO_SUFFIX: &str = ".log";

/// Module tag of a log record. Fixed small set; stage stderr drains pick
/// the tag of the stage they serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    System,
    Backup,
    Prepare,
    Tcp,
    Oss,
    Ssh,
    Decompress,
    Extract,
    Xbstream,
    Download,
}

impl Module {
    pub fn tag(self) -> &'static str {
        match self {
            Module::System => "SYSTEM",
            Module::Backup => "BACKUP",
            Module::Prepare => "PREPARE",
            Module::Tcp => "TCP",
            Module::Oss => "OSS",
            Module::Ssh => "SSH",
            Module::Decompress => "DECOMPRESS",
            Module::Extract => "EXTRACT",
            Module::Xbstream => "XBSTREAM",
            Module::Download => "DOWNLOAD",
        }
    }

    /// Keywords the error-summary extractor looks for in this module's
    /// records.
    fn error_keywords(self) -> &'static [&'static str] {
        const BASE: &[&str] = &["error", "failed", "fatal", "critical"];
        const NET: &[&str] = &[
            "error",
            "failed",
            "fatal",
            "critical",
            "timeout",
            "connection",
            "refused",
        ];
        const EXTRACT: &[&str] = &[
            "error", "failed", "fatal", "critical", "cannot", "unable",
        ];
        match self {
            Module::Tcp | Module::Oss | Module::Ssh | Module::Download => NET,
            Module::Extract | Module::Xbstream | Module::Decompress => EXTRACT,
            _ => BASE,
        }
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JobLog {
    /// Open the job log. An absolute `name` is used verbatim, a relative one
    /// is joined with `log_dir`, and no name auto-generates a timestamped
    /// file in `log_dir` (after pruning old auto-named files).
    pub fn open(name: Option<&str>, log_dir: &Path) -> anyhow::Result<Arc<Self>> {
        let auto_named = name.is_none();
        let path = match name {
            Some(name) if Path::new(name).is_absolute() => PathBuf::from(name),
            Some(name) => log_dir.join(name),
            None => {
                let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
                log_dir.join(format!("{AUTO_PREFIX}{stamp}{AUTO_SUFFIX}"))
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        // prune after creating the new file so the retained set includes it
        if auto_named {
            prune_auto_logs(log_dir, RETAIN_LOGS);
        }
        Ok(Arc::new(Self {
            path,
            file: Mutex::new(file),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush.
    pub fn write(&self, module: Module, message: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let record = format!("[{stamp}] [{module}] {message}\n");
        let mut file = self.file.lock().unwrap();
        let _ = file.write_all(record.as_bytes());
        let _ = file.flush();
    }

    /// Write the sentinel footer recording the job outcome.
    pub fn close(&self, success: bool) {
        let outcome = if success { "success" } else { "failed" };
        self.write(Module::System, &format!("==== job finished: {outcome} ===="));
    }

    /// Last up-to-20 lines whose lowercased content contains one of the
    /// module's error keywords, or the last 20 lines verbatim when no line
    /// matches.
    pub fn error_summary(&self, module: Module) -> Vec<String> {
        let text = std::fs::read_to_string(&self.path).unwrap_or_default();
        summarize_errors(&text, module)
    }

    /// Whether any record contains the given literal (used for the producer
    /// completion sentinel).
    pub fn contains(&self, needle: &str) -> bool {
        std::fs::read_to_string(&self.path)
            .map(|text| text.contains(needle))
            .unwrap_or(false)
    }
}

fn summarize_errors(text: &str, module: Module) -> Vec<String> {
    const MAX_LINES: usize = 20;
    let keywords = module.error_keywords();
    let matching: Vec<&str> = text
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            keywords.iter().any(|keyword| lower.contains(keyword))
        })
        .collect();
    let source: Vec<&str> = if matching.is_empty() {
        text.lines().collect()
    } else {
        matching
    };
    source
        .iter()
        .rev()
        .take(MAX_LINES)
        .rev()
        .map(|line| line.to_string())
        .collect()
}

/// Keep the `keep` most recently modified auto-named logs, delete the rest.
/// Best-effort: failures are logged, never fatal.
fn prune_auto_logs(log_dir: &Path, keep: usize) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };
    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if !name.starts_with(AUTO_PREFIX) || !name.ends_with(AUTO_SUFFIX) {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in candidates.into_iter().skip(keep) {
        if let Err(error) = std::fs::remove_file(&path) {
            tracing::warn!("failed to prune old log {}: {}", path.display(), error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_tagged_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::open(Some("job.log"), dir.path()).unwrap();
        log.write(Module::Backup, "starting producer");
        log.write(Module::Tcp, "connection established");
        log.close(true);
        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("[BACKUP] starting producer"));
        assert!(lines[1].contains("[TCP] connection established"));
        assert!(lines[2].contains("==== job finished: success ===="));
    }

    #[test]
    fn absolute_name_is_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("elsewhere.log");
        let log = JobLog::open(Some(target.to_str().unwrap()), Path::new("/nonexistent")).unwrap();
        assert_eq!(log.path(), target);
    }

    #[test]
    fn auto_name_retention_keeps_ten() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            let path = dir.path().join(format!("backup-helper-2024010100{i:02}00.log"));
            std::fs::write(&path, "old").unwrap();
            let mtime = filetime::FileTime::from_unix_time(1_700_000_000 + i as i64 * 60, 0);
            filetime::set_file_mtime(&path, mtime).unwrap();
        }
        // unrelated file must survive
        std::fs::write(dir.path().join("other.log"), "keep").unwrap();
        let log = JobLog::open(None, dir.path()).unwrap();
        log.write(Module::System, "new job");
        let auto: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.starts_with(AUTO_PREFIX) && name.ends_with(AUTO_SUFFIX)
            })
            .collect();
        // the retained set includes the freshly created file
        assert_eq!(auto.len(), 10);
        assert!(dir.path().join("other.log").exists());
        // the three oldest are gone
        for i in 0..3 {
            let oldest = dir.path().join(format!("backup-helper-2024010100{i:02}00.log"));
            assert!(!oldest.exists(), "{} should have been pruned", oldest.display());
        }
    }

    #[test]
    fn error_summary_selects_keyword_lines() {
        let text = "\
[t] [BACKUP] reading tables\n\
[t] [BACKUP] ERROR: disk full\n\
[t] [BACKUP] done\n\
[t] [BACKUP] operation FAILED\n";
        let summary = summarize_errors(text, Module::Backup);
        assert_eq!(summary.len(), 2);
        assert!(summary[0].contains("ERROR: disk full"));
        assert!(summary[1].contains("operation FAILED"));
    }

    #[test]
    fn error_summary_falls_back_to_tail() {
        let mut text = String::new();
        for i in 0..30 {
            text.push_str(&format!("line {i}\n"));
        }
        let summary = summarize_errors(&text, Module::Backup);
        assert_eq!(summary.len(), 20);
        assert_eq!(summary[0], "line 10");
        assert_eq!(summary[19], "line 29");
    }

    #[test]
    fn network_modules_match_timeout_lines() {
        let text = "[t] [TCP] connection refused by peer\n[t] [TCP] all good\n";
        let summary = summarize_errors(text, Module::Tcp);
        assert_eq!(summary.len(), 1);
        assert!(summary[0].contains("refused"));
    }
}
