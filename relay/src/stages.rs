//! Stage vocabulary for the external tools.
//!
//! The archive itself is opaque; these builders only know how to invoke the
//! backup tool, the compressor and the extractor so that the archive flows
//! across stdout/stdin.

use std::path::{Path, PathBuf};

use common::Module;

use crate::job::DbConfig;
use crate::pipeline::StageSpec;

pub const XTRABACKUP_PATH_ENV: &str = "XTRABACKUP_PATH";

/// Backup-tool path resolution: explicit flag, then the environment
/// variable (a file or its containing directory), then the bare name.
pub fn resolve_xtrabackup(flag: Option<&str>) -> PathBuf {
    resolve_tool(
        flag,
        std::env::var(XTRABACKUP_PATH_ENV).ok().as_deref(),
        "xtrabackup",
    )
}

/// The extractor ships next to the backup tool.
pub fn resolve_xbstream(flag: Option<&str>) -> PathBuf {
    let xtrabackup = resolve_xtrabackup(flag);
    match xtrabackup.parent() {
        Some(parent) if parent != Path::new("") => parent.join("xbstream"),
        _ => PathBuf::from("xbstream"),
    }
}

fn resolve_tool(flag: Option<&str>, env: Option<&str>, default: &str) -> PathBuf {
    match flag.or(env) {
        Some(value) => {
            let path = PathBuf::from(value);
            if path.is_dir() {
                path.join(default)
            } else {
                path
            }
        }
        None => PathBuf::from(default),
    }
}

/// The backup producer: emits the archive on stdout. The consistency flags
/// bound how long the tool may hold the global read lock and when it may
/// kill long-running queries to take it.
pub fn backup_producer(
    bin: &Path,
    db: &DbConfig,
    parallel: usize,
    compress_qp: bool,
) -> StageSpec {
    let mut stage = StageSpec::new(bin.to_string_lossy(), Module::Backup)
        .arg("--backup")
        .arg("--stream=xbstream")
        .arg(format!("--host={}", db.host))
        .arg(format!("--port={}", db.port))
        .arg(format!("--user={}", db.user))
        .arg(format!("--password={}", db.password))
        .arg(format!("--parallel={parallel}"))
        .arg("--backup-lock-timeout=60")
        .arg("--ftwrl-wait-timeout=60")
        .arg("--ftwrl-wait-threshold=30")
        .arg("--kill-long-queries-timeout=20")
        .arg("--kill-long-query-type=all")
        .arg("--target-dir=/tmp");
    if compress_qp {
        stage = stage
            .arg("--compress=quicklz")
            .arg(format!("--compress-threads={parallel}"));
    }
    stage
}

pub fn zstd_compress(parallel: usize) -> StageSpec {
    StageSpec::new("zstd", Module::Backup)
        .arg("-q")
        .arg("-c")
        .arg(format!("-T{parallel}"))
}

pub fn zstd_decompress(parallel: usize) -> StageSpec {
    StageSpec::new("zstd", Module::Decompress)
        .arg("-d")
        .arg("-q")
        .arg("-c")
        .arg(format!("-T{parallel}"))
}

/// Extractor: unpacks the archive read from stdin into `target_dir`.
pub fn xbstream_extract(bin: &Path, target_dir: &Path, parallel: usize) -> StageSpec {
    StageSpec::new(bin.to_string_lossy(), Module::Xbstream)
        .arg("-x")
        .arg(format!("--parallel={parallel}"))
        .arg("-C")
        .arg(target_dir.to_string_lossy())
}

pub fn prepare(bin: &Path, target_dir: &Path, use_memory: &str) -> StageSpec {
    StageSpec::new(bin.to_string_lossy(), Module::Prepare)
        .arg("--prepare")
        .arg(format!("--use-memory={use_memory}"))
        .arg(format!("--target-dir={}", target_dir.display()))
}

/// In-place decompression of a qpress-compressed backup directory.
pub fn decompress_dir(bin: &Path, target_dir: &Path, parallel: usize) -> StageSpec {
    StageSpec::new(bin.to_string_lossy(), Module::Decompress)
        .arg("--decompress")
        .arg(format!("--parallel={parallel}"))
        .arg(format!("--target-dir={}", target_dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_environment() {
        let resolved = resolve_tool(Some("/opt/xb/bin/xtrabackup"), Some("/other"), "xtrabackup");
        assert_eq!(resolved, PathBuf::from("/opt/xb/bin/xtrabackup"));
    }

    #[test]
    fn directory_value_gains_the_tool_name() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_tool(Some(dir.path().to_str().unwrap()), None, "xtrabackup");
        assert_eq!(resolved, dir.path().join("xtrabackup"));
    }

    #[test]
    fn bare_name_when_nothing_is_configured() {
        assert_eq!(resolve_tool(None, None, "xtrabackup"), PathBuf::from("xtrabackup"));
    }

    #[test]
    fn producer_flags_cover_connection_and_streaming() {
        let db = DbConfig {
            host: "db1".to_string(),
            port: 3306,
            user: "backup".to_string(),
            password: "pw".to_string(),
        };
        let stage = backup_producer(Path::new("xtrabackup"), &db, 4, false);
        assert!(stage.args.contains(&"--backup".to_string()));
        assert!(stage.args.contains(&"--stream=xbstream".to_string()));
        assert!(stage.args.contains(&"--host=db1".to_string()));
        assert!(stage.args.contains(&"--parallel=4".to_string()));
        assert!(!stage.args.iter().any(|arg| arg.starts_with("--compress")));
    }

    #[test]
    fn qp_codec_compresses_inside_the_producer() {
        let db = DbConfig {
            host: "db1".to_string(),
            port: 3306,
            user: "backup".to_string(),
            password: String::new(),
        };
        let stage = backup_producer(Path::new("xtrabackup"), &db, 2, true);
        assert!(stage.args.contains(&"--compress=quicklz".to_string()));
        assert!(stage.args.contains(&"--compress-threads=2".to_string()));
    }

    #[test]
    fn extractor_targets_the_directory() {
        let stage = xbstream_extract(Path::new("/usr/bin/xbstream"), Path::new("/data/r"), 3);
        assert_eq!(
            stage.args,
            vec!["-x", "--parallel=3", "-C", "/data/r"]
        );
    }
}
