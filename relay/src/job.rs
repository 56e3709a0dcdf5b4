//! Immutable per-invocation job records.
//!
//! One record is built per subcommand after flag parsing and passed
//! explicitly through the coordinator; nothing here changes after
//! construction.

use std::path::PathBuf;

use crate::store::DEFAULT_PART_SIZE;

/// Archive codec of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Codec {
    /// raw xbstream
    #[default]
    #[value(name = "no")]
    None,
    /// qpress, compressed inside the archive by the backup tool
    Qp,
    /// external zstd stage around the archive
    Zstd,
}

impl Codec {
    /// Object-name suffix for this codec.
    pub fn suffix(self) -> &'static str {
        match self {
            Codec::None => ".xb",
            Codec::Qp => "_qp.xb",
            Codec::Zstd => ".xb.zst",
        }
    }
}

/// `<prefix>_YYYYMMDDHHMMSS<suffix>`
pub fn object_name(prefix: &str, codec: Codec, at: chrono::DateTime<chrono::Local>) -> String {
    format!("{prefix}_{}{}", at.format("%Y%m%d%H%M%S"), codec.suffix())
}

/// MySQL endpoint the backup producer connects to.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Object-store target. Credentials are passed through untouched.
#[derive(Debug, Clone)]
pub struct OssConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    /// object-name prefix, timestamp and codec suffix are appended
    pub prefix: String,
    pub part_size: usize,
    /// bytes/sec enforced remotely via the per-request traffic-limit
    /// header; 0 omits the header
    pub rate_limit: u64,
}

impl Default for OssConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            region: "auto".to_string(),
            access_key_id: String::new(),
            access_key_secret: String::new(),
            prefix: "backup".to_string(),
            part_size: DEFAULT_PART_SIZE,
            rate_limit: 0,
        }
    }
}

/// Where the produced stream goes.
#[derive(Debug, Clone)]
pub enum StreamSink {
    /// multipart upload
    Oss(OssConfig),
    /// wait for a peer to connect, then write the payload to it; port 0
    /// picks an ephemeral port which is announced before accepting
    Listen { port: u16 },
    /// connect out to a waiting receiver
    Dial { host: String, port: u16 },
    /// bootstrap the receiver over SSH first, then connect to the port it
    /// announces
    SshDial {
        destination: String,
        port: u16,
        remote_output: Option<String>,
    },
}

/// Job-log placement shared by every subcommand.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// absolute used verbatim, relative joined with `dir`, `None`
    /// auto-generates a timestamped name
    pub name: Option<String>,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BackupJob {
    pub db: DbConfig,
    pub codec: Codec,
    pub sink: StreamSink,
    /// bytes/sec, 0 = unlimited
    pub rate: u64,
    pub handshake: Option<String>,
    pub accept_timeout: std::time::Duration,
    pub parallel: usize,
    /// advisory, 0 = unknown
    pub size_hint: u64,
    pub xtrabackup: Option<String>,
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct SendJob {
    /// `None` reads the archive from standard input
    pub source: Option<PathBuf>,
    pub codec: Codec,
    pub sink: StreamSink,
    pub rate: u64,
    pub handshake: Option<String>,
    pub accept_timeout: std::time::Duration,
    pub size_hint: u64,
    pub log: LogConfig,
}

/// Destination of a received stream.
#[derive(Debug, Clone)]
pub enum ReceiveOutput {
    File { path: PathBuf, force: bool },
    Stdout,
    Extract { target_dir: PathBuf, codec: Codec },
}

#[derive(Debug, Clone)]
pub struct ReceiveJob {
    /// listen port, 0 = ephemeral
    pub port: u16,
    pub output: ReceiveOutput,
    pub rate: u64,
    pub handshake: Option<String>,
    pub accept_timeout: std::time::Duration,
    pub parallel: usize,
    pub size_hint: u64,
    pub xtrabackup: Option<String>,
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PrepareJob {
    pub target_dir: PathBuf,
    /// passed to the backup tool's `--use-memory`
    pub use_memory: String,
    pub xtrabackup: Option<String>,
    pub log: LogConfig,
}

pub(crate) fn validate_sink(sink: &StreamSink) -> anyhow::Result<()> {
    match sink {
        StreamSink::Oss(config) => {
            if config.endpoint.is_empty() || config.bucket.is_empty() {
                anyhow::bail!("object-store mode requires an endpoint and a bucket");
            }
            if config.part_size == 0 {
                anyhow::bail!("part size must be positive");
            }
            Ok(())
        }
        StreamSink::Dial { host, port } => {
            if host.is_empty() {
                anyhow::bail!("dial mode requires a receiver host");
            }
            if *port == 0 {
                anyhow::bail!("dial mode requires a receiver port");
            }
            Ok(())
        }
        StreamSink::SshDial { destination, .. } => {
            if destination.is_empty() {
                anyhow::bail!("SSH mode requires a destination host");
            }
            Ok(())
        }
        StreamSink::Listen { .. } => Ok(()),
    }
}

impl BackupJob {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.db.host.is_empty() || self.db.user.is_empty() {
            anyhow::bail!("backup requires a MySQL host and user");
        }
        if self.parallel == 0 {
            anyhow::bail!("parallelism must be positive");
        }
        validate_sink(&self.sink)
    }
}

impl SendJob {
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_sink(&self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn object_names_carry_timestamp_and_codec_suffix() {
        let at = chrono::Local
            .with_ymd_and_hms(2024, 3, 5, 9, 7, 1)
            .unwrap();
        assert_eq!(
            object_name("prod", Codec::None, at),
            "prod_20240305090701.xb"
        );
        assert_eq!(
            object_name("prod", Codec::Zstd, at),
            "prod_20240305090701.xb.zst"
        );
        assert_eq!(
            object_name("prod", Codec::Qp, at),
            "prod_20240305090701_qp.xb"
        );
    }

    #[test]
    fn dial_sink_requires_host_and_port() {
        let missing_port = StreamSink::Dial {
            host: "10.0.0.2".to_string(),
            port: 0,
        };
        assert!(validate_sink(&missing_port).is_err());
        let ok = StreamSink::Dial {
            host: "10.0.0.2".to_string(),
            port: 9000,
        };
        assert!(validate_sink(&ok).is_ok());
    }

    #[test]
    fn oss_sink_requires_endpoint_and_bucket() {
        let incomplete = StreamSink::Oss(OssConfig::default());
        assert!(validate_sink(&incomplete).is_err());
        let complete = StreamSink::Oss(OssConfig {
            endpoint: "https://oss.example.com".to_string(),
            bucket: "backups".to_string(),
            ..OssConfig::default()
        });
        assert!(validate_sink(&complete).is_ok());
    }
}
