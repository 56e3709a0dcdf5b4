use std::path::PathBuf;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};

use common::fmt::{clamp_accept_timeout, parse_rate, parse_size};
use xbrelay::coordinator;
use xbrelay::job::{
    BackupJob, Codec, DbConfig, LogConfig, OssConfig, PrepareJob, ReceiveJob, ReceiveOutput,
    SendJob, StreamSink,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "xbrelay",
    version,
    about = "Stream MySQL physical backups to object storage or a remote host",
    long_about = "`xbrelay` couples an xtrabackup process to a sink without touching disk: the
archive streams straight into an object-store multipart upload or over TCP to
a receiver, optionally through zstd. The same binary provides the receive and
extraction side.

EXAMPLES:
    # Back up straight into object storage, zstd-compressed
    xbrelay backup --user backup --password s3cr3t --mode oss --compress zstd \\
        --oss-endpoint https://oss.example.com --oss-bucket db-backups

    # Wait for a receiver to connect, limited to 50 MiB/s
    xbrelay backup --user backup --mode stream --io-limit 50MiB/s

    # Push to a remote host, bootstrapping the receiver over SSH
    xbrelay backup --user backup --mode stream --stream-host op@standby --ssh \\
        --remote-output /data/full.xb

    # Receive on an ephemeral port and extract in place
    xbrelay receive --from-stream 0 --target-dir /data/restore --compress zstd

    # Re-send an existing archive
    xbrelay send --file /data/full.xb --to-stream 9000 --stream-host standby"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Output")]
    quiet: bool,

    /// Job log file (absolute, or relative to --log-dir; auto-named when
    /// omitted)
    #[arg(long, global = true, value_name = "FILE", help_heading = "Output")]
    log_file: Option<String>,

    /// Directory for job logs
    #[arg(
        long,
        global = true,
        default_value = ".",
        value_name = "DIR",
        help_heading = "Output"
    )]
    log_dir: PathBuf,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the backup producer and stream its archive to a sink
    Backup(BackupArgs),
    /// Listen for a stream and write it to a file, stdout, or extract it
    Receive(ReceiveArgs),
    /// Stream an existing archive (file or stdin) to a sink
    Send(SendArgs),
    /// Run the backup tool's prepare phase against a backup directory
    Prepare(PrepareArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Mode {
    Oss,
    Stream,
}

#[derive(ClapArgs, Debug, Clone)]
struct BackupArgs {
    /// MySQL host
    #[arg(long, default_value = "127.0.0.1", help_heading = "MySQL connection")]
    host: String,

    /// MySQL port
    #[arg(long, default_value = "3306", help_heading = "MySQL connection")]
    port: u16,

    /// MySQL user
    #[arg(long, default_value = "root", help_heading = "MySQL connection")]
    user: String,

    /// MySQL password
    #[arg(long, default_value = "", env = "MYSQL_PWD", help_heading = "MySQL connection")]
    password: String,

    /// Where the archive goes
    #[arg(long, value_enum, default_value = "oss", help_heading = "Backup options")]
    mode: Mode,

    /// Archive codec
    #[arg(long, value_enum, default_value = "no", help_heading = "Backup options")]
    compress: Codec,

    /// Parallelism for the backup tool and codec stages
    #[arg(long, default_value = "1", value_name = "N", help_heading = "Backup options")]
    parallel: usize,

    /// Estimated archive size, for percentage display (advisory only)
    #[arg(long, value_name = "SIZE", help_heading = "Backup options")]
    size: Option<String>,

    /// Path to the xtrabackup binary or its directory
    #[arg(long, value_name = "PATH", help_heading = "Backup options")]
    xtrabackup_path: Option<String>,

    #[command(flatten)]
    stream: StreamArgs,

    #[command(flatten)]
    oss: OssArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct StreamArgs {
    /// Stream port (0 = pick an ephemeral port and announce it)
    #[arg(long, default_value = "0", value_name = "PORT", help_heading = "Streaming")]
    stream_port: u16,

    /// Receiver host; without it the sender listens and waits for a peer
    #[arg(long, value_name = "HOST", help_heading = "Streaming")]
    stream_host: Option<String>,

    /// Bootstrap the receiver on --stream-host over SSH first
    #[arg(long, help_heading = "Streaming")]
    ssh: bool,

    /// Output path for the SSH-bootstrapped remote receiver
    #[arg(long, value_name = "PATH", help_heading = "Streaming")]
    remote_output: Option<String>,

    /// I/O rate limit, human size with optional /s suffix (-1 = unlimited)
    #[arg(long, default_value = "-1", value_name = "RATE", help_heading = "Streaming")]
    io_limit: String,

    /// Require the shared-secret handshake before streaming
    #[arg(long, help_heading = "Streaming")]
    enable_handshake: bool,

    /// Shared secret for --enable-handshake
    #[arg(long, value_name = "KEY", help_heading = "Streaming")]
    stream_key: Option<String>,

    /// Accept timeout in seconds (0 = default 60, clamped to [1, 3600])
    #[arg(long, default_value = "60", value_name = "SECONDS", help_heading = "Streaming")]
    timeout: u64,
}

#[derive(ClapArgs, Debug, Clone)]
struct OssArgs {
    /// Object-store endpoint URL
    #[arg(long, value_name = "URL", help_heading = "Object store")]
    oss_endpoint: Option<String>,

    /// Bucket name
    #[arg(long, value_name = "BUCKET", help_heading = "Object store")]
    oss_bucket: Option<String>,

    /// Region passed through to the endpoint
    #[arg(long, default_value = "auto", value_name = "REGION", help_heading = "Object store")]
    oss_region: String,

    /// Access key id
    #[arg(long, env = "OSS_ACCESS_KEY_ID", default_value = "", value_name = "ID", help_heading = "Object store")]
    oss_access_key_id: String,

    /// Access key secret
    #[arg(long, env = "OSS_ACCESS_KEY_SECRET", default_value = "", value_name = "SECRET", help_heading = "Object store")]
    oss_access_key_secret: String,

    /// Object-name prefix; timestamp and codec suffix are appended
    #[arg(long, default_value = "backup", value_name = "PREFIX", help_heading = "Object store")]
    oss_prefix: String,

    /// Multipart part size
    #[arg(long, default_value = "100MiB", value_name = "SIZE", help_heading = "Object store")]
    part_size: String,
}

#[derive(ClapArgs, Debug, Clone)]
struct ReceiveArgs {
    /// Listen port for the incoming stream (0 = ephemeral)
    #[arg(long, default_value = "0", value_name = "PORT", help_heading = "Receive options")]
    from_stream: u16,

    /// Write the received archive to this file
    #[arg(long, value_name = "PATH", help_heading = "Receive options")]
    output: Option<PathBuf>,

    /// Extract the received archive into this directory instead
    #[arg(long, value_name = "DIR", conflicts_with = "output", help_heading = "Receive options")]
    target_dir: Option<PathBuf>,

    /// Codec of the incoming stream
    #[arg(long, value_enum, default_value = "no", help_heading = "Receive options")]
    compress: Codec,

    /// Overwrite an existing --output file without asking
    #[arg(long, help_heading = "Receive options")]
    force: bool,

    /// Parallelism for the decompressor and extractor
    #[arg(long, default_value = "1", value_name = "N", help_heading = "Receive options")]
    parallel: usize,

    /// Expected stream size, for percentage display (advisory only)
    #[arg(long, value_name = "SIZE", help_heading = "Receive options")]
    size: Option<String>,

    /// Path to the xtrabackup binary or its directory
    #[arg(long, value_name = "PATH", help_heading = "Receive options")]
    xtrabackup_path: Option<String>,

    /// I/O rate limit, human size with optional /s suffix (-1 = unlimited)
    #[arg(long, default_value = "-1", value_name = "RATE", help_heading = "Streaming")]
    io_limit: String,

    /// Require the shared-secret handshake before streaming
    #[arg(long, help_heading = "Streaming")]
    enable_handshake: bool,

    /// Shared secret for --enable-handshake
    #[arg(long, value_name = "KEY", help_heading = "Streaming")]
    stream_key: Option<String>,

    /// Accept timeout in seconds (0 = default 60, clamped to [1, 3600])
    #[arg(long, default_value = "60", value_name = "SECONDS", help_heading = "Streaming")]
    timeout: u64,
}

#[derive(ClapArgs, Debug, Clone)]
struct SendArgs {
    /// Archive file to send; reads stdin when omitted
    #[arg(long, value_name = "PATH", help_heading = "Send options")]
    file: Option<PathBuf>,

    /// Where the archive goes
    #[arg(long, value_enum, default_value = "stream", help_heading = "Send options")]
    mode: Mode,

    /// Receiver port to connect to (0 = listen and wait for a peer instead)
    #[arg(long, default_value = "0", value_name = "PORT", help_heading = "Send options")]
    to_stream: u16,

    /// Codec of the archive (names the object suffix, not a transform)
    #[arg(long, value_enum, default_value = "no", help_heading = "Send options")]
    compress: Codec,

    /// Estimated archive size, for percentage display (advisory only)
    #[arg(long, value_name = "SIZE", help_heading = "Send options")]
    size: Option<String>,

    #[command(flatten)]
    stream: StreamArgs,

    #[command(flatten)]
    oss: OssArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct PrepareArgs {
    /// Backup directory to prepare
    #[arg(long, value_name = "DIR", help_heading = "Prepare options")]
    target_dir: PathBuf,

    /// Memory budget for the prepare phase
    #[arg(long, default_value = "1G", value_name = "SIZE", help_heading = "Prepare options")]
    use_memory: String,

    /// Path to the xtrabackup binary or its directory
    #[arg(long, value_name = "PATH", help_heading = "Prepare options")]
    xtrabackup_path: Option<String>,
}

fn handshake_key(enabled: bool, key: Option<String>) -> anyhow::Result<Option<String>> {
    if !enabled {
        return Ok(None);
    }
    key.filter(|key| !key.is_empty())
        .map(Some)
        .context("--enable-handshake requires --stream-key")
}

fn parse_size_hint(size: Option<&str>) -> anyhow::Result<u64> {
    match size {
        Some(value) => parse_size(value),
        None => Ok(0),
    }
}

fn build_oss(args: &OssArgs, rate: u64) -> anyhow::Result<OssConfig> {
    Ok(OssConfig {
        endpoint: args
            .oss_endpoint
            .clone()
            .context("object-store mode requires --oss-endpoint")?,
        bucket: args
            .oss_bucket
            .clone()
            .context("object-store mode requires --oss-bucket")?,
        region: args.oss_region.clone(),
        access_key_id: args.oss_access_key_id.clone(),
        access_key_secret: args.oss_access_key_secret.clone(),
        prefix: args.oss_prefix.clone(),
        part_size: parse_size(&args.part_size)? as usize,
        rate_limit: rate,
    })
}

fn build_sink(
    mode: Mode,
    stream: &StreamArgs,
    oss: &OssArgs,
    port: u16,
    rate: u64,
) -> anyhow::Result<StreamSink> {
    match mode {
        Mode::Oss => Ok(StreamSink::Oss(build_oss(oss, rate)?)),
        Mode::Stream => match &stream.stream_host {
            None => Ok(StreamSink::Listen { port }),
            Some(host) if stream.ssh => Ok(StreamSink::SshDial {
                destination: host.clone(),
                port,
                remote_output: stream.remote_output.clone(),
            }),
            Some(host) => Ok(StreamSink::Dial {
                host: host.clone(),
                port,
            }),
        },
    }
}

fn log_config(args: &Args) -> LogConfig {
    LogConfig {
        name: args.log_file.clone(),
        dir: args.log_dir.clone(),
    }
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let log = log_config(&args);
    match args.command {
        Command::Backup(backup) => {
            let rate = parse_rate(&backup.stream.io_limit)?;
            let job = BackupJob {
                db: DbConfig {
                    host: backup.host.clone(),
                    port: backup.port,
                    user: backup.user.clone(),
                    password: backup.password.clone(),
                },
                codec: backup.compress,
                sink: build_sink(
                    backup.mode,
                    &backup.stream,
                    &backup.oss,
                    backup.stream.stream_port,
                    rate,
                )?,
                rate,
                handshake: handshake_key(
                    backup.stream.enable_handshake,
                    backup.stream.stream_key.clone(),
                )?,
                accept_timeout: std::time::Duration::from_secs(clamp_accept_timeout(
                    backup.stream.timeout,
                )),
                parallel: backup.parallel.max(1),
                size_hint: parse_size_hint(backup.size.as_deref())?,
                xtrabackup: backup.xtrabackup_path.clone(),
                log,
            };
            coordinator::run_backup(job).await
        }
        Command::Receive(receive) => {
            let output = match (&receive.output, &receive.target_dir) {
                (Some(path), None) => ReceiveOutput::File {
                    path: path.clone(),
                    force: receive.force,
                },
                (None, Some(dir)) => ReceiveOutput::Extract {
                    target_dir: dir.clone(),
                    codec: receive.compress,
                },
                (None, None) => ReceiveOutput::Stdout,
                (Some(_), Some(_)) => unreachable!("clap rejects --output with --target-dir"),
            };
            let job = ReceiveJob {
                port: receive.from_stream,
                output,
                rate: parse_rate(&receive.io_limit)?,
                handshake: handshake_key(receive.enable_handshake, receive.stream_key.clone())?,
                accept_timeout: std::time::Duration::from_secs(clamp_accept_timeout(
                    receive.timeout,
                )),
                parallel: receive.parallel.max(1),
                size_hint: parse_size_hint(receive.size.as_deref())?,
                xtrabackup: receive.xtrabackup_path.clone(),
                log,
            };
            coordinator::run_receive(job).await
        }
        Command::Send(send) => {
            let rate = parse_rate(&send.stream.io_limit)?;
            let job = SendJob {
                source: send.file.clone(),
                codec: send.compress,
                sink: build_sink(send.mode, &send.stream, &send.oss, send.to_stream, rate)?,
                rate,
                handshake: handshake_key(
                    send.stream.enable_handshake,
                    send.stream.stream_key.clone(),
                )?,
                accept_timeout: std::time::Duration::from_secs(clamp_accept_timeout(
                    send.stream.timeout,
                )),
                size_hint: parse_size_hint(send.size.as_deref())?,
                log,
            };
            coordinator::run_send(job).await
        }
        Command::Prepare(prepare) => {
            let job = PrepareJob {
                target_dir: prepare.target_dir.clone(),
                use_memory: prepare.use_memory.clone(),
                xtrabackup: prepare.xtrabackup_path.clone(),
                log,
            };
            coordinator::run_prepare(job).await
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: 0,
    };
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    if common::run(&output, &runtime, func).is_none() {
        std::process::exit(1);
    }
    Ok(())
}
