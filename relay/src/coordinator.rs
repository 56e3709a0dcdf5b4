//! Job orchestration.
//!
//! Wires a source, an optional rate-limit wrapper and a sink, runs the copy
//! to completion and owns the teardown ordering: on a fatal error the
//! producer is terminated first, then the sink is closed, then every
//! subprocess is waited on. Errors raised during that cleanup are written
//! to the job log but never replace the first fatal error.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use common::{JobLog, Module, Progress, ProgressSink};
use throttle::{RateLimiter, ThrottledWriter};

use crate::job::{
    self, BackupJob, Codec, PrepareJob, ReceiveJob, ReceiveOutput, SendJob, StreamSink,
};
use crate::pipeline;
use crate::stages;
use crate::store::{self, OssStore};

/// First 8 bytes of every xbstream archive.
pub const XBSTREAM_MAGIC: &[u8; 8] = b"XBSTCK01";

/// The backup tool's authoritative success signal; a zero exit status
/// without it is still a failure.
const PRODUCER_SENTINEL: &str = "completed OK!";

const COPY_BUF: usize = 64 * 1024;

/// Copy source to sink through the limiter, counting every byte into the
/// progress tracker. Returns the total and the sink so the caller can
/// finish closing it.
async fn copy_stream<R, W>(
    mut source: R,
    sink: W,
    limiter: Arc<RateLimiter>,
    progress: &Progress,
) -> std::io::Result<(u64, W)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sink = ThrottledWriter::new(sink, limiter);
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let read = source.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        sink.write_all(&buf[..read]).await?;
        progress.add(read as u64);
        total += read as u64;
    }
    sink.flush().await?;
    Ok((total, sink.into_inner()))
}

/// Validate a file source before any transfer begins. Standard input is
/// never validated since its bytes cannot be un-read.
pub fn check_xbstream_magic(path: &Path) -> anyhow::Result<()> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)
        .map_err(|_| anyhow::anyhow!("{} is too short to be an xbstream archive", path.display()))?;
    if &magic != XBSTREAM_MAGIC {
        anyhow::bail!("{} is not an xbstream archive (bad magic)", path.display());
    }
    Ok(())
}

struct SinkContext<'a> {
    codec: Codec,
    rate: u64,
    handshake: Option<&'a str>,
    accept_timeout: std::time::Duration,
    log: &'a Arc<JobLog>,
    progress: &'a Progress,
}

/// Move the source stream into the requested sink. The local limiter wraps
/// every sink except the object store, whose per-request header is enforced
/// remotely.
async fn deliver<R>(source: R, sink: &StreamSink, ctx: SinkContext<'_>) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
{
    match sink {
        StreamSink::Oss(config) => {
            let object = job::object_name(&config.prefix, ctx.codec, chrono::Local::now());
            let oss = OssStore::connect(config)?;
            let total = store::upload(
                &oss,
                &object,
                config.part_size,
                source,
                Some(ctx.progress),
                Some(ctx.log),
            )
            .await?;
            eprintln!("Saved to: {}/{}", config.bucket, object);
            Ok(total)
        }
        StreamSink::Listen { port } => {
            let listener = remote::Listener::bind(*port).await?;
            listener.announce();
            ctx.log
                .write(Module::Tcp, &format!("listening on {}", listener.advertised_addr()));
            let mut session = listener
                .accept_one(ctx.accept_timeout, ctx.handshake, Some(ctx.log))
                .await?;
            let limiter = RateLimiter::new(ctx.rate);
            let (total, _) = copy_stream(source, session.stream_mut(), limiter, ctx.progress).await?;
            session.close().await?;
            Ok(total)
        }
        StreamSink::Dial { host, port } => {
            let mut session = remote::dial(host, *port, remote::DIAL_TIMEOUT, ctx.handshake).await?;
            ctx.log
                .write(Module::Tcp, &format!("connected to {host}:{port}"));
            let limiter = RateLimiter::new(ctx.rate);
            let (total, _) = copy_stream(source, session.stream_mut(), limiter, ctx.progress).await?;
            session.close().await?;
            Ok(total)
        }
        StreamSink::SshDial {
            destination,
            port,
            remote_output,
        } => {
            let spec = remote::bootstrap::ReceiverSpec {
                destination: destination.clone(),
                program: "xbrelay".to_string(),
                stream_port: *port,
                output: remote_output.clone(),
                size_hint: (ctx.progress.total() > 0).then(|| ctx.progress.total()),
                handshake_key: ctx.handshake.map(str::to_owned),
            };
            let receiver = remote::bootstrap::start_receiver(&spec, Some(ctx.log)).await?;
            let host = ssh_host(destination).to_string();
            let streamed = async {
                if ctx.handshake.is_some() {
                    // a probe connection is only safe when the receiver
                    // rejects it and keeps listening
                    remote::health_check(&host, receiver.port()).await?;
                }
                let mut session =
                    remote::dial(&host, receiver.port(), remote::DIAL_TIMEOUT, ctx.handshake)
                        .await?;
                let limiter = RateLimiter::new(ctx.rate);
                let (total, _) =
                    copy_stream(source, session.stream_mut(), limiter, ctx.progress).await?;
                session.close().await?;
                Ok::<u64, anyhow::Error>(total)
            }
            .await;
            match streamed {
                Ok(total) => {
                    receiver.wait().await?;
                    Ok(total)
                }
                Err(error) => {
                    ctx.log
                        .write(Module::Ssh, "terminating remote receiver after failure");
                    receiver.shutdown(Some(ctx.log.as_ref())).await;
                    Err(error)
                }
            }
        }
    }
}

fn ssh_host(destination: &str) -> &str {
    destination
        .rsplit_once('@')
        .map_or(destination, |(_, host)| host)
}

/// Footer, operator-facing error summary and log closure shared by every
/// job kind.
fn finish_job(log: &JobLog, result: &anyhow::Result<()>, module: Module) {
    match result {
        Ok(()) => log.close(true),
        Err(error) => {
            log.write(Module::System, &format!("job failed: {error:#}"));
            log.close(false);
            eprintln!("Job log: {}", log.path().display());
            for line in log.error_summary(module) {
                eprintln!("  {line}");
            }
        }
    }
}

pub async fn run_backup(job: BackupJob) -> anyhow::Result<()> {
    job.validate()?;
    let log = JobLog::open(job.log.name.as_deref(), &job.log.dir)?;
    log.write(Module::System, "backup job started");
    let result = backup_inner(&job, &log).await;
    finish_job(&log, &result, Module::Backup);
    result
}

async fn backup_inner(job: &BackupJob, log: &Arc<JobLog>) -> anyhow::Result<()> {
    let bin = stages::resolve_xtrabackup(job.xtrabackup.as_deref());
    let mut specs = vec![stages::backup_producer(
        &bin,
        &job.db,
        job.parallel,
        job.codec == Codec::Qp,
    )];
    if job.codec == Codec::Zstd {
        specs.push(stages::zstd_compress(job.parallel));
    }
    let (mut pipeline, output) =
        pipeline::reader(&specs, Some(log.clone()), Some(PRODUCER_SENTINEL))?;
    let progress = Progress::new(job.size_hint, ProgressSink::Stdout);
    let ctx = SinkContext {
        codec: job.codec,
        rate: job.rate,
        handshake: job.handshake.as_deref(),
        accept_timeout: job.accept_timeout,
        log,
        progress: &progress,
    };
    let (delivery, waited) = match deliver(output, &job.sink, ctx).await {
        Ok(total) => {
            let waited = pipeline.wait_all().await;
            (Ok(total), waited)
        }
        Err(error) => {
            // stop the producer before anything else so it stops writing
            // into a dead pipe
            pipeline.shutdown().await;
            (Err(error), Ok(()))
        }
    };
    progress.finish();
    let total = match (delivery, waited) {
        (Err(error), Err(cleanup)) => {
            log.write(Module::Backup, &format!("cleanup: {cleanup}"));
            return Err(error);
        }
        (Err(error), Ok(())) => return Err(error),
        (Ok(_), Err(error)) => return Err(error.into()),
        (Ok(total), Ok(())) => total,
    };
    if !pipeline.sentinel_seen() {
        anyhow::bail!("backup tool never reported '{PRODUCER_SENTINEL}'");
    }
    log.write(Module::Backup, &format!("backup streamed {total} bytes"));
    Ok(())
}

pub async fn run_send(job: SendJob) -> anyhow::Result<()> {
    job.validate()?;
    let log = JobLog::open(job.log.name.as_deref(), &job.log.dir)?;
    log.write(Module::System, "send job started");
    let result = send_inner(&job, &log).await;
    finish_job(&log, &result, Module::System);
    result
}

async fn send_inner(job: &SendJob, log: &Arc<JobLog>) -> anyhow::Result<()> {
    let mut size_hint = job.size_hint;
    let source: Box<dyn AsyncRead + Unpin + Send> = match &job.source {
        Some(path) => {
            // compressed archives do not start with the magic
            if job.codec == Codec::None {
                check_xbstream_magic(path)?;
            }
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            if size_hint == 0 {
                size_hint = file.metadata().await?.len();
            }
            Box::new(file)
        }
        None => Box::new(tokio::io::stdin()),
    };
    let progress = Progress::new(size_hint, ProgressSink::Stdout);
    let ctx = SinkContext {
        codec: job.codec,
        rate: job.rate,
        handshake: job.handshake.as_deref(),
        accept_timeout: job.accept_timeout,
        log,
        progress: &progress,
    };
    let result = deliver(source, &job.sink, ctx).await;
    progress.finish();
    let total = result?;
    log.write(Module::System, &format!("sent {total} bytes"));
    Ok(())
}

pub async fn run_receive(job: ReceiveJob) -> anyhow::Result<()> {
    if let ReceiveOutput::File { path, force } = &job.output {
        if path.exists() && !force {
            let path = path.clone();
            let confirmed =
                tokio::task::spawn_blocking(move || confirm_overwrite(&path)).await??;
            if !confirmed {
                println!("Canceled");
                return Ok(());
            }
        }
    }
    let log = JobLog::open(job.log.name.as_deref(), &job.log.dir)?;
    log.write(Module::System, "receive job started");
    let result = receive_inner(&job, &log).await;
    finish_job(&log, &result, Module::Download);
    result
}

fn confirm_overwrite(path: &Path) -> anyhow::Result<bool> {
    use std::io::Write;
    eprint!("File {} exists. Overwrite? [y/N] ", path.display());
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

async fn receive_inner(job: &ReceiveJob, log: &Arc<JobLog>) -> anyhow::Result<()> {
    let listener = remote::Listener::bind(job.port).await?;
    // both lines are scanned by the SSH bootstrap on the sending side
    eprintln!("Receiver PID: {}", std::process::id());
    listener.announce();
    log.write(
        Module::Tcp,
        &format!("listening on {}", listener.advertised_addr()),
    );
    let mut session = listener
        .accept_one(job.accept_timeout, job.handshake.as_deref(), Some(log))
        .await?;
    log.write(Module::Download, &format!("peer {}", session.peer_addr()));
    let limiter = RateLimiter::new(job.rate);
    let progress_sink = if matches!(job.output, ReceiveOutput::Stdout) {
        ProgressSink::Stderr
    } else {
        ProgressSink::Stdout
    };
    let progress = Progress::new(job.size_hint, progress_sink);
    let result = match &job.output {
        ReceiveOutput::File { path, .. } => {
            receive_to_file(session.stream_mut(), path, limiter, &progress, log).await
        }
        ReceiveOutput::Stdout => {
            receive_to_stdout(session.stream_mut(), limiter, &progress).await
        }
        ReceiveOutput::Extract { target_dir, codec } => {
            extract(
                session.stream_mut(),
                target_dir,
                *codec,
                job.parallel,
                job.xtrabackup.as_deref(),
                limiter,
                &progress,
                log,
            )
            .await
        }
    };
    if let Err(error) = session.close().await {
        if result.is_ok() {
            progress.finish();
            return Err(error.into());
        }
        log.write(Module::Tcp, &format!("session close failed: {error}"));
    }
    progress.finish();
    let total = result?;
    if let ReceiveOutput::File { path, .. } = &job.output {
        eprintln!("Saved to: {}", path.display());
    }
    log.write(Module::Download, &format!("received {total} bytes"));
    Ok(())
}

async fn receive_to_file<R>(
    source: R,
    path: &Path,
    limiter: Arc<RateLimiter>,
    progress: &Progress,
    log: &Arc<JobLog>,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    let (total, file) = copy_stream(source, file, limiter, progress).await?;
    file.sync_all().await?;
    log.write(
        Module::Download,
        &format!("wrote {total} bytes to {}", path.display()),
    );
    Ok(total)
}

async fn receive_to_stdout<R>(
    source: R,
    limiter: Arc<RateLimiter>,
    progress: &Progress,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let (total, mut stdout) = copy_stream(source, tokio::io::stdout(), limiter, progress).await?;
    stdout.flush().await?;
    Ok(total)
}

/// Extraction path of the receive direction. zstd streams through a
/// decompressor into the extractor; qpress archives cannot be extracted
/// from a stream and are spilled to a temporary file first.
#[allow(clippy::too_many_arguments)]
async fn extract<R>(
    source: R,
    target_dir: &Path,
    codec: Codec,
    parallel: usize,
    xtrabackup: Option<&str>,
    limiter: Arc<RateLimiter>,
    progress: &Progress,
    log: &Arc<JobLog>,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
{
    tokio::fs::create_dir_all(target_dir)
        .await
        .with_context(|| format!("failed to create {}", target_dir.display()))?;
    let xbstream = stages::resolve_xbstream(xtrabackup);
    match codec {
        Codec::Zstd | Codec::None => {
            let mut specs = Vec::new();
            if codec == Codec::Zstd {
                specs.push(stages::zstd_decompress(parallel));
            }
            specs.push(stages::xbstream_extract(&xbstream, target_dir, parallel));
            let (mut pipeline, stdin) = pipeline::writer(&specs, Some(log.clone()))?;
            match copy_stream(source, stdin, limiter, progress).await {
                Ok((total, mut stdin)) => {
                    stdin.shutdown().await?;
                    drop(stdin);
                    pipeline.wait_all().await?;
                    Ok(total)
                }
                Err(error) => {
                    pipeline.shutdown().await;
                    Err(error.into())
                }
            }
        }
        Codec::Qp => {
            let spill = tempfile::NamedTempFile::new().context("failed to create spill file")?;
            let file = tokio::fs::File::from_std(
                spill.reopen().context("failed to reopen spill file")?,
            );
            let (total, mut file) = copy_stream(source, file, limiter, progress).await?;
            file.flush().await?;
            drop(file);
            log.write(
                Module::Download,
                &format!("spilled {total} bytes to {}", spill.path().display()),
            );
            let archive = spill.reopen().context("failed to reopen spill file")?;
            let extract_stage = [stages::xbstream_extract(&xbstream, target_dir, parallel)];
            let mut extraction =
                pipeline::detached_from_file(&extract_stage, archive, Some(log.clone()))?;
            extraction.wait_all().await?;
            let bin = stages::resolve_xtrabackup(xtrabackup);
            let decompress_stage = [stages::decompress_dir(&bin, target_dir, parallel)];
            let mut decompression =
                pipeline::detached(&decompress_stage, Some(log.clone()), None)?;
            decompression.wait_all().await?;
            spill.close().context("failed to remove spill file")?;
            Ok(total)
        }
    }
}

pub async fn run_prepare(job: PrepareJob) -> anyhow::Result<()> {
    let log = JobLog::open(job.log.name.as_deref(), &job.log.dir)?;
    log.write(Module::System, "prepare started");
    let result = prepare_inner(&job, &log).await;
    finish_job(&log, &result, Module::Prepare);
    result
}

async fn prepare_inner(job: &PrepareJob, log: &Arc<JobLog>) -> anyhow::Result<()> {
    if !job.target_dir.is_dir() {
        anyhow::bail!("{} is not a directory", job.target_dir.display());
    }
    let bin = stages::resolve_xtrabackup(job.xtrabackup.as_deref());
    let specs = [stages::prepare(&bin, &job.target_dir, &job.use_memory)];
    let mut pipeline = pipeline::detached(&specs, Some(log.clone()), Some(PRODUCER_SENTINEL))?;
    pipeline.wait_all().await?;
    if !pipeline.sentinel_seen() {
        anyhow::bail!("prepare never reported '{PRODUCER_SENTINEL}'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_accepts_real_archives_only() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.xb");
        std::fs::write(&good, b"XBSTCK01rest of the archive").unwrap();
        assert!(check_xbstream_magic(&good).is_ok());

        let bad = dir.path().join("bad.xb");
        std::fs::write(&bad, b"NOTMAGICrest").unwrap();
        assert!(check_xbstream_magic(&bad).is_err());

        let short = dir.path().join("short.xb");
        std::fs::write(&short, b"XB").unwrap();
        assert!(check_xbstream_magic(&short).is_err());
    }

    #[test]
    fn ssh_destination_host_extraction() {
        assert_eq!(ssh_host("op@db1.internal"), "db1.internal");
        assert_eq!(ssh_host("db1.internal"), "db1.internal");
        assert_eq!(ssh_host("a@b@c"), "c");
    }

    #[tokio::test]
    async fn copy_preserves_bytes_and_counts_them() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let progress = Progress::new(payload.len() as u64, ProgressSink::Stderr);
        let limiter = RateLimiter::new(0);
        let (total, sink) = copy_stream(
            std::io::Cursor::new(payload.clone()),
            Vec::new(),
            limiter,
            &progress,
        )
        .await
        .unwrap();
        assert_eq!(total, payload.len() as u64);
        assert_eq!(sink, payload);
        assert_eq!(progress.transferred(), payload.len() as u64);
    }
}
