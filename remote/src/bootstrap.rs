//! Out-of-band SSH bootstrap for the active-push mode.
//!
//! Launches this same binary in receive mode on the remote host, parses the
//! receiver's announced listening port (and PID) from its stderr, and keeps
//! the SSH child around so the remote process can be torn down if the job
//! fails. Cleanup kills the recorded PID; it never kills by process name so
//! unrelated instances on the host survive.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncBufReadExt;

use common::{JobLog, Module};

/// Deadline for the receiver to announce its listening port.
pub const PORT_PARSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// What to start on the remote side.
#[derive(Debug, Clone)]
pub struct ReceiverSpec {
    /// SSH destination, `user@host` accepted verbatim
    pub destination: String,
    /// remote binary, default `xbrelay`
    pub program: String,
    /// requested stream port, 0 = let the receiver pick
    pub stream_port: u16,
    /// remote output path, receiver default when `None`
    pub output: Option<String>,
    /// advisory size hint for remote progress display
    pub size_hint: Option<u64>,
    /// handshake key; enables the handshake on the remote side
    pub handshake_key: Option<String>,
}

impl ReceiverSpec {
    /// Shell command executed on the remote host. Rate limiting is forced
    /// off remotely so only the sender throttles.
    fn command(&self) -> String {
        let mut cmd = format!(
            "{} receive --from-stream {} --io-limit -1",
            shell_escape(&self.program),
            self.stream_port
        );
        if let Some(output) = &self.output {
            cmd.push_str(&format!(" --output {}", shell_escape(output)));
        }
        if let Some(size) = self.size_hint {
            cmd.push_str(&format!(" --size {size}"));
        }
        if let Some(key) = &self.handshake_key {
            cmd.push_str(&format!(
                " --enable-handshake --stream-key {}",
                shell_escape(key)
            ));
        }
        cmd
    }
}

/// Running remote receiver.
pub struct RemoteReceiver {
    session: Arc<openssh::Session>,
    child: openssh::Child<Arc<openssh::Session>>,
    port: u16,
    pid: Option<u32>,
    output: Option<String>,
}

impl RemoteReceiver {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Remote output path as supplied; the receiver only announces the
    /// saved path after the transfer completes.
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// Terminate the remote receiver (by its recorded PID) and drop the
    /// local SSH child. Best-effort; failures are logged.
    pub async fn shutdown(self, log: Option<&JobLog>) {
        if let Some(pid) = self.pid {
            let result = self
                .session
                .command("sh")
                .arg("-c")
                .arg(format!("kill -TERM {pid} 2>/dev/null"))
                .output()
                .await;
            match result {
                Ok(output) if output.status.success() => {
                    tracing::debug!("remote receiver pid {pid} terminated");
                }
                Ok(_) => tracing::debug!("remote receiver pid {pid} already gone"),
                Err(error) => {
                    tracing::warn!("failed to signal remote receiver: {error}");
                    if let Some(log) = log {
                        log.write(Module::Ssh, &format!("remote kill failed: {error}"));
                    }
                }
            }
        }
        if let Err(error) = self.child.disconnect().await {
            tracing::debug!("ssh child disconnect: {error}");
        }
    }

    /// Wait for the remote receiver to finish on its own (successful
    /// transfer path).
    pub async fn wait(self) -> anyhow::Result<()> {
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait for remote receiver")?;
        if !status.success() {
            anyhow::bail!("remote receiver exited with {status}");
        }
        Ok(())
    }
}

/// Start the remote receiver and parse its announced endpoint.
pub async fn start_receiver(
    spec: &ReceiverSpec,
    log: Option<&Arc<JobLog>>,
) -> anyhow::Result<RemoteReceiver> {
    tracing::info!("starting remote receiver on {}", spec.destination);
    let session = Arc::new(
        openssh::Session::connect(&spec.destination, openssh::KnownHosts::Accept)
            .await
            .with_context(|| format!("failed to establish SSH session to {}", spec.destination))?,
    );
    let command = spec.command();
    tracing::debug!("remote command: {command}");
    if let Some(log) = log {
        log.write(Module::Ssh, &format!("remote command: {command}"));
    }
    let mut child = session
        .clone()
        .arc_command("sh")
        .arg("-c")
        .arg(&command)
        .stdin(openssh::Stdio::null())
        .stdout(openssh::Stdio::null())
        .stderr(openssh::Stdio::piped())
        .spawn()
        .await
        .context("failed to spawn remote receiver over SSH")?;
    let stderr = child
        .stderr()
        .take()
        .context("failed to capture remote receiver stderr")?;
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    let listen_re = regex::Regex::new(r"Listening on ([0-9.]+):([0-9]+)")
        .expect("static regex");
    let pid_re = regex::Regex::new(r"Receiver PID: ([0-9]+)").expect("static regex");
    let deadline = tokio::time::Instant::now() + PORT_PARSE_TIMEOUT;
    let mut pid = None;
    let port = loop {
        let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                let _ = child.disconnect().await;
                anyhow::bail!("remote receiver exited before announcing its port");
            }
            Ok(Err(error)) => {
                let _ = child.disconnect().await;
                return Err(error).context("failed to read remote receiver stderr");
            }
            Err(_) => {
                let _ = child.disconnect().await;
                anyhow::bail!(
                    "remote receiver did not announce a listening port within {}s",
                    PORT_PARSE_TIMEOUT.as_secs()
                );
            }
        };
        tracing::debug!("remote: {line}");
        if let Some(log) = log {
            log.write(Module::Ssh, &line);
        }
        if let Some(captures) = pid_re.captures(&line) {
            pid = captures[1].parse::<u32>().ok();
        }
        if let Some(captures) = listen_re.captures(&line) {
            let port: u16 = captures[2]
                .parse()
                .context("remote receiver announced a malformed port")?;
            break port;
        }
    };
    if spec.stream_port != 0 && port != spec.stream_port {
        let receiver = RemoteReceiver {
            session,
            child,
            port,
            pid,
            output: spec.output.clone(),
        };
        let message = format!(
            "remote receiver listens on port {port}, expected {}",
            spec.stream_port
        );
        receiver.shutdown(log.map(Arc::as_ref)).await;
        anyhow::bail!(message);
    }
    // keep draining stderr into the job log for the rest of the transfer
    if let Some(log) = log {
        let log = log.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                log.write(Module::Ssh, &line);
            }
        });
    }
    Ok(RemoteReceiver {
        session,
        child,
        port,
        pid,
        output: spec.output.clone(),
    })
}

/// Quote a string for safe use inside `sh -c`.
pub fn shell_escape(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&b))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_includes_every_supplied_flag() {
        let spec = ReceiverSpec {
            destination: "op@db1".to_string(),
            program: "xbrelay".to_string(),
            stream_port: 9000,
            output: Some("/data/full.xb".to_string()),
            size_hint: Some(1 << 30),
            handshake_key: Some("s3cret".to_string()),
        };
        let cmd = spec.command();
        assert_eq!(
            cmd,
            "xbrelay receive --from-stream 9000 --io-limit -1 \
             --output /data/full.xb --size 1073741824 \
             --enable-handshake --stream-key s3cret"
        );
    }

    #[test]
    fn command_with_auto_port_and_defaults() {
        let spec = ReceiverSpec {
            destination: "db1".to_string(),
            program: "xbrelay".to_string(),
            stream_port: 0,
            output: None,
            size_hint: None,
            handshake_key: None,
        };
        assert_eq!(spec.command(), "xbrelay receive --from-stream 0 --io-limit -1");
    }

    #[test]
    fn shell_escaping() {
        assert_eq!(shell_escape("plain-path_1.xb"), "plain-path_1.xb");
        assert_eq!(shell_escape("with space"), "'with space'");
        assert_eq!(shell_escape("a'b"), r"'a'\''b'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn announcement_parsing() {
        let listen_re = regex::Regex::new(r"Listening on ([0-9.]+):([0-9]+)").unwrap();
        let captures = listen_re
            .captures("Listening on 10.2.3.4:40123")
            .unwrap();
        assert_eq!(&captures[1], "10.2.3.4");
        assert_eq!(&captures[2], "40123");
        assert!(listen_re.captures("still starting up").is_none());
    }
}
