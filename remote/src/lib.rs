//! TCP stream transport for xbrelay.
//!
//! One `Transport` in two roles: a passive listener that accepts exactly one
//! validated peer, and an active dialer. Both roles optionally run the
//! line-based handshake before any payload byte moves. The session owns its
//! socket (and listener, in the passive role); readers and writers are
//! borrows that end when the session is closed.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use common::{JobLog, Module};

pub mod bootstrap;

/// Deadline for reading the handshake line after a connection is
/// established. Distinct from the accept timeout.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Deadline for health-check dials.
pub const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Exact rejection written to a peer that sent no handshake line.
pub const REJECT_NO_HANDSHAKE: &str = "Please send handshake\n";

/// Exact rejection written to a peer whose handshake did not match.
pub const REJECT_BAD_HANDSHAKE: &str =
    "Invalid handshake. Send the correct handshake to begin streaming.\n";

const HANDSHAKE_MAX_LINE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        source: std::io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },
    #[error("no peer connected within {0}s")]
    AcceptTimeout(u64),
    #[error("peer did not complete the handshake in time")]
    HandshakeTimeout,
    #[error("peer sent an invalid handshake")]
    HandshakeMismatch,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Established connection. In the passive role the listener is retained so
/// it closes together with the session.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    listener: Option<TcpListener>,
    peer: SocketAddr,
}

impl Session {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Shut down the write half and release the socket and listener.
    pub async fn close(mut self) -> std::io::Result<()> {
        let result = self.stream.shutdown().await;
        drop(self.listener);
        result
    }
}

/// Passive role: bound listener plus the address it advertises to
/// operators.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    advertised: SocketAddr,
}

impl Listener {
    /// Bind to the requested port; port 0 acquires an ephemeral port. The
    /// advertised address uses the best-guess local IP.
    pub async fn bind(port: u16) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| TransportError::Listen { port, source })?;
        let bound = inner.local_addr()?;
        let advertised = SocketAddr::new(local_ip(), bound.port());
        Ok(Self { inner, advertised })
    }

    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    pub fn port(&self) -> u16 {
        self.advertised.port()
    }

    /// Announce the endpoint on the operator channel. Emitted to stderr and
    /// scanned verbatim by the SSH bootstrap; the format is part of the
    /// operator contract.
    pub fn announce(&self) {
        eprintln!("Listening on {}", self.advertised);
    }

    /// Accept exactly one connection, validating the handshake when one is
    /// configured. Rejected peers are answered and dropped, and the accept
    /// loop continues until the deadline.
    pub async fn accept_one(
        self,
        accept_timeout: std::time::Duration,
        handshake: Option<&str>,
        log: Option<&JobLog>,
    ) -> Result<Session, TransportError> {
        let deadline = tokio::time::Instant::now() + accept_timeout;
        loop {
            let (mut stream, peer) =
                match tokio::time::timeout_at(deadline, self.inner.accept()).await {
                    Ok(accepted) => accepted?,
                    Err(_) => {
                        return Err(TransportError::AcceptTimeout(accept_timeout.as_secs()))
                    }
                };
            tracing::info!("accepted connection from {peer}");
            if let Some(log) = log {
                log.write(Module::Tcp, &format!("connection from {peer}"));
            }
            let Some(key) = handshake else {
                return Ok(Session {
                    stream,
                    listener: Some(self.inner),
                    peer,
                });
            };
            match read_handshake(&mut stream).await {
                Ok(line) if line == key => {
                    if let Some(log) = log {
                        log.write(Module::Tcp, &format!("handshake accepted from {peer}"));
                    }
                    return Ok(Session {
                        stream,
                        listener: Some(self.inner),
                        peer,
                    });
                }
                Ok(_) => {
                    tracing::warn!("invalid handshake from {peer}");
                    if let Some(log) = log {
                        log.write(Module::Tcp, &format!("invalid handshake from {peer}"));
                    }
                    let _ = stream.write_all(REJECT_BAD_HANDSHAKE.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
                Err(TransportError::HandshakeTimeout) => {
                    tracing::warn!("no handshake from {peer}");
                    if let Some(log) = log {
                        log.write(Module::Tcp, &format!("no handshake from {peer}"));
                    }
                    let _ = stream.write_all(REJECT_NO_HANDSHAKE.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
                Err(error) => {
                    tracing::warn!("handshake read failed from {peer}: {error}");
                    let _ = stream.write_all(REJECT_NO_HANDSHAKE.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            }
        }
    }
}

/// Active role: dial `host:port` within `timeout`, sending the handshake
/// line first when one is configured.
pub async fn dial(
    host: &str,
    port: u16,
    timeout: std::time::Duration,
    handshake: Option<&str>,
) -> Result<Session, TransportError> {
    let addr = format!("{host}:{port}");
    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(TransportError::Dial { addr, source }),
        Err(_) => {
            return Err(TransportError::Dial {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })
        }
    };
    if let Some(key) = handshake {
        stream.write_all(format!("{key}\n").as_bytes()).await?;
        stream.flush().await?;
    }
    let peer = stream.peer_addr()?;
    Ok(Session {
        stream,
        listener: None,
        peer,
    })
}

/// Probe that a receiver is reachable; connection is closed immediately.
pub async fn health_check(host: &str, port: u16) -> Result<(), TransportError> {
    let session = dial(host, port, DIAL_TIMEOUT, None).await?;
    session.close().await?;
    Ok(())
}

/// Read one newline-terminated line within [`HANDSHAKE_TIMEOUT`].
///
/// Bytes are read one at a time so no payload byte past the newline is
/// consumed from the socket.
async fn read_handshake(stream: &mut TcpStream) -> Result<String, TransportError> {
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    let mut line = Vec::with_capacity(64);
    loop {
        let mut byte = [0u8; 1];
        let read = match tokio::time::timeout_at(deadline, stream.read(&mut byte)).await {
            Ok(read) => read?,
            Err(_) => return Err(TransportError::HandshakeTimeout),
        };
        if read == 0 {
            return Err(TransportError::HandshakeTimeout);
        }
        if byte[0] == b'\n' {
            let text = String::from_utf8_lossy(&line);
            return Ok(text.trim().to_string());
        }
        line.push(byte[0]);
        if line.len() > HANDSHAKE_MAX_LINE {
            return Err(TransportError::HandshakeMismatch);
        }
    }
}

/// Best-guess local address: the source address of a harmless outbound
/// datagram, falling back to loopback.
pub fn local_ip() -> std::net::IpAddr {
    fn probe() -> std::io::Result<std::net::IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    }
    probe().unwrap_or_else(|_| std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_port_is_reported_before_accept() {
        let listener = Listener::bind(0).await.unwrap();
        assert_ne!(listener.port(), 0);
    }

    #[tokio::test]
    async fn plain_stream_round_trip() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.port();
        let server = tokio::spawn(async move {
            let mut session = listener
                .accept_one(std::time::Duration::from_secs(5), None, None)
                .await
                .unwrap();
            let mut received = Vec::new();
            session
                .stream_mut()
                .read_to_end(&mut received)
                .await
                .unwrap();
            received
        });
        let mut session = dial("127.0.0.1", port, DIAL_TIMEOUT, None).await.unwrap();
        session.stream_mut().write_all(b"payload bytes").await.unwrap();
        session.close().await.unwrap();
        assert_eq!(server.await.unwrap(), b"payload bytes");
    }

    #[tokio::test]
    async fn handshake_accepts_matching_key() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.port();
        let server = tokio::spawn(async move {
            let mut session = listener
                .accept_one(std::time::Duration::from_secs(5), Some("secret"), None)
                .await
                .unwrap();
            let mut received = Vec::new();
            session
                .stream_mut()
                .read_to_end(&mut received)
                .await
                .unwrap();
            received
        });
        let mut session = dial("127.0.0.1", port, DIAL_TIMEOUT, Some("secret"))
            .await
            .unwrap();
        session.stream_mut().write_all(b"data").await.unwrap();
        session.close().await.unwrap();
        // the handshake line must not leak into the payload
        assert_eq!(server.await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn bad_handshake_gets_exact_rejection_and_first_good_key_wins() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.port();
        let server = tokio::spawn(async move {
            listener
                .accept_one(std::time::Duration::from_secs(10), Some("secret"), None)
                .await
        });
        // wrong key: rejected with the exact message, connection closed
        let mut bad = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        bad.write_all(b"WRONG\n").await.unwrap();
        let mut rejection = Vec::new();
        bad.read_to_end(&mut rejection).await.unwrap();
        assert_eq!(rejection, REJECT_BAD_HANDSHAKE.as_bytes());
        // the listener is still accepting: a good key goes through
        let mut good = dial("127.0.0.1", port, DIAL_TIMEOUT, Some("secret"))
            .await
            .unwrap();
        good.stream_mut().write_all(b"x").await.unwrap();
        good.close().await.unwrap();
        let session = server.await.unwrap().unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn accept_timeout_is_reported() {
        let listener = Listener::bind(0).await.unwrap();
        let result = listener
            .accept_one(std::time::Duration::from_millis(200), None, None)
            .await;
        assert!(matches!(result, Err(TransportError::AcceptTimeout(_))));
    }

    #[tokio::test]
    async fn dial_failure_is_reported() {
        // port 1 is essentially never listening
        let result = dial(
            "127.0.0.1",
            1,
            std::time::Duration::from_millis(500),
            None,
        )
        .await;
        assert!(matches!(result, Err(TransportError::Dial { .. })));
    }
}
