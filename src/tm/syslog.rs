use crate::tm::logrotate::FileRotator;
use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt as _;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Address and lifetime of a launched syslog listener.
#[derive(Debug, Clone)]
pub struct SyslogServerState {
    pub addr: String,
}

/// Listener that accepts log traffic from a driver and appends it to the
/// task's stdout rotator. Collection/parsing of the syslog framing is the
/// collector's business; the executor only owns the listener lifecycle.
pub struct SyslogServer {
    addr: String,
    socket_path: Option<PathBuf>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyslogServer {
    /// Bind and start serving.
    ///
    /// On UNIX the listener is a uniquely named Unix-domain socket under the
    /// system temp directory; elsewhere it is a TCP loopback port within
    /// `[port_lower_bound, port_upper_bound]`.
    pub fn launch(
        port_lower_bound: u16,
        port_upper_bound: u16,
        sink: Arc<FileRotator>,
    ) -> anyhow::Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = bind(port_lower_bound, port_upper_bound, sink, shutdown_rx, shutdown_tx)?;
        Ok(server)
    }

    pub fn state(&self) -> SyslogServerState {
        SyslogServerState {
            addr: self.addr.clone(),
        }
    }

    /// Stop accepting and drop the socket. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(unix)]
fn bind(
    _port_lower_bound: u16,
    _port_upper_bound: u16,
    sink: Arc<FileRotator>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<SyslogServer> {
    let path = std::env::temp_dir().join(format!("taskmaster-syslog-{}.sock", Uuid::new_v4().simple()));
    let listener = tokio::net::UnixListener::bind(&path)
        .with_context(|| format!("bind syslog socket {}", path.display()))?;
    let addr = path.display().to_string();
    tokio::spawn(accept_loop_unix(listener, sink, shutdown_rx));
    Ok(SyslogServer {
        addr,
        socket_path: Some(path),
        shutdown_tx,
    })
}

#[cfg(unix)]
async fn accept_loop_unix(
    listener: tokio::net::UnixListener,
    sink: Arc<FileRotator>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let sink = Arc::clone(&sink);
                        tokio::spawn(pump_stream(stream, sink));
                    }
                    Err(e) => {
                        warn!("syslog accept failed: {e}");
                        return;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("syslog listener shutting down");
                return;
            }
        }
    }
}

#[cfg(windows)]
fn bind(
    port_lower_bound: u16,
    port_upper_bound: u16,
    sink: Arc<FileRotator>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<SyslogServer> {
    let mut bound = None;
    for port in port_lower_bound..=port_upper_bound {
        match std::net::TcpListener::bind(("localhost", port)) {
            Ok(l) => {
                bound = Some(l);
                break;
            }
            Err(_) => continue,
        }
    }
    let listener = bound.ok_or_else(|| {
        anyhow::anyhow!("no free syslog port in [{port_lower_bound}, {port_upper_bound}]")
    })?;
    listener.set_nonblocking(true).context("set syslog listener nonblocking")?;
    let addr = listener.local_addr().context("syslog listener addr")?.to_string();
    let listener = tokio::net::TcpListener::from_std(listener).context("adopt syslog listener")?;
    tokio::spawn(accept_loop_tcp(listener, sink, shutdown_rx));
    Ok(SyslogServer {
        addr,
        socket_path: None,
        shutdown_tx,
    })
}

#[cfg(windows)]
async fn accept_loop_tcp(
    listener: tokio::net::TcpListener,
    sink: Arc<FileRotator>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let sink = Arc::clone(&sink);
                        tokio::spawn(pump_stream(stream, sink));
                    }
                    Err(e) => {
                        warn!("syslog accept failed: {e}");
                        return;
                    }
                }
            }
            _ = shutdown_rx.changed() => return,
        }
    }
}

async fn pump_stream<S: tokio::io::AsyncRead + Unpin>(mut stream: S, sink: Arc<FileRotator>) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                if let Err(e) = sink.write_all(&buf[..n]) {
                    debug!("writing syslog payload: {e}");
                    return;
                }
            }
            Err(e) => {
                debug!("reading syslog stream: {e}");
                return;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pumps_connections_into_the_rotator() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileRotator::new(dir.path(), "web.stdout", 3, 1 << 20).unwrap());
        let server = SyslogServer::launch(10_000, 10_010, Arc::clone(&sink)).unwrap();
        let state = server.state();
        assert!(state.addr.ends_with(".sock"));

        let mut conn = tokio::net::UnixStream::connect(&state.addr).await.unwrap();
        conn.write_all(b"<6>hello syslog\n").await.unwrap();
        conn.shutdown().await.unwrap();

        // give the pump a moment to drain
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        sink.flush().unwrap();
        let body = std::fs::read_to_string(dir.path().join("web.stdout.0")).unwrap();
        assert!(body.contains("hello syslog"));

        server.shutdown();
        assert!(!std::path::Path::new(&state.addr).exists());
    }
}
