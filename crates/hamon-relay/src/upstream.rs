use std::{io, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, info, warn};

pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where the balancer's stats socket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Unix(PathBuf),
    Tcp(String),
}

impl Upstream {
    /// Anything that looks like a path (or has no port) is a Unix socket.
    pub fn parse(addr: &str) -> Self {
        if addr.contains('/') || !addr.contains(':') {
            Upstream::Unix(PathBuf::from(addr))
        } else {
            Upstream::Tcp(addr.to_string())
        }
    }

    async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        match self {
            Upstream::Tcp(addr) => {
                let (reader, writer) = TcpStream::connect(addr).await?.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            #[cfg(unix)]
            Upstream::Unix(path) => {
                let (reader, writer) = tokio::net::UnixStream::connect(path).await?.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            #[cfg(not(unix))]
            Upstream::Unix(path) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unix sockets unavailable: {}", path.display()),
            )),
        }
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Upstream::Unix(path) => write!(f, "unix:{}", path.display()),
            Upstream::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Prompt echoes and the balancer's own stats proxy never reach consumers.
pub fn keep_stat_line(line: &[u8]) -> bool {
    !(line.starts_with(b">") || line.starts_with(b"stats"))
}

/// Reads one `show stat` reply up to its empty line and returns the kept
/// lines followed by a single empty line.
pub async fn read_stat_block<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut block = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed mid-reply",
            ));
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if line.is_empty() {
            break;
        }
        if keep_stat_line(&line) {
            block.extend_from_slice(&line);
            block.push(b'\n');
        }
    }
    block.push(b'\n');
    Ok(block)
}

/// Polls the upstream forever, reconnecting after [`RECONNECT_BACKOFF`].
/// Returns once nobody is listening for snapshots any more.
pub async fn run_upstream(
    upstream: Upstream,
    interval: Duration,
    mut commands: mpsc::Receiver<String>,
    snapshots: mpsc::Sender<Arc<[u8]>>,
) {
    loop {
        info!(event = "relay_upstream_connect", upstream = %upstream);
        match poll(&upstream, interval, &mut commands, &snapshots).await {
            Ok(()) => {
                info!(event = "relay_upstream_stop", upstream = %upstream);
                return;
            }
            Err(err) => {
                warn!(event = "relay_upstream_error", upstream = %upstream, error = %err);
            }
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

async fn poll(
    upstream: &Upstream,
    interval: Duration,
    commands: &mut mpsc::Receiver<String>,
    snapshots: &mpsc::Sender<Arc<[u8]>>,
) -> io::Result<()> {
    let (reader, mut writer) = upstream.connect().await?;
    let mut reader = BufReader::new(reader);
    writer.write_all(b"prompt\n").await?;

    loop {
        while let Ok(command) = commands.try_recv() {
            writer.write_all(format!("{command}\n").as_bytes()).await?;
            info!(event = "relay_command_sent", command = %command);
        }
        writer.write_all(b"show stat\n").await?;

        let block = read_stat_block(&mut reader).await?;
        debug!(event = "relay_snapshot", bytes = block.len());
        if snapshots.send(Arc::from(block)).await.is_err() {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}
