//! Robot-controller TCP link.
//!
//! The link task alone owns the socket. Other tasks send by posting byte
//! buffers on the outbound channel and observe the connection through
//! `LinkEvent`s; the receiver runs as its own task so a slow read never
//! blocks the sender. On any send/receive error or zero-byte read the link
//! drops to Disconnected and reconnects with doubling backoff (reset on a
//! successful connect).

use std::time::Duration;

use qc_types::{classify_reply, ControllerReply};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::signal::Signal;

/// Connection lifecycle and controller replies, as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Reply(ControllerReply),
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    /// Optional one-line handshake sent once per connection.
    pub greeting: Option<String>,
    pub connect_timeout: Duration,
    pub backoff_start: Duration,
    pub backoff_cap: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 20002,
            greeting: Some("hello vision-qc".to_string()),
            connect_timeout: Duration::from_secs(5),
            backoff_start: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Sleep `d`, interruptible by the stop flag. Returns true when stopping.
async fn backoff_sleep(d: Duration, stop: &mut Signal) -> bool {
    tokio::select! {
        _ = stop.wait_set() => true,
        _ = tokio::time::sleep(d) => false,
    }
}

/// Receiver task: line-oriented, lossy UTF-8, lenient token matching.
/// A zero-byte read means the controller closed the connection.
async fn read_task(read_half: OwnedReadHalf, events: mpsc::Sender<LinkEvent>, done: oneshot::Sender<()>) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                info!("controller closed the connection");
                break;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                let reply = classify_reply(line);
                match reply {
                    ControllerReply::Done => debug!(%line, "acknowledgment"),
                    ControllerReply::Idle => debug!(%line, "heartbeat"),
                    ControllerReply::Other => {
                        // protocol noise is logged, never fatal
                        let shown: String = line.chars().take(120).collect();
                        debug!(line = %shown, "unrecognized controller line");
                    }
                }
                if events.send(LinkEvent::Reply(reply)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "socket read error");
                break;
            }
        }
    }
    let _ = done.send(());
}

/// Link manager task: Disconnected → Connecting → Connected, forever,
/// until the stop flag is raised.
pub async fn run_link(
    config: LinkConfig,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<LinkEvent>,
    mut stop: Signal,
) {
    let addr = format!("{}:{}", config.host, config.port);
    let mut backoff = config.backoff_start;

    'outer: while !stop.is_set() {
        debug!(%addr, "connecting");
        let attempt = tokio::select! {
            _ = stop.wait_set() => break 'outer,
            res = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)) => res,
        };
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%addr, error = %e, retry_in = ?backoff, "connect failed");
                if backoff_sleep(backoff, &mut stop).await {
                    break 'outer;
                }
                backoff = (backoff * 2).min(config.backoff_cap);
                continue;
            }
            Err(_) => {
                warn!(%addr, retry_in = ?backoff, "connect timed out");
                if backoff_sleep(backoff, &mut stop).await {
                    break 'outer;
                }
                backoff = (backoff * 2).min(config.backoff_cap);
                continue;
            }
        };

        info!(%addr, "connected");
        backoff = config.backoff_start;

        // anything queued while disconnected is stale: the dispatcher has
        // already re-enqueued those commands and will resend after it sees
        // Connected
        while outbound.try_recv().is_ok() {}

        let (read_half, mut write_half) = stream.into_split();
        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        let reader = tokio::spawn(read_task(read_half, events.clone(), done_tx));

        let mut alive = true;
        if let Some(greeting) = &config.greeting {
            let mut line = greeting.clone().into_bytes();
            line.push(b'\n');
            if let Err(e) = write_half.write_all(&line).await {
                warn!(error = %e, "greeting failed");
                alive = false;
            }
        }

        if alive && events.send(LinkEvent::Connected).await.is_err() {
            reader.abort();
            break 'outer;
        }

        while alive {
            tokio::select! {
                _ = stop.wait_set() => {
                    // closing the socket unblocks the receiver
                    reader.abort();
                    break 'outer;
                }
                msg = outbound.recv() => match msg {
                    Some(bytes) => {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            warn!(error = %e, "socket send error");
                            alive = false;
                        }
                    }
                    None => {
                        reader.abort();
                        break 'outer;
                    }
                },
                _ = &mut done_rx => {
                    alive = false;
                }
            }
        }

        reader.abort();
        drop(write_half);
        let _ = events.send(LinkEvent::Disconnected).await;
        info!(%addr, "disconnected; reconnecting");
    }

    info!("link manager stopped");
}
