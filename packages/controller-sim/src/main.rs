//! main.rs — robot controller simulator
//!
//! Stands in for the real controller during development: accepts the
//! driver's TCP connection, parses `movel` lines, simulates motion time
//! with Gaussian latency, and answers one `DONE` per command. Options
//! cover the failure modes the driver must survive:
//!   - `--drop-after N`: hard-drop the first connection after N
//!     acknowledgments (reconnect / re-enqueue testing)
//!   - `--heartbeat-secs S`: emit informational `IDLE` lines, which the
//!     driver must ignore
//!
//! Connections are served one at a time, like the real controller port.

use std::time::Duration;

use clap::Parser;
use qc_types::MoveCommand;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "controller-sim", about = "Vision QC robot controller simulator")]
struct Args {
    /// Listen port
    #[arg(long, default_value_t = 20002)]
    port: u16,
    /// Mean simulated motion time per command, milliseconds
    #[arg(long, default_value_t = 150)]
    latency_ms: u64,
    /// Gaussian jitter on the motion time, milliseconds (standard deviation)
    #[arg(long, default_value_t = 40.0)]
    jitter_ms: f64,
    /// Drop the first connection after this many acknowledgments
    #[arg(long)]
    drop_after: Option<u32>,
    /// Emit an informational IDLE heartbeat at this interval
    #[arg(long)]
    heartbeat_secs: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "controller_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%addr, error = %e, "cannot bind");
            std::process::exit(1);
        }
    };
    info!(%addr, "controller-sim listening");

    // only the first connection suffers the scripted drop
    let mut drop_budget = args.drop_after;

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        info!(%peer, "driver connected");
        serve(stream, &args, drop_budget.take()).await;
        info!(%peer, "driver disconnected");
    }
}

async fn serve(stream: TcpStream, args: &Args, drop_after: Option<u32>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    let mut rng = StdRng::from_entropy();
    let jitter = Normal::new(0.0, args.jitter_ms.max(0.001)).ok();
    let mut acks = 0u32;

    let heartbeat = args.heartbeat_secs.map(Duration::from_secs);
    let mut ticker = tokio::time::interval(heartbeat.unwrap_or(Duration::from_secs(3600)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        buf.clear();
        tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => {
                match read {
                    Ok(0) => return,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "read failed");
                        return;
                    }
                }
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }

                match MoveCommand::parse_line(line) {
                    Some(cmd) => {
                        info!(
                            x = cmd.x_mm,
                            y = cmd.y_mm,
                            z = cmd.z_mm,
                            angle = cmd.angle_deg,
                            status = cmd.status.as_str(),
                            "move requested"
                        );
                        let extra = jitter
                            .map(|n| n.sample(&mut rng).max(0.0) as u64)
                            .unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(args.latency_ms + extra)).await;
                        if write_half.write_all(b"DONE\n").await.is_err() {
                            return;
                        }
                        acks += 1;
                        if drop_after.is_some_and(|n| acks >= n) {
                            info!(acks, "scripted link failure");
                            return;
                        }
                    }
                    None => {
                        // greeting or unknown chatter; no acknowledgment
                        info!(%line, "non-move line");
                    }
                }
            }
            _ = ticker.tick(), if heartbeat.is_some() => {
                if write_half.write_all(b"IDLE\n").await.is_err() {
                    return;
                }
            }
        }
    }
}
