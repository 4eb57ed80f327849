use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use vision_qc::calib;
use vision_qc::camera::{FrameSource, ImageDirSource};
use vision_qc::dispatch::{run_dispatcher, Batch};
use vision_qc::export;
use vision_qc::link::{run_link, LinkConfig};
use vision_qc::mapping::Homography;
use vision_qc::pipeline::{process_frame, sort_by_distance, FrameAnalysis};
use vision_qc::raster::Frame;
use vision_qc::settings::Settings;
use vision_qc::signal::Signal;

/// Exit code for fatal startup errors (camera unavailable, configuration
/// invalid); clean exits return 0.
const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "vision-qc", about = "Vision-guided QC and pick dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive QC loop with robot dispatch
    Run(RunArgs),
    /// Offline 20-dot grid calibration against a stored frame
    Calibrate(CalibrateArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value = "object_settings.json")]
    settings: PathBuf,
    #[arg(long, default_value = "calibration_h.bin")]
    homography: PathBuf,
    /// Directory of stored sample frames served as the camera feed
    #[arg(long)]
    frames: PathBuf,
    /// Replay the frame directory forever instead of running dry
    #[arg(long)]
    cycle: bool,
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 20002)]
    port: u16,
    #[arg(long, default_value = "robot_commands.json")]
    batch_file: PathBuf,
    /// Where QC mode dumps mask/gray/thresh/edges/overlay PNGs
    #[arg(long)]
    debug_dir: Option<PathBuf>,
}

#[derive(Args)]
struct CalibrateArgs {
    #[arg(long, default_value = "calibration_settings_dots.json")]
    settings: PathBuf,
    /// Stored calibration frame containing the 20-dot grid
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = "calibration_h.bin")]
    out: PathBuf,
    /// Reject the solve when the worst dot reprojects further than this
    #[arg(long, default_value_t = 3.0)]
    max_error_mm: f64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vision_qc=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Calibrate(args) => calibrate(args),
    };
    std::process::exit(code);
}

// ── Calibration subcommand ────────────────────────────────────────────────────

fn calibrate(args: CalibrateArgs) -> i32 {
    match try_calibrate(&args) {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            EXIT_CONFIG
        }
    }
}

fn try_calibrate(args: &CalibrateArgs) -> anyhow::Result<()> {
    let settings = Settings::load(&args.settings).context("settings")?;
    let frame = Frame::load(&args.image).context("calibration frame")?;

    let report = calib::calibrate_frame(&frame, &settings).context("calibration failed")?;
    if report.max_error_mm > args.max_error_mm {
        // existing homography on disk stays untouched
        anyhow::bail!(
            "calibration rejected by quality gate: max error {:.2} mm exceeds {:.2} mm",
            report.max_error_mm,
            args.max_error_mm
        );
    }
    report
        .homography
        .save(&args.out, &report.sidecar(&settings))
        .context("saving homography")?;
    info!(
        path = %args.out.display(),
        mean_mm = report.mean_error_mm,
        max_mm = report.max_error_mm,
        rms_mm = report.rms_error_mm,
        "calibration saved"
    );
    Ok(())
}

// ── Run subcommand ────────────────────────────────────────────────────────────

fn load_run_inputs(args: &RunArgs) -> anyhow::Result<(Settings, Homography, ImageDirSource)> {
    let settings = Settings::load(&args.settings).context("settings")?;
    let homography = Homography::load(&args.homography).context("homography")?;
    let source = ImageDirSource::new(&args.frames, args.cycle).context("camera")?;
    Ok((settings, homography, source))
}

async fn run(args: RunArgs) -> i32 {
    let (settings, homography, mut source) = match load_run_inputs(&args) {
        Ok(inputs) => inputs,
        Err(e) => {
            error!("{e:#}");
            return EXIT_CONFIG;
        }
    };

    info!(
        derived_scale = homography.scale_at(320.0, 200.0),
        configured_mm_per_pixel = settings.mm_per_pixel,
        "homography loaded"
    );

    let stop = Signal::new();
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(32);
    let (ev_tx, ev_rx) = mpsc::channel(64);
    let (batch_tx, batch_rx) = mpsc::channel::<Batch>(8);
    let (complete_tx, mut complete_rx) = mpsc::channel::<u64>(8);

    let link_cfg = LinkConfig { host: args.host.clone(), port: args.port, ..LinkConfig::default() };
    let link_task = tokio::spawn(run_link(link_cfg, out_rx, ev_tx, stop.clone()));
    let dispatch_task =
        tokio::spawn(run_dispatcher(batch_rx, out_tx, ev_rx, stop.clone(), complete_tx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!();
        println!("=== vision-qc ===");
        println!("  [1] show commands");
        println!("  [2] run QC");
        println!("  [q] quit");
        let Some(choice) = read_line(&mut lines).await else { break };
        match choice.as_str() {
            "1" => show_commands(&args.batch_file),
            "2" => {
                let quit = qc_mode(
                    &args,
                    &settings,
                    &homography,
                    &mut source,
                    &mut lines,
                    &batch_tx,
                    &mut complete_rx,
                )
                .await;
                if quit {
                    break;
                }
            }
            "q" | "quit" => break,
            other => println!("unknown choice: {other}"),
        }
    }

    stop.set();
    let _ = tokio::time::timeout(Duration::from_secs(1), dispatch_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), link_task).await;
    0
}

async fn read_line(lines: &mut Lines<BufReader<Stdin>>) -> Option<String> {
    match lines.next_line().await {
        Ok(Some(line)) => Some(line.trim().to_string()),
        _ => None,
    }
}

fn show_commands(batch_file: &PathBuf) {
    match export::read_batch(batch_file) {
        Ok((generation, commands)) => {
            println!("batch generation {generation}, {} command(s):", commands.len());
            for (i, cmd) in commands.iter().enumerate() {
                println!("  [{i}] {cmd}");
            }
        }
        Err(e) => println!("no batch to show: {e}"),
    }
}

/// QC mode: process frames continuously, answer single-key debug commands.
/// Returns true when the operator quit the whole program.
async fn qc_mode(
    args: &RunArgs,
    settings: &Settings,
    homography: &Homography,
    source: &mut ImageDirSource,
    lines: &mut Lines<BufReader<Stdin>>,
    batch_tx: &mpsc::Sender<Batch>,
    complete_rx: &mut mpsc::Receiver<u64>,
) -> bool {
    println!("QC mode keys: f form, s size, c color, h holes, r robot payload,");
    println!("              p poses, d dump rasters, e export+dispatch, m menu, q quit");

    let mut last: Option<FrameAnalysis> = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match source.next_frame() {
                    Ok(Some(frame)) => match process_frame(&frame, settings, homography) {
                        Ok(analysis) => last = Some(analysis),
                        Err(e) => warn!("frame skipped: {e}"),
                    },
                    Ok(None) => {}
                    Err(e) => warn!("no frame this tick: {e}"),
                }
            }
            Some(generation) = complete_rx.recv() => {
                println!("[dispatch] batch {generation} complete");
            }
            line = lines.next_line() => {
                let key = match line {
                    Ok(Some(l)) => l.trim().to_string(),
                    _ => return true,
                };
                match key.as_str() {
                    "f" => print_form(&last),
                    "s" => print_size(&last),
                    "c" => print_color(&last),
                    "h" => print_special(&last),
                    "r" => print_robot_payload(&last),
                    "p" => print_poses(&last),
                    "d" => dump_rasters(&last, args.debug_dir.as_deref()),
                    "e" => export_and_dispatch(&last, &args.batch_file, batch_tx).await,
                    "m" => return false,
                    "q" => return true,
                    "" => {}
                    other => println!("unknown key: {other}"),
                }
            }
        }
    }
}

fn with_analysis(last: &Option<FrameAnalysis>, f: impl FnOnce(&FrameAnalysis)) {
    match last {
        Some(a) => f(a),
        None => println!("no frame processed yet"),
    }
}

fn print_form(last: &Option<FrameAnalysis>) {
    with_analysis(last, |a| {
        for (i, d) in a.detections.iter().enumerate() {
            let form = &d.record.form;
            println!(
                "[{i}] area {:.0}  aspect {:.2}  solidity {:.3}  extent {:.3}  ok {}",
                form.area, form.aspect, form.solidity, form.extent, form.ok
            );
        }
    });
}

fn print_size(last: &Option<FrameAnalysis>) {
    with_analysis(last, |a| {
        for (i, d) in a.detections.iter().enumerate() {
            let size = &d.record.size;
            println!(
                "[{i}] {:.2} x {:.2} mm  ok {}",
                size.width_mm, size.height_mm, size.ok
            );
        }
    });
}

fn print_color(last: &Option<FrameAnalysis>) {
    with_analysis(last, |a| {
        for (i, d) in a.detections.iter().enumerate() {
            let color = &d.record.color;
            println!(
                "[{i}] mean LAB ({:.1}, {:.1}, {:.1})  deltaE {:.2}  ok {}",
                color.mean_lab[0], color.mean_lab[1], color.mean_lab[2], color.delta_e, color.ok
            );
        }
    });
}

fn print_special(last: &Option<FrameAnalysis>) {
    with_analysis(last, |a| {
        for (i, d) in a.detections.iter().enumerate() {
            let sp = &d.record.special;
            println!("[{i}] holes {} areas {:?}  ok {}", sp.hole_count, sp.hole_areas, sp.ok);
        }
    });
}

fn print_poses(last: &Option<FrameAnalysis>) {
    with_analysis(last, |a| {
        for (i, d) in a.detections.iter().enumerate() {
            println!(
                "[{i}] pixel ({:.1}, {:.1})  angle {:.2}°",
                d.pose.cx, d.pose.cy, d.pose.angle_deg
            );
        }
    });
}

fn print_robot_payload(last: &Option<FrameAnalysis>) {
    with_analysis(last, |a| {
        let mut sorted = a.detections.clone();
        sort_by_distance(&mut sorted);
        for (i, d) in sorted.iter().enumerate() {
            println!(
                "[Obj {i}] Robot=({:.2}, {:.2})  Angle={:.2}°  {}",
                d.robot_mm.0,
                d.robot_mm.1,
                d.pose.angle_deg,
                if d.record.overall_ok { "OK" } else { "NOK" }
            );
            for reason in d.record.reasons() {
                println!("        {reason}");
            }
        }
    });
}

fn dump_rasters(last: &Option<FrameAnalysis>, debug_dir: Option<&std::path::Path>) {
    let Some(dir) = debug_dir else {
        println!("no --debug-dir configured");
        return;
    };
    with_analysis(last, |a| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("debug dir: {e}");
            return;
        }
        let results = [
            a.pre.mask.save(&dir.join("mask.png")),
            a.pre.gray.save(&dir.join("gray.png")),
            a.pre.thresh.save(&dir.join("thresh.png")),
            a.pre.edges.save(&dir.join("edges.png")),
            a.pre.overlay.save(&dir.join("overlay.png")),
        ];
        match results.into_iter().find(|r| r.is_err()) {
            Some(Err(e)) => warn!("raster dump: {e}"),
            _ => println!("rasters written to {}", dir.display()),
        }
    });
}

async fn export_and_dispatch(
    last: &Option<FrameAnalysis>,
    batch_file: &PathBuf,
    batch_tx: &mpsc::Sender<Batch>,
) {
    let Some(analysis) = last else {
        println!("no frame processed yet");
        return;
    };
    let mut sorted = analysis.detections.clone();
    sort_by_distance(&mut sorted);
    let commands: Vec<_> = sorted.iter().map(|d| d.command).collect();

    match export::write_batch(batch_file, &commands) {
        Ok(generation) => {
            println!("exported {} command(s) as generation {generation}", commands.len());
            let batch = Batch {
                generation,
                commands: commands.iter().map(|c| c.to_line()).collect(),
            };
            if batch_tx.send(batch).await.is_err() {
                warn!("dispatcher is gone; batch not queued");
            }
        }
        Err(e) => warn!("export failed: {e}"),
    }
}
