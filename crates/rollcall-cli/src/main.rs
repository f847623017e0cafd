use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::{Camera, FrameSource, SourceGuard};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

// `#[zbus::proxy]` generates `AttendanceProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn mark_attendance(&self, admission_no: &str) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn today_status(&self, admission_no: &str) -> zbus::Result<String>;
    async fn summary(&self, admission_no: &str) -> zbus::Result<String>;
    async fn history(&self, admission_no: &str, from: &str, to: &str) -> zbus::Result<String>;
    async fn gallery(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance self check-in CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check in with your face; type `q` and Enter to finish
    Mark {
        /// Your admission number
        admission_no: String,
    },
    /// Stop the running check-in session
    Stop,
    /// Show daemon status
    Status,
    /// Show whether you are marked for today
    Today { admission_no: String },
    /// Show present/absent day counts
    Summary { admission_no: String },
    /// List attendance records
    History {
        admission_no: String,
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
    },
    /// Build the enrollment gallery and list who is in it
    Gallery,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device index
        #[arg(short, long, default_value_t = 0)]
        camera: usize,
        /// Number of frames to capture
        #[arg(short, long, default_value_t = 5)]
        frames: usize,
        /// Save the last frame as an image
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
}

async fn connect(system: bool, method_timeout: Option<Duration>) -> Result<zbus::Connection> {
    let mut builder = if system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    if let Some(timeout) = method_timeout {
        builder = builder.method_timeout(timeout);
    }
    builder.build().await.context("failed to connect to D-Bus")
}

async fn proxy(system: bool) -> Result<AttendanceProxy<'static>> {
    let conn = connect(system, None).await?;
    AttendanceProxy::new(&conn).await.context("rollcalld is not reachable")
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn mark(system: bool, admission_no: &str) -> Result<()> {
    // A session lasts as long as the student stands at the camera.
    let conn = connect(system, Some(Duration::from_secs(24 * 60 * 60))).await?;
    let proxy = AttendanceProxy::new(&conn).await.context("rollcalld is not reachable")?;

    let stopper = proxy.clone();
    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().eq_ignore_ascii_case("q") {
                if let Err(e) = stopper.stop().await {
                    eprintln!("failed to stop session: {e}");
                }
                break;
            }
        }
    });

    // Ctrl-C stops the session like `q`.
    let interrupter = proxy.clone();
    let interrupt_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = interrupter.stop().await {
                eprintln!("failed to stop session: {e}");
            }
        }
    });

    println!("Look at the camera. Type q and press Enter to finish.");
    let reply = proxy.mark_attendance(admission_no).await;
    stdin_task.abort();
    interrupt_task.abort();
    let summary: Value = serde_json::from_str(&reply.context("check-in failed")?)?;

    match summary["outcome"].as_str() {
        Some("marked") => println!("Attendance marked successfully"),
        Some("already_marked") => println!("Attendance already marked"),
        Some("not_recorded") => bail!(
            "attendance could not be recorded ({} failed attempts); please try again",
            summary["persistence_failures"]
        ),
        other => bail!("unexpected session outcome: {other:?}"),
    }
    if summary["recognized"] == Value::Bool(false) {
        println!("(your face was not recognized this session)");
    }
    Ok(())
}

fn camera_test(index: usize, frames: usize, save: Option<PathBuf>) -> Result<()> {
    let camera = Camera::open(index)?.with_read_timeout(Some(Duration::from_secs(2)));
    println!(
        "Opened {} ({}x{}, {:?})",
        rollcall_hw::camera::device_path(index),
        camera.width,
        camera.height,
        camera.fourcc
    );
    let mut camera = SourceGuard::new(camera);

    let mut last = None;
    for i in 0..frames {
        let frame = camera.read()?;
        println!(
            "  frame {i}: seq={} brightness={:.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { " (dark)" } else { "" }
        );
        last = Some(frame);
    }

    if let (Some(path), Some(frame)) = (save, last) {
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image.save(&path).with_context(|| format!("failed to save {}", path.display()))?;
        println!("Saved last frame to {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let system = cli.system;

    match cli.command {
        Commands::Mark { admission_no } => mark(system, &admission_no).await?,
        Commands::Stop => {
            if proxy(system).await?.stop().await? {
                println!("Session stopped");
            } else {
                println!("No session running");
            }
        }
        Commands::Status => print_json(&proxy(system).await?.status().await?)?,
        Commands::Today { admission_no } => {
            let raw = proxy(system).await?.today_status(&admission_no).await?;
            let today: Value = serde_json::from_str(&raw)?;
            let date = today["date"].as_str().unwrap_or("today");
            match (today["recorded"].as_bool(), today["present"].as_bool()) {
                (Some(true), Some(true)) => println!("{admission_no}: present on {date}"),
                (Some(true), _) => println!("{admission_no}: marked absent on {date}"),
                _ => println!("{admission_no}: not marked yet on {date}"),
            }
        }
        Commands::Summary { admission_no } => {
            print_json(&proxy(system).await?.summary(&admission_no).await?)?
        }
        Commands::History { admission_no, from, to } => {
            let raw = proxy(system)
                .await?
                .history(&admission_no, from.as_deref().unwrap_or(""), to.as_deref().unwrap_or(""))
                .await?;
            let records: Vec<Value> = serde_json::from_str(&raw)?;
            if records.is_empty() {
                println!("No attendance records");
            }
            for record in records {
                let status = if record["status"] == Value::Bool(true) {
                    "present"
                } else {
                    "absent"
                };
                println!("{}  {status}", record["date"].as_str().unwrap_or("?"));
            }
        }
        Commands::Gallery => print_json(&proxy(system).await?.gallery().await?)?,
        Commands::Test { camera, frames, save } => {
            println!("Running camera diagnostics...");
            camera_test(camera, frames, save)?;
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_mark_and_history() {
        let cli = Cli::try_parse_from(["rollcall", "mark", "A123"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Mark { ref admission_no } if admission_no == "A123"
        ));
        assert!(!cli.system);

        let cli = Cli::try_parse_from([
            "rollcall",
            "history",
            "A123",
            "--from",
            "2024-05-01",
            "--system",
        ])
        .unwrap();
        assert!(cli.system);
        match cli.command {
            Commands::History { from, to, .. } => {
                assert_eq!(from.as_deref(), Some("2024-05-01"));
                assert_eq!(to, None);
            }
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn test_cli_requires_admission_number() {
        assert!(Cli::try_parse_from(["rollcall", "mark"]).is_err());
    }

    #[test]
    fn test_cli_test_defaults() {
        let cli = Cli::try_parse_from(["rollcall", "test"]).unwrap();
        assert!(matches!(cli.command, Commands::Test { camera: 0, frames: 5, save: None }));
    }
}
