use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use futures::StreamExt;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new user (or rename an existing one)
    Register {
        /// Unique user id (e.g., 1001 or FAU001)
        user_id: String,
        /// Display name
        #[arg(short, long)]
        name: String,
    },
    /// List registered users
    Users,
    /// Capture registration face images for a user
    Capture {
        user_id: String,
        /// Number of images to capture (clamped to 10–60)
        #[arg(short, long, default_value_t = 30)]
        count: u32,
    },
    /// Rebuild the embedding gallery from registration images
    Train,
    /// Run live recognition and mark attendance
    Attend {
        /// Single recognition pass instead of a live session
        #[arg(long)]
        once: bool,
        /// Similarity threshold override (higher = stricter); 0 = daemon default
        #[arg(short, long, default_value_t = 0.0)]
        threshold: f64,
    },
    /// Show attendance events
    Report {
        /// Date filter, YYYY-MM-DD (defaults to today)
        #[arg(short, long)]
        date: Option<String>,
        /// Include all dates
        #[arg(long, conflicts_with = "date")]
        all: bool,
        /// Also export the rows to a CSV file at this path
        #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = "")]
        csv: Option<String>,
    },
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device to probe
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Save a captured frame as JPEG to this path
        #[arg(long, value_name = "PATH")]
        save: Option<String>,
    },
}

#[zbus::proxy(
    interface = "io.rollcall.Attendance1",
    default_service = "io.rollcall.Attendance1",
    default_path = "/io/rollcall/Attendance1"
)]
trait Attendance {
    async fn register_user(&self, user_id: &str, name: &str) -> zbus::Result<bool>;
    async fn list_users(&self) -> zbus::Result<String>;
    async fn capture_images(&self, user_id: &str, count: u32) -> zbus::Result<String>;
    async fn train(&self) -> zbus::Result<String>;
    async fn recognize_once(&self, threshold: f64) -> zbus::Result<String>;
    async fn start_session(&self, threshold: f64) -> zbus::Result<bool>;
    async fn stop_session(&self) -> zbus::Result<bool>;
    async fn report(&self, date: &str) -> zbus::Result<String>;
    async fn export_csv(&self, date: &str, path: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn attendance_marked(
        &self,
        user_id: String,
        name: String,
        date: String,
        time: String,
    ) -> zbus::Result<()>;
}

async fn connect() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("failed to create rollcalld proxy — is the daemon running?")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Register { user_id, name } => {
            let proxy = connect().await?;
            let created = proxy.register_user(&user_id, &name).await?;
            if created {
                println!("Registered {user_id} - {name}");
            } else {
                println!("Updated {user_id} - {name}");
            }
        }
        Commands::Users => {
            let proxy = connect().await?;
            let users: serde_json::Value = serde_json::from_str(&proxy.list_users().await?)?;
            print_users(&users);
        }
        Commands::Capture { user_id, count } => {
            let proxy = connect().await?;
            println!("Capturing {count} images for {user_id}. Look at the camera.");
            let stats: serde_json::Value =
                serde_json::from_str(&proxy.capture_images(&user_id, count).await?)?;
            println!(
                "Saved {} images ({} attempts, {} dark frames skipped).",
                stats["saved"], stats["attempts"], stats["dark_skipped"]
            );
            if stats["saved"].as_u64() == Some(0) {
                println!("No single-face frames found — check lighting and framing.");
            }
        }
        Commands::Train => {
            let proxy = connect().await?;
            println!("Training gallery...");
            let stats: serde_json::Value = serde_json::from_str(&proxy.train().await?)?;
            println!(
                "Done: {} users scanned, {} images used, {} skipped.",
                stats["users_scanned"], stats["images_used"], stats["images_skipped"]
            );
            println!("Gallery: {}", stats["gallery_path"].as_str().unwrap_or("?"));
            println!("Re-run after registering new users so they can be recognized.");
        }
        Commands::Attend { once, threshold } => {
            let proxy = connect().await?;
            if once {
                let rows: serde_json::Value =
                    serde_json::from_str(&proxy.recognize_once(threshold).await?)?;
                print_sightings(&rows);
            } else {
                attend_watch(&proxy, threshold).await?;
            }
        }
        Commands::Report { date, all, csv } => {
            let proxy = connect().await?;
            let date = if all {
                String::new()
            } else {
                date.unwrap_or_else(|| Local::now().format("%Y-%m-%d").to_string())
            };

            let rows: serde_json::Value = serde_json::from_str(&proxy.report(&date).await?)?;
            print_report(&date, &rows);

            if let Some(path) = csv {
                let written = proxy.export_csv(&date, &path).await?;
                println!("CSV saved: {written}");
            }
        }
        Commands::Status => {
            let proxy = connect().await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test { device, save } => {
            camera_test(&device, save.as_deref())?;
        }
    }

    Ok(())
}

/// Live session: start the daemon loop and print marks as they happen.
async fn attend_watch(proxy: &AttendanceProxy<'static>, threshold: f64) -> Result<()> {
    let started = proxy.start_session(threshold).await?;
    if !started {
        println!("A session is already running; attaching to its marks.");
    }

    let mut marks = proxy.receive_attendance_marked().await?;
    println!("Watching for attendance. Ctrl-C to stop.");

    loop {
        tokio::select! {
            signal = marks.next() => {
                match signal {
                    Some(signal) => {
                        let args = signal.args()?;
                        println!(
                            "{} {}  {} - {}",
                            args.date(), args.time(), args.user_id(), args.name()
                        );
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if started {
        proxy.stop_session().await?;
        println!("Session stopped.");
    }
    Ok(())
}

fn print_users(users: &serde_json::Value) {
    let Some(list) = users.as_array() else {
        println!("No users registered yet.");
        return;
    };
    if list.is_empty() {
        println!("No users registered yet.");
        return;
    }

    println!("{:<12} {:<24} {}", "USER ID", "NAME", "CREATED");
    for u in list {
        println!(
            "{:<12} {:<24} {}",
            u["user_id"].as_str().unwrap_or("?"),
            u["name"].as_str().unwrap_or("?"),
            u["created_at"].as_str().unwrap_or("?"),
        );
    }
}

fn print_sightings(rows: &serde_json::Value) {
    let Some(list) = rows.as_array() else {
        return;
    };
    if list.is_empty() {
        println!("No faces detected.");
        return;
    }

    for r in list {
        let similarity = r["similarity"].as_f64().unwrap_or(0.0);
        match r["user_id"].as_str() {
            Some(user_id) => {
                let name = r["name"].as_str().unwrap_or("?");
                let note = match r["marked"].as_bool() {
                    Some(true) => "marked",
                    Some(false) => "already marked today",
                    None => "",
                };
                println!("{user_id} - {name}  (similarity {similarity:.2})  {note}");
            }
            None => println!("Unknown face  (best similarity {similarity:.2})"),
        }
    }
}

fn print_report(date: &str, rows: &serde_json::Value) {
    let label = if date.is_empty() { "all dates" } else { date };
    let Some(list) = rows.as_array() else {
        println!("No attendance records for {label}.");
        return;
    };
    if list.is_empty() {
        println!("No attendance records for {label}.");
        return;
    }

    println!("{:<12} {:<24} {:<12} {}", "USER ID", "NAME", "DATE", "TIME");
    for r in list {
        println!(
            "{:<12} {:<24} {:<12} {}",
            r["user_id"].as_str().unwrap_or("?"),
            r["name"].as_str().unwrap_or("?"),
            r["date"].as_str().unwrap_or("?"),
            r["time"].as_str().unwrap_or("?"),
        );
    }
    println!("\n{} present on {label}.", list.len());
}

/// Direct camera diagnostics, no daemon involved.
fn camera_test(device: &str, save: Option<&str>) -> Result<()> {
    println!("Available capture devices:");
    let devices = rollcall_hw::Camera::enumerate();
    if devices.is_empty() {
        println!("  (none found)");
    }
    for d in &devices {
        println!("  {}  {} [{}]", d.path, d.name, d.driver);
    }

    println!("\nProbing {device}...");
    let camera = rollcall_hw::Camera::open(device).context("failed to open camera")?;
    println!(
        "Negotiated {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );

    let frame = camera.frame().context("failed to capture frame")?;
    println!(
        "Captured frame: seq={} brightness={:.1} dark={}",
        frame.sequence,
        frame.avg_brightness(),
        frame.is_dark
    );

    if let Some(path) = save {
        let img = frame
            .into_image()
            .context("frame buffer does not match negotiated dimensions")?;
        img.save(path).context("failed to save frame")?;
        println!("Frame saved to {path}");
    }

    Ok(())
}
