use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::{Camera, CaptureConfig};

// `#[zbus::proxy]` generates `KioskProxy` (async) and `KioskProxyBlocking`.
#[zbus::proxy(
    interface = "org.rollcall.Kiosk1",
    default_service = "org.rollcall.Kiosk1",
    default_path = "/org/rollcall/Kiosk1"
)]
trait Kiosk {
    async fn start(&self, camera: &str, context_id: i64) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn recent(&self) -> zbus::Result<String>;
    async fn history(&self, limit: u32) -> zbus::Result<String>;
    async fn enroll(
        &self,
        key: &str,
        name: &str,
        class_id: i64,
        roll_no: &str,
        email: &str,
    ) -> zbus::Result<String>;
    async fn add_class(&self, name: &str) -> zbus::Result<i64>;
    async fn list_classes(&self) -> zbus::Result<String>;
    async fn add_context(&self, name: &str) -> zbus::Result<i64>;
    async fn list_contexts(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start recognizing and logging attendance
    Start {
        /// Context (class) id to log attendance against
        #[arg(short, long)]
        context: i64,
        /// Camera device or index; defaults to the daemon's configured camera
        #[arg(long, default_value = "")]
        camera: String,
    },
    /// Stop the running session
    Stop,
    /// Show daemon and session status
    Status,
    /// Show the latest attendance events of this daemon run
    Recent,
    /// Show logged attendance from the database
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
    /// Enroll a new person from the daemon's camera
    Enroll {
        /// Stable identifier (e.g. student number)
        key: String,
        /// Display name
        name: String,
        /// Class id to register the person in
        #[arg(long)]
        class: Option<i64>,
        /// Roll number, unique within the class
        #[arg(long, requires = "class")]
        roll: Option<String>,
        /// Email address, unique across all people
        #[arg(long)]
        email: Option<String>,
    },
    /// Manage classes people are registered in
    Classes {
        #[command(subcommand)]
        action: ClassAction,
    },
    /// Manage attendance contexts
    Contexts {
        #[command(subcommand)]
        action: ContextAction,
    },
    /// List enrolled identities
    Identities,
    /// List V4L2 capture devices (no daemon needed)
    Devices,
    /// Grab a few frames directly from a camera (no daemon needed)
    Test {
        #[arg(long, default_value = "/dev/video0")]
        camera: String,
        #[arg(short = 'n', long, default_value_t = 10)]
        frames: u32,
    },
}

#[derive(Subcommand)]
enum ClassAction {
    /// Create a class
    Add { name: String },
    /// List classes
    List,
}

#[derive(Subcommand)]
enum ContextAction {
    /// Create a context
    Add { name: String },
    /// List contexts
    List,
}

/// Re-indent a JSON reply; non-JSON is returned unchanged.
fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

async fn connect(system: bool) -> Result<KioskProxy<'static>> {
    tracing::debug!(system, "connecting to rollcalld");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = KioskProxy::new(&conn).await.context("is rollcalld running?")?;
    Ok(proxy)
}

fn camera_test(device: &str, frames: u32) -> Result<()> {
    let path = rollcall_hw::resolve_selector(device);
    let mut camera = Camera::open(&path, CaptureConfig::default())?;
    println!("{path}: {}x{}", camera.width, camera.height);

    let mut dark = 0;
    for _ in 0..frames {
        let frame = camera.capture()?;
        let is_dark = rollcall_hw::frame::is_dark_frame(&frame.image, 0.95);
        if is_dark {
            tracing::debug!(sequence = frame.sequence, "dark frame");
            dark += 1;
        }
        println!(
            "  seq {:>5}  {}x{}{}",
            frame.sequence,
            frame.width(),
            frame.height(),
            if is_dark { "  (dark)" } else { "" }
        );
    }
    camera.close();
    println!("{frames} frames, {dark} dark");
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
        Commands::Devices => {
            let devices = rollcall_hw::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test { camera, frames } => camera_test(&camera, frames)?,
        Commands::Start { context, camera } => {
            let id = connect(system).await?.start(&camera, context).await?;
            println!("Session {id} started");
        }
        Commands::Stop => {
            if connect(system).await?.stop().await? {
                println!("Session stopped");
            } else {
                println!("No session was running");
            }
        }
        Commands::Status => println!("{}", pretty(&connect(system).await?.status().await?)),
        Commands::Recent => println!("{}", pretty(&connect(system).await?.recent().await?)),
        Commands::History { limit } => {
            println!("{}", pretty(&connect(system).await?.history(limit).await?));
        }
        Commands::Enroll { key, name, class, roll, email } => {
            let proxy = connect(system).await?;
            println!("Look at the camera...");
            let reply = proxy
                .enroll(
                    &key,
                    &name,
                    class.unwrap_or(0),
                    roll.as_deref().unwrap_or(""),
                    email.as_deref().unwrap_or(""),
                )
                .await?;
            println!("{}", pretty(&reply));
        }
        Commands::Classes { action: ClassAction::Add { name } } => {
            let id = connect(system).await?.add_class(&name).await?;
            println!("Class {id} created");
        }
        Commands::Classes { action: ClassAction::List } => {
            println!("{}", pretty(&connect(system).await?.list_classes().await?));
        }
        Commands::Contexts { action: ContextAction::Add { name } } => {
            let id = connect(system).await?.add_context(&name).await?;
            println!("Context {id} created");
        }
        Commands::Contexts { action: ContextAction::List } => {
            println!("{}", pretty(&connect(system).await?.list_contexts().await?));
        }
        Commands::Identities => {
            println!("{}", pretty(&connect(system).await?.list_identities().await?));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start() {
        let cli = Cli::try_parse_from(["rollcall", "--system", "start", "-c", "4"]).unwrap();
        assert!(cli.system);
        match cli.command {
            Commands::Start { context, camera } => {
                assert_eq!(context, 4);
                assert!(camera.is_empty());
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_parse_enroll_with_registration() {
        let cli = Cli::try_parse_from([
            "rollcall", "enroll", "s17", "Ada", "--class", "2", "--roll", "17", "--email",
            "ada@example.org",
        ])
        .unwrap();
        match cli.command {
            Commands::Enroll { key, name, class, roll, email } => {
                assert_eq!((key.as_str(), name.as_str()), ("s17", "Ada"));
                assert_eq!(class, Some(2));
                assert_eq!(roll.as_deref(), Some("17"));
                assert_eq!(email.as_deref(), Some("ada@example.org"));
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_roll_number_needs_a_class() {
        assert!(Cli::try_parse_from(["rollcall", "enroll", "s17", "Ada", "--roll", "17"]).is_err());
    }

    #[test]
    fn test_parse_classes_add() {
        let cli = Cli::try_parse_from(["rollcall", "classes", "add", "CS-A"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Classes { action: ClassAction::Add { name } } if name == "CS-A"
        ));
    }

    #[test]
    fn test_pretty_passes_through_non_json() {
        assert_eq!(pretty("not json"), "not json");
        assert_eq!(pretty("[1]"), "[\n  1\n]");
    }
}
