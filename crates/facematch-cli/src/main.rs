use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `FaceMatchProxy` (async) from this trait.
#[zbus::proxy(
    interface = "org.facematch.FaceMatch1",
    default_service = "org.facematch.FaceMatch1",
    default_path = "/org/facematch/FaceMatch1"
)]
trait FaceMatch {
    async fn enroll(&self, image_path: &str, label: &str, description: &str) -> zbus::Result<String>;
    async fn enroll_batch(&self, image_path: &str, labels: Vec<String>) -> zbus::Result<String>;
    async fn detect(&self, image_path: &str) -> zbus::Result<String>;
    async fn search(&self, image_path: &str, top_k: u32) -> zbus::Result<String>;
    async fn list_faces(&self, offset: u32, limit: u32) -> zbus::Result<String>;
    async fn get_face(&self, id: i64) -> zbus::Result<String>;
    async fn update_face(&self, id: i64, label: &str, description: &str) -> zbus::Result<String>;
    async fn remove_face(&self, id: i64) -> zbus::Result<bool>;
    async fn match_history(&self, offset: u32, limit: u32) -> zbus::Result<String>;
    async fn stats(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facematch", about = "facematch face enrollment and search CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face in an image under a label
    Enroll {
        image: PathBuf,
        /// Identity label (e.g., "Alice Smith")
        #[arg(short, long)]
        label: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Enroll every face in a group photo; labels pair with faces left to right
    EnrollBatch {
        image: PathBuf,
        /// One label per face, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        labels: Vec<String>,
    },
    /// Show detected faces in label order and save a crop of each
    Detect { image: PathBuf },
    /// Find the closest enrolled faces
    Search {
        image: PathBuf,
        /// Number of results (0 = daemon default)
        #[arg(short = 'k', long, default_value_t = 0)]
        top_k: u32,
    },
    /// List enrolled faces
    List {
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 0)]
        limit: u32,
    },
    /// Show one enrolled face
    Show { id: i64 },
    /// Change a face's label and description
    Update {
        id: i64,
        #[arg(short, long)]
        label: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Remove an enrolled face
    Remove { id: i64 },
    /// Show recent searches, newest first
    History {
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show face and search counts
    Stats,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = FaceMatchProxy::new(&conn)
        .await
        .context("facematchd is not reachable")?;

    let reply = match cli.command {
        Commands::Enroll {
            image,
            label,
            description,
        } => {
            let image = absolute(&image)?;
            proxy.enroll(&image, &label, &description).await?
        }
        Commands::EnrollBatch { image, labels } => {
            let image = absolute(&image)?;
            proxy.enroll_batch(&image, labels).await?
        }
        Commands::Detect { image } => proxy.detect(&absolute(&image)?).await?,
        Commands::Search { image, top_k } => proxy.search(&absolute(&image)?, top_k).await?,
        Commands::List { offset, limit } => proxy.list_faces(offset, limit).await?,
        Commands::Show { id } => proxy.get_face(id).await?,
        Commands::Update {
            id,
            label,
            description,
        } => proxy.update_face(id, &label, &description).await?,
        Commands::Remove { id } => {
            if proxy.remove_face(id).await? {
                println!("Removed face {id}");
            } else {
                println!("No face with id {id}");
            }
            return Ok(());
        }
        Commands::History { offset, limit } => proxy.match_history(offset, limit).await?,
        Commands::Stats => proxy.stats().await?,
        Commands::Status => proxy.status().await?,
    };

    println!("{}", pretty(&reply));
    Ok(())
}

/// The daemon resolves paths itself, so relative paths must be made absolute here.
fn absolute(path: &Path) -> Result<String> {
    let resolved = path
        .canonicalize()
        .with_context(|| format!("cannot access {}", path.display()))?;
    Ok(resolved.to_string_lossy().into_owned())
}

/// Re-indent a JSON reply; anything unparseable is printed as-is.
fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| reply.to_string())
}
