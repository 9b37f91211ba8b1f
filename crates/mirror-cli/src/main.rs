use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod train;

#[zbus::proxy(
    interface = "org.freedesktop.Mirror1",
    default_service = "org.freedesktop.Mirror1",
    default_path = "/org/freedesktop/Mirror1"
)]
trait Mirror {
    async fn pause(&self) -> zbus::Result<()>;
    async fn resume(&self) -> zbus::Result<()>;
    async fn stop(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "mirror", about = "Smart mirror identity tracker CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the identity classifier from a directory of labelled faces
    Train {
        /// Image directory, one sub-directory per person
        #[arg(short, long)]
        input: PathBuf,
        /// Directory for embeddings and the fitted classifier
        #[arg(short, long)]
        output: PathBuf,
        /// Embedding pipeline executable
        #[arg(long, default_value = "main.lua")]
        pipeline: PathBuf,
        /// Embedding network passed to the pipeline
        #[arg(long, default_value = "nn4.small2.v1.t7")]
        network: PathBuf,
        /// Let the pipeline use CUDA
        #[arg(long)]
        cuda: bool,
        /// Fit from labels.csv/reps.csv already in the output directory
        #[arg(long)]
        skip_pipeline: bool,
    },
    /// Pause tracking (keeps the current identity)
    Pause,
    /// Resume tracking
    Resume,
    /// Stop the capture loop
    Stop,
    /// Show the current identity and mode
    Status,
    /// List capture devices
    Test,
}

async fn proxy() -> Result<MirrorProxy<'static>> {
    let conn = zbus::Connection::session().await?;
    Ok(MirrorProxy::new(&conn).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            input,
            output,
            pipeline,
            network,
            cuda,
            skip_pipeline,
        } => {
            let opts = train::TrainOptions {
                input,
                output,
                pipeline,
                network,
                cuda,
                skip_pipeline,
            };
            let path = tokio::task::spawn_blocking(move || train::train(&opts)).await??;
            println!("Classifier saved to {}", path.display());
        }
        Commands::Pause => {
            proxy().await?.pause().await?;
            println!("Tracking paused");
        }
        Commands::Resume => {
            proxy().await?.resume().await?;
            println!("Tracking resumed");
        }
        Commands::Stop => {
            proxy().await?.stop().await?;
            println!("Capture loop stopping");
        }
        Commands::Status => {
            let raw = proxy().await?.status().await?;
            let status: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test => {
            let devices = mirror_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}
