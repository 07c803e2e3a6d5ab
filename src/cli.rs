use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "docrelay")]
#[command(about = "Storage upload notifier and document ingestor", long_about = None)]
pub struct Cli {
    /// Path to a TOML config file (defaults to config/docrelay.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Receive storage events over HTTP and publish them to the topic
    Notifier(NotifierArgs),
    /// Pull messages from the subscription and download the objects
    Ingestor(IngestorArgs),
}

#[derive(clap::Args, Debug)]
pub struct NotifierArgs {
    /// Address to bind the HTTP server to
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct IngestorArgs {
    /// Directory downloaded objects are written under
    #[arg(long)]
    pub download_root: Option<PathBuf>,

    /// Number of concurrent download workers
    #[arg(long)]
    pub workers: Option<usize>,
}
