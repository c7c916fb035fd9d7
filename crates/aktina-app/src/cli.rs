use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "aktina",
    version,
    author,
    about = "Imaging study ingestion and search service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the aktina HTTP server.
    Serve,
    /// Upload local imaging files and index the resulting studies.
    Ingest(IngestArgs),
    /// Run a faceted study search and print the result as JSON.
    Search(SearchArgs),
    /// Fetch study, series, or instance metadata from the archive.
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Files to upload to the archive.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Full-text search term.
    pub search: String,
    #[arg(long)]
    pub modality: Option<String>,
    #[arg(long)]
    pub patient_id: Option<String>,
    #[arg(long)]
    pub patient_name: Option<String>,
    /// Start of the study date range (ISO 8601).
    #[arg(long)]
    pub from_date: Option<String>,
    /// End of the study date range (ISO 8601).
    #[arg(long)]
    pub to_date: Option<String>,
    /// Gender filter; repeat for multiple values, `UNKNOWN` selects
    /// studies without a recorded gender.
    #[arg(long)]
    pub gender: Vec<String>,
    /// Report category filter; repeat for multiple values.
    #[arg(long)]
    pub category: Vec<String>,
    #[arg(long)]
    pub limit: Option<usize>,
    #[arg(long)]
    pub offset: Option<usize>,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Study instance UID.
    pub study_uid: String,
    /// Narrow the fetch to one series.
    #[arg(long)]
    pub series_uid: Option<String>,
    /// Narrow the fetch to one instance; requires --series-uid.
    #[arg(long, requires = "series_uid")]
    pub instance_uid: Option<String>,
}
