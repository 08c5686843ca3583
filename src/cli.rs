use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "benchtrack",
    version,
    about = "Provenance-tracked ingestion of AI benchmark results"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the data layout and an empty store.
    Init(InitArgs),
    /// Run the full pipeline: fetch, validate, merge, commit.
    Update(UpdateArgs),
    /// Summarize the current store contents.
    Status(StatusArgs),
    /// List configured benchmarks and their scales.
    ListBenchmarks(ListBenchmarksArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "data")]
    pub data_root: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct UpdateArgs {
    #[arg(long, default_value = "data")]
    pub data_root: PathBuf,

    /// Restrict the run to a single benchmark source.
    #[arg(long)]
    pub benchmark: Option<String>,

    /// Run every stage except the commit; report what would change.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = "data")]
    pub data_root: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ListBenchmarksArgs {
    #[arg(long, default_value = "data")]
    pub data_root: PathBuf,
}
