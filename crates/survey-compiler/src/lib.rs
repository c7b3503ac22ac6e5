//! Survey Compiler
//!
//! Compiles regional survey databases into one yearly dataset and publishes
//! it as shapefile, geodatabase and tile archives.
//!
//! - **Run** (`survey-compiler run`): preflight, aggregation, geometry repair,
//!   export and metadata for one year, with progress persisted after each step
//! - **Sweep** (`survey-compiler sweep`): rebuild missing archives for prior
//!   years from their tile archives
//! - **Status** (`survey-compiler status`): which artifacts exist for a year
//! - **Baseline** (`survey-compiler baseline`): carry QC-approved geometries
//!   into the append-only baseline tables

pub mod aggregate;
pub mod baseline;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod export;
pub mod geometry;
pub mod pipeline;
pub mod prober;
pub mod reconcile;
pub mod status;
pub mod storage;
pub mod store;
pub mod sweep;
pub mod tools;

pub use config::Config;
pub use error::{CompilerError, Result};
pub use pipeline::{Pipeline, RunSummary, Services};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use catalog::{ShardName, Year};

/// Regional survey compiler
#[derive(Parser, Debug)]
#[command(name = "survey-compiler")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./survey-compiler.toml when present)
    #[arg(short, long, env = "SURVEY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile and publish one reporting year
    Run {
        /// Identifier under which progress is recorded
        #[arg(long)]
        run_id: String,

        /// Reporting year
        #[arg(long)]
        year: Year,

        /// After a successful run, sweep prior years starting here
        #[arg(long)]
        sweep_from: Option<Year>,
    },

    /// Rebuild missing archives of past years from their tile archives
    Sweep {
        /// First year (inclusive)
        #[arg(long)]
        from: Year,

        /// Last year (inclusive)
        #[arg(long)]
        to: Year,

        /// Regenerate even when the archives already exist
        #[arg(long)]
        force: bool,
    },

    /// Report which artifacts exist for a year
    Status {
        /// Reporting year
        #[arg(long)]
        year: Year,
    },

    /// Carry QC-approved geometries into the baseline tables
    Baseline {
        /// Identifier under which progress is recorded
        #[arg(long)]
        run_id: String,

        /// Reporting year
        #[arg(long)]
        year: Year,

        /// Limit to these shards (repeatable); all shards when omitted
        #[arg(long = "shard")]
        shards: Vec<ShardName>,
    },
}
