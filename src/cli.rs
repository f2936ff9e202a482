//! Command line definitions

use crate::download::Downloader;
use crate::experiment::ExperimentVariant;
use crate::export::DEFAULT_DATASET;
use crate::models::Platform;
use crate::report::SolvedDomainPolicy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "pinlab",
    version,
    about = "Measure how well certificate pinning bypass tools work on mobile apps",
    after_help = "\
EXAMPLES:
    pinlab app-ids data/app-ids.txt charts/*.txt          Merge app id lists
    pinlab download android data/app-ids.txt data/apks    Fetch APKs with apkeep
    pinlab run data/apks                                  Run every app under every method
    pinlab report                                         Print the evaluation"
)]
pub struct Cli {
    /// YAML file with tool paths and tunables
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory for the JSON log files
    #[arg(long, global = true, value_name = "DIR", default_value = "data/logs")]
    pub log_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run each app without bypass, with objection and with httptoolkit
    Run {
        /// Directory holding the APKs (split APKs in sub-directories)
        #[arg(value_name = "APP_DIR")]
        app_dir: PathBuf,

        /// Result database
        #[arg(long, value_name = "FILE", default_value = "data/results.db")]
        db: PathBuf,
    },

    /// Capture traffic while a UI exerciser drives each app
    Monkey {
        platform: Platform,

        #[arg(value_name = "APP_DIR")]
        app_dir: PathBuf,

        /// Where the HAR and meta files go
        #[arg(value_name = "DATA_DIR")]
        data_dir: PathBuf,

        /// Address of this machine as seen from the device (required on iOS)
        #[arg(value_name = "PROXY_IP")]
        proxy_ip: Option<String>,

        #[arg(long, value_enum, default_value = "monkey-april-2024")]
        variant: ExperimentVariant,
    },

    /// Download packages for a list of app ids
    Download {
        platform: Platform,

        /// Newline-separated app ids
        #[arg(value_name = "APP_IDS")]
        app_ids: PathBuf,

        #[arg(value_name = "OUT_DIR")]
        out_dir: PathBuf,

        /// Store client (defaults to apkeep on Android and ipatool on iOS)
        #[arg(long, value_enum)]
        tool: Option<Downloader>,
    },

    /// Merge app id lists (text or JSON) into one de-duplicated file
    AppIds {
        #[arg(value_name = "OUT")]
        out: PathBuf,

        #[arg(value_name = "INPUT", required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Load captured HAR files into the requests table
    Export {
        platform: Platform,

        #[arg(value_name = "DATA_DIR")]
        data_dir: PathBuf,

        #[arg(value_name = "DB")]
        db: PathBuf,

        #[arg(long, default_value = DEFAULT_DATASET)]
        dataset: String,
    },

    /// Print crash, TLS error and solved domain statistics
    Report {
        #[arg(long, value_name = "FILE", default_value = "data/results.db")]
        db: PathBuf,

        #[arg(long, value_enum, default_value = "per-app")]
        solved_policy: SolvedDomainPolicy,
    },
}
