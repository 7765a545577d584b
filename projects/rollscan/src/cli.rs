use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory holding the session pointer and the session trees
    #[arg(long, env = "ROLLSCAN_DATA_ROOT", default_value = "data")]
    pub data_root: PathBuf,

    /// JSON file overriding pipeline defaults
    #[arg(long, env = "ROLLSCAN_PIPELINE_CONFIG")]
    pub pipeline_config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run the pipeline workers until Ctrl-C
    Run {
        /// Base URL of the batch-inference service
        #[arg(long, env = "ROLLSCAN_CLASSIFIER_URL", default_value = "http://localhost:8001")]
        classifier_url: String,

        /// Timeout of one classification request
        #[arg(long, env = "ROLLSCAN_CLASSIFIER_TIMEOUT_SECS", default_value_t = 60)]
        classifier_timeout_secs: u64,

        /// Pause between two polls of each worker
        #[arg(long, env = "ROLLSCAN_POLL_INTERVAL_SECS", default_value_t = 5)]
        poll_interval_secs: u64,
    },

    /// Start a new session from a video file
    Register { video: PathBuf },

    /// Delete every session and the active-session pointer
    Reset,

    /// Print the active session's summary as JSON
    Summary,

    /// Export the active session's defect log as CSV
    Export {
        /// Output file, stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Regenerate the active session's rollmap images
    Rollmap,

    /// Move the oldest annotated frame to the session's last.jpg
    TakeFrame,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
