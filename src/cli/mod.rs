//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "quarry",
    version,
    author = "neur0map",
    about = "Hybrid retrieval and ranking core",
    long_about = "Quarry fuses keyword and vector search, reranks, diversifies and budgets \
                  evidence for a downstream answer generator. This binary is a maintenance tool: \
                  inspect configuration, see how a query would be routed, ingest a corpus and run \
                  queries against it."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/quarry/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Configuration profile to apply (e.g., "fast")
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show how a query would be classified
    Classify {
        query: String,
    },

    /// Show the route and retrieval strategy chosen for a query
    Route {
        query: String,
    },

    /// Split a query into sub-queries
    Decompose {
        query: String,
    },

    /// Load chunks from a JSONL file into the chunk store and keyword index
    Ingest {
        /// One chunk per line: {"id", "text", "source_file", "page", "chunk_index"}
        input: PathBuf,

        /// Store chunks without computing embeddings
        #[arg(long)]
        no_embed: bool,
    },

    /// Run a query against the ingested corpus and print the result bundle
    Query {
        /// Search query text
        query: String,

        /// Only use chunks whose source file contains this text
        #[arg(short, long)]
        filter: Option<String>,

        /// Maximum evidence characters
        #[arg(short, long)]
        budget: Option<usize>,

        /// Force decomposition on (true) or off (false)
        #[arg(long)]
        decompose: Option<bool>,

        /// Include every candidate's score breakdown
        #[arg(long)]
        debug: bool,

        /// Keyword search only; skips loading the embedding model
        #[arg(long)]
        keyword_only: bool,
    },

    /// Record or inspect ratings of result bundles
    Feedback {
        #[command(subcommand)]
        action: FeedbackAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum FeedbackAction {
    /// Rate a result bundle from 1 (very bad) to 5 (excellent)
    Rate {
        /// Bundle id printed by `quarry query`
        bundle_id: String,

        rating: i64,

        /// The query that produced the bundle
        #[arg(short, long)]
        query: String,

        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Show aggregate ratings from the feedback log
    Stats {
        /// Number of low-rated queries to list
        #[arg(short, long, default_value = "10")]
        low_rated: usize,
    },

    /// Export stats and records to a JSON file
    Export {
        output: PathBuf,

        /// Only include records rated at least this high
        #[arg(long, default_value = "1")]
        min_rating: u8,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
