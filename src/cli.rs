//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. Global overrides are merged into the configuration through the
//! `figment::Provider` implementation below.

use clap::{Parser, Subcommand};
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Watches the certificate transparency stream for sites of a known operator group.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error).
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Directory for the watchlist, profile and processed-URL ledger.
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Print alerts as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build the reference profile from known example sites.
    Research {
        /// Example site URLs.
        urls: Vec<String>,
        /// File with one URL per line; `#` starts a comment.
        #[arg(long, value_name = "FILE")]
        urls_file: Option<PathBuf>,
    },
    /// Lock the profile and watch the certificate stream.
    Listen {
        /// Override the stream URL.
        #[arg(long, value_name = "URL")]
        certstream_url: Option<String>,
        /// Consecutive failed reconnects before giving up.
        #[arg(long, value_name = "N")]
        max_retries: Option<u32>,
    },
    /// Print the fingerprint and network facts of a single site.
    Inspect {
        url: String,
    },
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        if let Some(dir) = &self.data_dir {
            dict.insert(
                "data_dir".into(),
                Value::from(dir.to_string_lossy().into_owned()),
            );
        }

        if self.json {
            let mut output = Dict::new();
            output.insert("format".into(), Value::from("Json"));
            dict.insert("output".into(), Value::from(output));
        }

        if let Command::Listen {
            certstream_url,
            max_retries,
        } = &self.command
        {
            let mut stream = Dict::new();
            if let Some(url) = certstream_url {
                stream.insert("certstream_url".into(), Value::from(url.clone()));
            }
            if let Some(retries) = max_retries {
                stream.insert("max_retries".into(), Value::from(*retries));
            }
            if !stream.is_empty() {
                dict.insert("stream".into(), Value::from(stream));
            }
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
