//! Command-line argument parsing for toolhost

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// toolhost - plugin and tool registry runtime
#[derive(Parser, Debug)]
#[command(name = "toolhost")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Plugin directory (overrides configuration)
    #[arg(long, value_name = "DIR")]
    pub plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List discovered plugins and whether they are loaded
    List,

    /// Load the configured plugins and show their tools
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a single plugin and report the result
    Load {
        /// Plugin unit name
        name: String,
    },

    /// Load the configured plugins and invoke one tool
    Call {
        /// Tool name
        tool: String,

        /// Tool parameter as KEY=VALUE (repeatable)
        #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Load the configured plugins and reload them as their sources change
    Watch {
        /// Seconds between change checks (overrides configuration)
        #[arg(short, long, value_name = "SECS")]
        interval: Option<u64>,
    },
}

/// Parse a `KEY=VALUE` pair
pub fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}
