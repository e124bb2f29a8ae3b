//! Command line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "refresher")]
#[command(about = "Repair missing Plex metadata with TMDB lookups", long_about = None)]
pub struct Cli {
    /// Load settings from this file instead of `.env`
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Run one refresh pass over all libraries (the default)
    Run,

    /// Forget an item's failure history so it is retried on the next run
    Reset {
        /// Plex rating key of the item
        item_id: String,
    },

    /// Show state store counts, recent dead items and the last run's health
    Status {
        /// Number of dead items to list
        #[arg(long, default_value_t = 20)]
        dead: i64,
    },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let cli = Cli::parse_from(["refresher"]);
        assert_eq!(cli.command(), Command::Run);
    }

    #[test]
    fn test_reset_and_status() {
        let cli = Cli::parse_from(["refresher", "reset", "12345"]);
        assert_eq!(
            cli.command(),
            Command::Reset {
                item_id: "12345".to_string()
            }
        );

        let cli = Cli::parse_from(["refresher", "--env-file", "/etc/refresher.env", "status"]);
        assert_eq!(cli.command(), Command::Status { dead: 20 });
        assert_eq!(cli.env_file, Some(PathBuf::from("/etc/refresher.env")));
    }
}
