//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// TaskCell - recursive, budget-governed task delegation
#[derive(Parser)]
#[command(
    name = "tc",
    about = "Run scripted task hierarchies through the TaskCell kernel",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Logs are written to: ~/.local/share/taskcell/logs/taskcell.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Submit a scenario's root task and print the outcome
    Run {
        /// Scenario file (YAML)
        #[arg(value_name = "SCENARIO")]
        scenario: PathBuf,

        /// Total budget; overrides the scenario's own
        #[arg(short, long)]
        budget: Option<f64>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,

        /// Append audit records to this JSONL file
        #[arg(long)]
        audit: Option<PathBuf>,
    },

    /// Check that every plan in a scenario is valid
    Validate {
        /// Scenario file (YAML)
        #[arg(value_name = "SCENARIO")]
        scenario: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

/// Output format for `run`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

/// Default budget when neither the flag nor the scenario sets one
pub const DEFAULT_BUDGET: f64 = 100.0;

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskcell")
        .join("logs")
        .join("taskcell.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("TEXT".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from(["tc", "-v", "run", "scenario.yml", "--budget", "50", "--format", "json"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Some(Command::Run {
                scenario,
                budget,
                format,
                audit,
            }) => {
                assert_eq!(scenario, PathBuf::from("scenario.yml"));
                assert_eq!(budget, Some(50.0));
                assert_eq!(format, OutputFormat::Json);
                assert!(audit.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_log_path_under_taskcell() {
        assert!(get_log_path().ends_with("taskcell/logs/taskcell.log"));
    }
}
