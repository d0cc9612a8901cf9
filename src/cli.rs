use clap::{Parser, Subcommand, ValueEnum};

// Display order for log level option (placed at end of help text)
const LOG_LEVEL_DISPLAY_ORDER: usize = 100;

/// CLI arguments
#[derive(Parser)]
#[command(name = "concord", version, about = "Consensus code review across multiple LLM providers", long_about = None)]
pub struct Cli {
    /// Log level (see https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html)
    /// [env: CONCORD_LOG=] [default: info]
    #[arg(
        long,
        env = "CONCORD_LOG",
        default_value = "info",
        global = true,
        hide_default_value = true,
        hide_env = true,
        display_order = LOG_LEVEL_DISPLAY_ORDER,
        verbatim_doc_comment
    )]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a default concord.toml config file
    Init(InitArgs),
    /// Review a change set with every enabled provider
    Review(ReviewArgs),
}

/// Arguments for the init command
#[derive(Parser)]
pub struct InitArgs {
    /// Path to config file
    #[arg(long, default_value = "concord.toml")]
    pub config: String,

    /// Override existing config file
    #[arg(long)]
    pub r#override: bool,
}

/// Format of the final review written to `--output`
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Md,
    Json,
}

/// Arguments for the review command
#[derive(Parser, Debug)]
pub struct ReviewArgs {
    /// Change set to review (JSON: {title?, description?, files: [{path, status, hunks}]})
    #[arg(long)]
    pub changes: String,

    /// Existing discussion used to suppress duplicates (JSON array)
    #[arg(long)]
    pub comments: Option<String>,

    /// Path to config file (initialize with `concord init`)
    #[arg(long, default_value = "concord.toml")]
    pub config: String,

    /// Override config values using dot notation (e.g. engine.debounce_ms=250)
    #[arg(long = "config-override")]
    pub config_overrides: Vec<String>,

    /// Output file path (.md or .json)
    #[arg(long)]
    pub output: Option<String>,

    /// Output format, inferred from the --output extension when omitted
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Stream events to stdout as JSON lines
    #[arg(long)]
    pub events: bool,
}

impl ReviewArgs {
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.format.or_else(|| {
            let path = self.output.as_deref()?;
            if path.ends_with(".json") {
                Some(OutputFormat::Json)
            } else if path.ends_with(".md") {
                Some(OutputFormat::Md)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_review_args() {
        let cli = Cli::try_parse_from([
            "concord",
            "review",
            "--changes",
            "changes.json",
            "--config-override",
            "engine.debounce_ms=250",
            "--config-override",
            "review.strictness=quick",
            "--output",
            "review.json",
            "--events",
        ])
        .unwrap();
        let Commands::Review(args) = cli.command else {
            panic!("expected review command");
        };
        assert_eq!(args.changes, "changes.json");
        assert_eq!(args.config, "concord.toml");
        assert_eq!(args.config_overrides.len(), 2);
        assert!(args.events);
        assert_eq!(args.output_format(), Some(OutputFormat::Json));
    }

    #[test]
    fn test_output_format() {
        let cli = Cli::try_parse_from([
            "concord", "review", "--changes", "c.json", "--output", "out.txt", "--format", "md",
        ])
        .unwrap();
        let Commands::Review(args) = cli.command else {
            panic!("expected review command");
        };
        assert_eq!(args.output_format(), Some(OutputFormat::Md));
    }
}
