mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cli::{Cli, Commands, InitArgs, OutputFormat, ReviewArgs};
use concord::config::{Config, DEFAULT_CONFIG};
use concord::provider::create_providers;
use concord::review::orchestrator::Orchestrator;
use concord::review::render::{self, Feed};
use concord::types::{ChangeSet, ExistingComment, Verdict};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const EXIT_FAILURE: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match &cli.command {
        Commands::Init(args) => init(args).map(|_| ExitCode::SUCCESS),
        Commands::Review(args) => review(args).await,
    };
    result.unwrap_or_else(|e| {
        error!("{:#}", e);
        ExitCode::from(EXIT_FAILURE)
    })
}

/// Logs go to stderr so `--events` output on stdout stays machine-readable
fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|e| {
        eprintln!("Invalid log level '{}': {}, using info", level, e);
        EnvFilter::new("info")
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn init(args: &InitArgs) -> Result<()> {
    if Path::new(&args.config).exists() && !args.r#override {
        bail!(
            "{} already exists, pass --override to replace it",
            args.config
        );
    }
    std::fs::write(&args.config, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write {}", args.config))?;
    info!("Config written to {}", args.config);
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &str) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path))
}

async fn review(args: &ReviewArgs) -> Result<ExitCode> {
    let config = Config::load(&args.config, &args.config_overrides)
        .with_context(|| format!("Failed to load config {}", args.config))?;
    let change_set: ChangeSet = read_json(&args.changes)?;
    let comments: Vec<ExistingComment> = match &args.comments {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };
    if args.output.is_some() && args.output_format().is_none() {
        bail!("Output file must end with .md or .json, or pass --format");
    }
    debug!(
        "Loaded {} changed files and {} existing comments",
        change_set.files.len(),
        comments.len()
    );

    let orchestrator = Orchestrator::new(
        create_providers(&config.providers),
        config.review.clone(),
    )
    .engine_settings(config.engine.settings())
    .summary_provider(config.summary.preferred_provider.clone())
    .existing_comments(comments);
    let mut session = orchestrator.run(change_set);

    // First Ctrl+C flushes partial results, a second one abandons the review
    let mut interrupts = 0;
    let mut feed = Feed::default();
    loop {
        let event = tokio::select! {
            event = session.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    warn!("Received Ctrl+C, flushing partial results (press again to abort)...");
                    session.flush();
                } else {
                    warn!("Received Ctrl+C again, cancelling review");
                    session.cancel();
                }
                continue;
            }
        };
        let Some(event) = event else {
            break;
        };

        info!("{}", render::describe_event(&event));
        if args.events {
            println!("{}", serde_json::to_string(&event)?);
        }
        feed.apply(&event);
    }

    // Providers still streaming after an early finish are abandoned
    session.cancel();
    let report = session.wait().await;
    debug!(
        "Provider tasks settled: {} succeeded, {} failed",
        report.succeeded, report.failed
    );

    match (&args.output, args.output_format()) {
        (Some(path), Some(format)) => write_output(path, format, &feed)?,
        _ if !args.events => {
            for line in render::format_feed(&feed).lines() {
                info!("{}", line);
            }
        }
        _ => {}
    }

    if let Some(message) = &feed.fatal_error {
        error!("Review failed: {}", message);
        return Ok(ExitCode::from(EXIT_FAILURE));
    }
    match feed.verdict {
        Some(Verdict::RequestChanges) => {
            warn!("Providers requested changes");
            Ok(ExitCode::from(EXIT_FAILURE))
        }
        Some(_) => Ok(ExitCode::SUCCESS),
        None => {
            warn!("Review cancelled before completion");
            Ok(ExitCode::from(EXIT_FAILURE))
        }
    }
}

fn write_output(path: &str, format: OutputFormat, feed: &Feed) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(feed)?,
        OutputFormat::Md => render::format_feed(feed),
    };
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path))?;
    info!("Results written to {}", path);
    Ok(())
}
