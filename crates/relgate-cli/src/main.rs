//! relgate - release-tag verification and publication
//!
//! ## Commands
//!
//! - `check-tag`: Parse a tag and optionally compare it with the manifest
//! - `plan`: Show the job graph waves, graph digest and install variants
//! - `run`: Run the full pipeline for a tag
//! - `verify`: Re-run installation checks for an already published version

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use relgate_ci::{ReleaseConfig, DEFAULT_CONFIG_FILE};
use relgate_core::{
    parse_tag, read_manifest_version, validate, Artifact, InstallVerifier, PipelineRun,
    TrailingPolicy,
};

/// Fallback tag source when neither `--tag` nor `RELGATE_TAG` is given.
const GITHUB_REF_ENV: &str = "GITHUB_REF_NAME";

#[derive(Parser)]
#[command(name = "relgate")]
#[command(author = "relgate maintainers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Verify a release tag, gate publication on CI, and check the published package installs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TrailingArg {
    Reject,
    Ignore,
}

impl From<TrailingArg> for TrailingPolicy {
    fn from(arg: TrailingArg) -> Self {
        match arg {
            TrailingArg::Reject => TrailingPolicy::Reject,
            TrailingArg::Ignore => TrailingPolicy::Ignore,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a release tag and print the version it denotes
    CheckTag {
        /// Tag, e.g. v1.2.3 or v1.2.3-rc1
        tag: String,

        /// Manifest to compare against (pyproject.toml, Cargo.toml or VERSION)
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// How to treat text after the version
        #[arg(long, value_enum, default_value = "reject")]
        trailing: TrailingArg,
    },

    /// Show the job graph, its digest and the install variants
    Plan {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },

    /// Run the release pipeline
    Run {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Release tag (falls back to GITHUB_REF_NAME)
        #[arg(short, long, env = "RELGATE_TAG")]
        tag: Option<String>,

        /// Write the JSON run report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Keep the built artifact here if the run fails after building it
        #[arg(long)]
        retain_dir: Option<PathBuf>,
    },

    /// Check that a published version installs in every variant
    Verify {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Release tag of the published version
        #[arg(short, long, env = "RELGATE_TAG")]
        tag: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    relgate_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::CheckTag {
            tag,
            manifest,
            trailing,
        } => cmd_check_tag(&tag, manifest.as_deref(), trailing.into()),
        Commands::Plan { config } => cmd_plan(&config),
        Commands::Run {
            config,
            tag,
            report,
            retain_dir,
        } => {
            let tag = resolve_tag(tag, |key| std::env::var(key).ok())?;
            cmd_run(&config, &tag, report.as_deref(), retain_dir.as_deref()).await
        }
        Commands::Verify { config, tag } => {
            let tag = resolve_tag(tag, |key| std::env::var(key).ok())?;
            cmd_verify(&config, &tag).await
        }
    }
}

/// `--tag` / `RELGATE_TAG` win; otherwise the CI ref name.
fn resolve_tag(
    explicit: Option<String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String> {
    explicit
        .filter(|t| !t.is_empty())
        .or_else(|| lookup(GITHUB_REF_ENV).filter(|t| !t.is_empty()))
        .context("no release tag: pass --tag or set RELGATE_TAG or GITHUB_REF_NAME")
}

fn cmd_check_tag(tag: &str, manifest: Option<&Path>, trailing: TrailingPolicy) -> Result<()> {
    let version = parse_tag(tag, trailing)?;

    println!("Tag:      {}", tag);
    println!("Version:  {}", version);
    println!(
        "Kind:     {}",
        if version.is_final() {
            "final"
        } else {
            "pre-release"
        }
    );

    if let Some(path) = manifest {
        let declared = read_manifest_version(path)?;
        println!("Manifest: {} ({})", declared, path.display());
        validate(&version, &declared)?;
        println!("\n✓ Tag and manifest agree");
    }
    Ok(())
}

fn cmd_plan(config_path: &Path) -> Result<()> {
    let config = ReleaseConfig::load(config_path)?;
    let graph = config.job_graph().context("invalid job graph")?;

    println!("Package: {}", config.package.name);
    println!("Manifest: {}", config.manifest_path().display());
    println!("Graph digest: {}", graph.digest());
    println!();

    for (wave, jobs) in graph.levels().iter().enumerate() {
        println!("Wave {}:", wave + 1);
        for job in jobs {
            let needs = graph.dependencies_of(job);
            if needs.is_empty() {
                println!("  - {}", job);
            } else {
                println!("  - {} (needs: {})", job, needs.join(", "));
            }
        }
    }

    println!();
    println!("Publish to: {}", config.index.url);
    println!("Install variants:");
    for variant in config.variants() {
        println!("  - {}", variant);
    }
    Ok(())
}

async fn cmd_run(
    config_path: &Path,
    tag: &str,
    report_path: Option<&Path>,
    retain_dir: Option<&Path>,
) -> Result<()> {
    let config = ReleaseConfig::load(config_path)?;
    let pipeline = config.pipeline()?;

    println!("Releasing {} from tag {}", config.package.name, tag);
    println!();

    let run = pipeline.run(tag).await;
    print_summary(&run);

    if let Some(path) = report_path {
        write_report(&run, path)?;
        info!(path = %path.display(), "run report written");
    }
    if let (Some(dir), Some(artifact)) = (retain_dir, run.retained_artifact.as_ref()) {
        let kept = retain_artifact(artifact, dir)?;
        println!("Artifact retained at {}", kept.display());
    }

    if run.succeeded() {
        Ok(())
    } else {
        anyhow::bail!("{}", run.report.outcome)
    }
}

async fn cmd_verify(config_path: &Path, tag: &str) -> Result<()> {
    let config = ReleaseConfig::load(config_path)?;
    let version = parse_tag(tag, config.tag.trailing)?;
    let index = Arc::new(config.index());
    let verifier = InstallVerifier::new(config.package.name.clone(), index)
        .with_variants(config.variants())
        .with_policy(config.retry_policy())
        .parallel(config.verify.parallel);

    let report = verifier.verify(&version).await;
    for variant in &report.variants {
        let status = if variant.passed { "✓" } else { "✗" };
        println!(
            "  {} {} ({} attempt(s))",
            status,
            variant.requirement,
            variant.attempts.len()
        );
        if let Some(error) = &variant.error {
            println!("      {}", error);
        }
    }

    if report.passed() {
        println!(
            "\n✓ {} {} installs in every variant",
            config.package.name, version
        );
        return Ok(());
    }
    match report.first_failure() {
        Some(err) => Err(err.into()),
        None => anyhow::bail!("no install variant was verified"),
    }
}

fn print_summary(run: &PipelineRun) {
    let report = &run.report;
    println!("Run ID: {}", report.run_id);
    if let Some(version) = &report.version {
        println!("Version: {}", version);
    }
    println!();

    for stage in &report.stages {
        let status = if stage.passed { "✓" } else { "✗" };
        println!(
            "  {} {} ({}ms): {}",
            status, stage.stage, stage.duration_ms, stage.diagnostic
        );
    }

    if !report.jobs.is_empty() {
        println!();
        println!("Jobs:");
        for job in &report.jobs {
            let status = match &job.state {
                relgate_core::JobState::Success => "✓".to_string(),
                relgate_core::JobState::Failure(cause) => format!("✗ {}", cause.describe()),
                relgate_core::JobState::Pending => "…".to_string(),
            };
            println!("  {} {}", job.name, status);
        }
    }

    println!();
    println!("{}", report.outcome);
}

fn write_report(run: &PipelineRun, path: &Path) -> Result<()> {
    let json = run.report.to_json().context("failed to serialize run report")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn retain_artifact(artifact: &Artifact, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(&artifact.file_name);
    std::fs::write(&path, &artifact.payload)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
