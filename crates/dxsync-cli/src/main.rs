//! Command-line front-end for the authoring sync engine.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::warn;

use dxsync_core::{ArtifactKind, Options, PULL_ORDER};
use dxsync_engine::{DriverConfig, RunReport, SyncContext};
use dxsync_storage::http::HttpConfig;

#[derive(Debug, Parser)]
#[command(name = "dxsync")]
#[command(about = "Synchronize digital-experience authoring artifacts with a tenant")]
struct Cli {
    /// Authoring service base URL, e.g. https://tenant.example.com/api.
    #[arg(long, env = "DXSYNC_URL")]
    url: String,

    /// Working directory holding the local artifact tree.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload local artifacts to the service.
    Push(TransferArgs),
    /// Download artifacts from the service.
    Pull(TransferArgs),
    /// List remote artifact names for the selected kinds.
    List {
        #[command(flatten)]
        kinds: KindFlags,
        /// Only names modified since the last pull.
        #[arg(long)]
        modified: bool,
        /// Names that were synced before but are gone from the server.
        #[arg(long)]
        deleted: bool,
        /// Raw resource ids instead of asset paths (assets only).
        #[arg(long)]
        resources: bool,
    },
    /// Delete one remote artifact by path (assets) or id.
    Delete {
        /// Artifact kind, e.g. asset or content-type.
        #[arg(long)]
        kind: String,
        name: String,
    },
}

#[derive(Debug, Args)]
struct TransferArgs {
    #[command(flatten)]
    kinds: KindFlags,

    /// Transfer everything instead of only artifacts modified since the
    /// last clean run.
    #[arg(short = 'I', long)]
    ignore_timestamps: bool,

    /// Ask the server to accept updates despite revision mismatches.
    #[arg(short = 'f', long)]
    force_override: bool,

    /// Treat already-existing artifacts as success.
    #[arg(long)]
    create_only: bool,

    /// Request immediate publishing of pushed artifacts.
    #[arg(long)]
    publish_now: bool,

    /// Skip writing the per-item error log file.
    #[arg(long)]
    no_error_log: bool,
}

#[derive(Debug, Args)]
struct KindFlags {
    /// Include assets.
    #[arg(short = 'a', long)]
    assets: bool,

    /// Include content items.
    #[arg(short = 'c', long)]
    content: bool,

    /// Include categories.
    #[arg(short = 'C', long)]
    categories: bool,

    /// Include content types.
    #[arg(short = 't', long)]
    types: bool,

    /// Include layouts and layout mappings.
    #[arg(short = 'p', long)]
    presentations: bool,

    /// Include publishing sources.
    #[arg(short = 's', long)]
    publishing_sources: bool,

    /// Include renditions.
    #[arg(short = 'r', long)]
    renditions: bool,

    /// Every authoring artifact kind.
    #[arg(short = 'A', long)]
    all_authoring: bool,
}

impl KindFlags {
    fn selected(&self) -> Vec<ArtifactKind> {
        if self.all_authoring {
            return PULL_ORDER.to_vec();
        }
        let mut kinds = Vec::new();
        if self.assets {
            kinds.push(ArtifactKind::Asset);
        }
        if self.content {
            kinds.push(ArtifactKind::Content);
        }
        if self.categories {
            kinds.push(ArtifactKind::Category);
        }
        if self.types {
            kinds.push(ArtifactKind::ContentType);
        }
        if self.presentations {
            kinds.push(ArtifactKind::Layout);
            kinds.push(ArtifactKind::LayoutMapping);
        }
        if self.publishing_sources {
            kinds.push(ArtifactKind::PublishingSource);
        }
        if self.renditions {
            kinds.push(ArtifactKind::Rendition);
        }
        if kinds.is_empty() {
            // No selection means everything, like --all-authoring.
            return PULL_ORDER.to_vec();
        }
        kinds
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let http = HttpConfig {
        user_agent: Some(format!("dxsync/{}", env!("CARGO_PKG_VERSION"))),
        basic_auth: match (cli.user, cli.password) {
            (Some(user), Some(password)) => Some((user, password)),
            (Some(user), None) => Some((user, String::new())),
            _ => None,
        },
        ..HttpConfig::default()
    };
    let context = SyncContext::open(&cli.url, &cli.dir, http, DriverConfig::default())
        .await
        .context("opening sync context")?;

    let code = match cli.command {
        Commands::Push(args) => {
            let report = context
                .all_switch()
                .push(&args.kinds.selected(), &transfer_options(&args))
                .await;
            finish_transfer(&context, &cli.dir, report, args.no_error_log).await?
        }
        Commands::Pull(args) => {
            let report = context
                .all_switch()
                .pull(&args.kinds.selected(), &transfer_options(&args))
                .await;
            finish_transfer(&context, &cli.dir, report, args.no_error_log).await?
        }
        Commands::List {
            kinds,
            modified,
            deleted,
            resources,
        } => {
            let opts = Options::default();
            if resources {
                let helper = context.helper(ArtifactKind::Asset);
                for id in helper.list_remote_resource_ids(&opts).await? {
                    println!("resource: {id}");
                }
                return Ok(ExitCode::SUCCESS);
            }
            for kind in kinds.selected() {
                let helper = context.helper(kind);
                let names = if deleted {
                    helper.list_remote_deleted_names(&opts).await?
                } else if modified {
                    helper.list_remote_modified_names(&opts).await?
                } else {
                    helper.list_remote_names(&opts).await?
                };
                for name in names {
                    println!("{}: {name}", kind.label());
                }
            }
            ExitCode::SUCCESS
        }
        Commands::Delete { kind, name } => {
            let kind = ArtifactKind::from_label(&kind)
                .with_context(|| format!("unknown artifact kind {kind:?}"))?;
            let helper = context.helper(kind);
            let opts = Options::default();
            let artifact = helper.resolve_remote(&name, &opts).await?;
            let message = helper.delete_remote(&artifact, &opts).await?;
            println!("{message}");
            context.flush().await?;
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}

fn transfer_options(args: &TransferArgs) -> Options {
    Options {
        ignore_timestamps: args.ignore_timestamps,
        force_override: args.force_override,
        create_only: args.create_only,
        publish_now: args.publish_now,
        no_error_log: args.no_error_log,
        ..Options::default()
    }
}

async fn finish_transfer(
    context: &SyncContext,
    dir: &std::path::Path,
    report: RunReport,
    no_error_log: bool,
) -> Result<ExitCode> {
    context.flush().await?;
    if !report.clean() && !no_error_log {
        match write_error_log(dir, &report) {
            Ok(log_path) => eprintln!("error details written to {}", log_path.display()),
            Err(err) => warn!(%err, "could not write the error log"),
        }
    }
    println!("{}", report.summary_line());
    Ok(if report.clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Per-item error details land in a timestamped file under the hidden
/// metadata directory; the console only carries the one-line summary.
fn write_error_log(dir: &std::path::Path, report: &RunReport) -> Result<PathBuf> {
    let logs_dir = dir.join(".metadata").join("logs");
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("creating {}", logs_dir.display()))?;
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let log_path = logs_dir.join(format!(
        "dxsync-{}-{stamp}.log",
        report.operation.past_tense()
    ));

    let mut lines = vec![report.summary_line()];
    for (kind, summary) in &report.per_kind {
        for failure in &summary.failed {
            lines.push(format!("{}: {}: {}", kind.label(), failure.path, failure.error));
        }
    }
    std::fs::write(&log_path, lines.join("\n"))
        .with_context(|| format!("writing {}", log_path.display()))?;
    Ok(log_path)
}
