use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use netaudit::audit::{diff_sync, SyncOptions};
use netaudit::config::Config;
use netaudit::observability::logging::init_logging;
use netaudit::reconcile::Actions;
use netaudit::registry::Registry;
use netaudit::report::ReportSection;

#[derive(Parser)]
#[command(name = "netaudit")]
#[command(about = "Audit and sync network inventories between sources of record")]
#[command(version)]
struct Cli {
    /// Config file path; falls back to NETAUDIT_CONFIG, then netaudit.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Selection {
    /// Origin source name (the system of truth)
    #[arg(long)]
    origin: String,

    /// Target source name (the system to reconcile)
    #[arg(long)]
    target: String,

    /// Collection name
    #[arg(long)]
    collection: String,

    /// Registered filter policy name
    #[arg(long, default_value = "default")]
    filter_name: String,

    /// Provider-specific fetch filter for the origin source
    #[arg(long)]
    origin_filter: Option<String>,

    /// Provider-specific fetch filter for the target source
    #[arg(long)]
    target_filter: Option<String>,

    /// Comma-separated comparison field override
    #[arg(long, value_delimiter = ',')]
    fields: Vec<String>,

    /// Diff report sections to print (all, add, del, upd)
    #[arg(long = "diff-report")]
    diff_report: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch both collections, diff them, and report
    Audit {
        #[command(flatten)]
        selection: Selection,
    },
    /// Audit, then apply the selected diff buckets to the target
    Sync {
        #[command(flatten)]
        selection: Selection,

        /// Reconcile actions to apply (all, add, del, upd)
        #[arg(long = "apply")]
        apply: Vec<String>,

        /// Report what would change without applying anything
        #[arg(long)]
        dry_run: bool,

        /// Concurrent per-item request ceiling
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    dotenv::dotenv().ok();
    init_logging();

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    info!(config = %config_path.display(), "configuration loaded");

    let registry = Registry::with_builtin();

    match cli.command {
        Commands::Audit { selection } => {
            run(&registry, &config, selection, Actions::default(), true, None).await
        }
        Commands::Sync {
            selection,
            apply,
            dry_run,
            limit,
        } => {
            let actions = parse_actions(&apply)?;
            run(&registry, &config, selection, actions, dry_run, limit).await
        }
    }
}

async fn run(
    registry: &Registry,
    config: &Config,
    selection: Selection,
    actions: Actions,
    dry_run: bool,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    // resolve every name up front so lookup failures happen before any
    // network traffic
    let origin = registry
        .get_collection(config, &selection.origin, &selection.collection)
        .context("resolving origin collection")?;
    let target = registry
        .get_collection(config, &selection.target, &selection.collection)
        .context("resolving target collection")?;
    let mut filter = registry
        .get_filter(
            config,
            &selection.filter_name,
            &selection.origin,
            &selection.target,
            &selection.collection,
        )
        .context("resolving filter policy")?;
    let policy = registry
        .get_reconciler(
            "default",
            &selection.origin,
            &selection.target,
            &selection.collection,
        )
        .context("resolving reconcile policy")?;

    // command-line overrides win over the filter policy
    if !selection.fields.is_empty() {
        filter.fields = Some(selection.fields.clone());
    }
    if selection.origin_filter.is_some() {
        filter.origin_fetch = selection.origin_filter.clone();
    }
    if selection.target_filter.is_some() {
        filter.target_fetch = selection.target_filter.clone();
    }

    let diff_report = selection
        .diff_report
        .iter()
        .map(|section| section.parse::<ReportSection>())
        .collect::<Result<Vec<_>, _>>()?;

    let options = SyncOptions {
        actions,
        dry_run,
        limit,
        diff_report,
    };

    let (diff_res, apply) = diff_sync(origin, target, filter, policy, options).await?;

    if let Some(apply) = apply {
        info!(
            applied = apply.applied,
            failed = apply.failed(),
            "sync complete"
        );
    } else {
        info!(diffs = diff_res.count, "audit complete");
    }

    Ok(())
}

fn parse_actions(flags: &[String]) -> anyhow::Result<Actions> {
    let mut actions = Actions::default();
    for flag in flags {
        match flag.as_str() {
            "all" => actions = Actions::all(),
            "add" => actions.add = true,
            "del" => actions.del = true,
            "upd" => actions.upd = true,
            other => anyhow::bail!("unknown reconcile action: {other}"),
        }
    }
    Ok(actions)
}
