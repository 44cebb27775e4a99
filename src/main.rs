use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::instrument::WithSubscriber;
use tracing::{info, warn};

use repofleet::git::GitCli;
use repofleet::masking::{init_logging, SecretMasker};
use repofleet::report::EXIT_CANCELLED;
use repofleet::{
    CancelSignal, Config, Credentials, Provider, ProviderKind, Reporter, RepositoryProvider,
    Session, SyncEngine, SyncError, UpdateMode,
};

#[derive(Parser)]
#[command(name = "repofleet")]
#[command(about = "Mirror every repository of a project from Azure DevOps, GitHub or BitBucket")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone or update every repository of a project
    Sync {
        /// Project identifier (org/project, organization or workspace)
        project: String,

        /// Destination directory (overrides destination_root)
        #[arg(short, long)]
        dest: Option<String>,

        /// Maximum repositories processed at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Update mode for existing copies: skip, pull or force
        #[arg(short, long)]
        mode: Option<UpdateMode>,

        /// Provider: azure-devops, github or bitbucket
        #[arg(short, long)]
        provider: Option<ProviderKind>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the repositories of a project without touching the disk
    List {
        /// Project identifier (org/project, organization or workspace)
        project: String,

        /// Provider: azure-devops, github or bitbucket
        #[arg(short, long)]
        provider: Option<ProviderKind>,
    },
}

/// Provider plus authenticated session for one run
struct Connection {
    provider: Arc<Provider>,
    session: Session,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config)?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Sync {
            project,
            dest,
            concurrency,
            mode,
            provider,
            json,
        } => {
            let options = SyncOptions {
                project,
                dest,
                concurrency,
                mode,
                provider,
                json,
            };
            let code = cmd_sync(options, cli.verbose, &config).await?;
            std::process::exit(code);
        }
        Commands::List { project, provider } => {
            cmd_list(project, provider, cli.verbose, &config).await
        }
    }
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Masker for this run: built-in shapes, configured patterns and the active secrets
fn build_masker(config: &Config, credentials: &Credentials) -> Result<Arc<SecretMasker>> {
    let masker = credentials
        .secrets()
        .into_iter()
        .fold(SecretMasker::new(), |masker, secret| masker.with_secret(secret))
        .with_patterns(&config.logging.mask_patterns)
        .context("Invalid logging.mask_patterns entry")?;
    Ok(Arc::new(masker))
}

/// Resolve credentials for the selected provider
///
/// `base_url` and the env var names from the config apply only to the
/// configured provider, not to one picked on the command line.
fn resolve_provider(
    kind_override: Option<ProviderKind>,
    config: &Config,
) -> Result<(ProviderKind, Option<String>, Credentials)> {
    let kind = kind_override.unwrap_or(config.provider.kind);
    let configured = kind == config.provider.kind;

    let credentials = Credentials::from_env(
        kind,
        config.provider.token_env.as_deref().filter(|_| configured),
        config.provider.username_env.as_deref().filter(|_| configured),
    )?;
    let base_url = config.provider.base_url.clone().filter(|_| configured);

    Ok((kind, base_url, credentials))
}

async fn connect(
    kind: ProviderKind,
    base_url: Option<String>,
    credentials: Credentials,
) -> Result<Connection, SyncError> {
    let provider = Arc::new(Provider::new(kind, base_url)?);
    let session = provider.authenticate(credentials).await?;

    match session.account() {
        Some(account) => info!("Authenticated with {} as {}", kind, account),
        None => info!("Authenticated with {}", kind),
    }

    Ok(Connection { provider, session })
}

/// Mask a library error before it leaves the process
fn masked(masker: &SecretMasker, err: SyncError) -> anyhow::Error {
    anyhow::anyhow!("{} ({})", masker.mask(&err.to_string()), err.kind())
}

struct SyncOptions {
    project: String,
    dest: Option<String>,
    concurrency: Option<usize>,
    mode: Option<UpdateMode>,
    provider: Option<ProviderKind>,
    json: bool,
}

/// Synchronize a project and return the process exit status
async fn cmd_sync(options: SyncOptions, verbose: bool, config: &Config) -> Result<i32> {
    let (kind, base_url, credentials) = resolve_provider(options.provider, config)?;
    let masker = build_masker(config, &credentials)?;
    let _guard = init_logging(masker.clone(), verbose, &config.logging.level);

    info!("Starting repofleet v{}", env!("CARGO_PKG_VERSION"));

    let destination_root = match options.dest {
        Some(dest) => PathBuf::from(
            shellexpand::full(&dest)
                .context("Failed to expand destination path")?
                .into_owned(),
        ),
        None => config.destination_path(),
    };
    let concurrency = config.sync.effective_concurrency(options.concurrency);
    let mode = options.mode.unwrap_or(config.sync.update_mode);

    let connection = connect(kind, base_url, credentials)
        .await
        .map_err(|e| masked(&masker, e))?;

    let cancel = CancelSignal::new();
    let signal = cancel.clone();
    tokio::spawn(
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; letting running repositories finish");
                signal.cancel();
            }
        }
        .with_current_subscriber(),
    );

    if !options.json {
        println!(
            "🔄 Synchronizing {} from {} into {}",
            options.project,
            kind,
            destination_root.display()
        );
        println!("   Mode: {}, concurrency: {}", mode, concurrency);
    }

    let engine = SyncEngine::new(
        connection.provider.clone(),
        Arc::new(GitCli::new(config.sync.operation_timeout(), masker.clone())),
        masker.clone(),
        config.retry.policy(),
    );

    let summary = match engine
        .sync_project(
            &options.project,
            &destination_root,
            concurrency,
            mode,
            &connection.session,
            &cancel,
        )
        .await
    {
        Ok(summary) => summary,
        Err(SyncError::Cancelled) => {
            eprintln!("⏹️  Cancelled before any repository was processed");
            return Ok(EXIT_CANCELLED);
        }
        Err(e) => return Err(masked(&masker, e)),
    };

    let reporter = Reporter::new(masker.clone());
    if options.json {
        println!(
            "{}",
            reporter
                .render_json(&summary)
                .context("Failed to serialize summary")?
        );
    } else {
        println!();
        print!("{}", reporter.render_text(&summary));
        if summary.conflicts > 0 {
            println!(
                "\n💡 Tip: commit or stash local changes, or use --mode force to replace them"
            );
        }
    }

    Ok(summary.exit_code())
}

/// List the repositories of a project
async fn cmd_list(
    project: String,
    provider: Option<ProviderKind>,
    verbose: bool,
    config: &Config,
) -> Result<()> {
    let (kind, base_url, credentials) = resolve_provider(provider, config)?;
    let masker = build_masker(config, &credentials)?;
    let _guard = init_logging(masker.clone(), verbose, &config.logging.level);

    let connection = connect(kind, base_url, credentials)
        .await
        .map_err(|e| masked(&masker, e))?;

    let repositories: Vec<_> = connection
        .provider
        .list_repositories(&project, &connection.session)
        .try_collect()
        .await
        .map_err(|e| masked(&masker, e))?;

    println!("Repositories ({}): ", repositories.len());
    for repo in &repositories {
        println!("  📁 {}", repo.name);
        if verbose {
            println!("     🔗 {}", masker.mask(&repo.clone_url));
            if let Some(branch) = &repo.default_branch {
                println!("     🌿 {}", branch);
            }
        }
    }

    Ok(())
}
