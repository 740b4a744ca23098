//! Halldyll CLI entrypoint.
//!
//! This is the main entrypoint for the halldyll-infra command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use halldyll_infra::cli::{Cli, Commands, OutputFormatter, StateCommands};
use halldyll_infra::config::{
    ConfigParser, ConfigValidator, InfraConfig, StateBackend, find_config_file,
};
use halldyll_infra::engine::{Engine, EngineOptions};
use halldyll_infra::error::{HalldyllError, Result};
use halldyll_infra::graph::{GraphBuilder, ResourceGraph};
use halldyll_infra::planner::Plan;
use halldyll_infra::provider::{ProviderRegistry, connect_plugins};
use halldyll_infra::state::{
    LocalStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id, with_state_lock,
};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status of `plan --check` when changes are pending.
const EXIT_CHANGES: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Graph => cmd_graph(config_path, &formatter),
        Commands::Plan { check, detailed } => {
            cmd_plan(config_path, check, detailed, &formatter).await
        }
        Commands::Apply { yes, concurrency } => {
            cmd_apply(config_path, yes, concurrency, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, &formatter).await,
        Commands::Drift => cmd_drift(config_path, &formatter).await,
        Commands::Reconcile { yes } => cmd_reconcile(config_path, yes, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Validate configuration and the resource graph.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, config_file) = load_config(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let result = ConfigValidator::new().check(&config);
    emit(&formatter.format_validation(&result, show_warnings));
    if !result.is_valid() {
        return Ok(ExitCode::FAILURE);
    }

    let graph = GraphBuilder::new().build_from_config(&config.resources)?;

    if !formatter.is_json() {
        eprintln!("\nConfiguration summary:");
        eprintln!("  Project: {}", config.project.name);
        eprintln!("  Environment: {}", config.project.environment);
        eprintln!("  Providers: {}", config.providers.len());
        eprintln!("  Resources: {}", graph.len());
        eprintln!("  Dependencies: {}", graph.edges().len());
    }

    Ok(ExitCode::SUCCESS)
}

/// Print the resource graph.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config, _) = load_validated_config(config_path)?;
    let graph = GraphBuilder::new().build_from_config(&config.resources)?;
    emit(&formatter.format_graph(&graph));
    Ok(ExitCode::SUCCESS)
}

/// Show the execution plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    check: bool,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::open(config_path).await?;
    let engine = workspace.engine(None);
    let graph = engine.build_graph(&workspace.config.resources)?;

    let (engine, graph) = (&engine, &graph);
    let holder = generate_holder_id();
    let plan = with_state_lock(workspace.store.as_ref(), &holder, move |_| engine.plan(graph)).await?;

    emit(&formatter.format_plan(&plan, detailed));

    if check && plan.has_changes() {
        return Ok(ExitCode::from(EXIT_CHANGES));
    }
    Ok(ExitCode::SUCCESS)
}

/// Plan and apply changes.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::open(config_path).await?;
    let cancel = CancellationToken::new();
    let engine = workspace
        .engine(concurrency)
        .with_cancellation(cancel.clone());
    let graph = engine.build_graph(&workspace.config.resources)?;

    let (engine, graph) = (&engine, &graph);
    let holder = generate_holder_id();
    with_state_lock(workspace.store.as_ref(), &holder, move |lock| {
        debug!("Holding state lock {}", lock.lock_id);
        run_locked(
            engine,
            Some(graph),
            move |plan| prompt_approval(plan, auto_approve),
            move || cancel_on_ctrl_c(cancel),
            formatter,
        )
    })
    .await
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::open(config_path).await?;
    let cancel = CancellationToken::new();
    let engine = workspace.engine(None).with_cancellation(cancel.clone());

    let engine = &engine;
    let holder = generate_holder_id();
    with_state_lock(workspace.store.as_ref(), &holder, move |_| {
        run_locked(
            engine,
            None,
            move |plan| prompt_approval(plan, auto_approve),
            move || cancel_on_ctrl_c(cancel),
            formatter,
        )
    })
    .await
}

/// Plans against `graph` (or a full destroy when `None`), confirms, and applies.
///
/// `on_approved` runs only once the plan is confirmed, right before applying.
async fn run_locked(
    engine: &Engine<'_>,
    graph: Option<&ResourceGraph>,
    approve: impl FnOnce(&Plan) -> Result<bool>,
    on_approved: impl FnOnce(),
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let plan = match graph {
        Some(graph) => engine.plan(graph).await?,
        None => engine.plan_destroy().await?,
    };

    if !plan.has_changes() {
        emit(&formatter.format_plan(&plan, false));
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("{}", formatter.format_plan(&plan, false));
    if !approve(&plan)? {
        eprintln!("Cancelled.");
        return Ok(ExitCode::SUCCESS);
    }
    on_approved();

    let report = engine.apply(&plan).await?;
    emit(&formatter.format_apply(&report));

    match report.error() {
        Some(e) => Err(e.into()),
        None => Ok(ExitCode::SUCCESS),
    }
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let workspace = Workspace::open(config_path).await?;
    let report = workspace.engine(None).detect_drift().await?;
    emit(&formatter.format_drift(&report));
    Ok(ExitCode::SUCCESS)
}

/// Resolve stale write-ahead markers.
async fn cmd_reconcile(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::open(config_path).await?;
    let engine = workspace.engine(None);

    let engine = &engine;
    let holder = generate_holder_id();
    with_state_lock(workspace.store.as_ref(), &holder, move |_| {
        reconcile_locked(engine, auto_approve, formatter)
    })
    .await
}

async fn reconcile_locked(
    engine: &Engine<'_>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let state = engine.store().load().await?;
    if !state.markers.is_empty() && !auto_approve {
        eprintln!("Stale markers: {}", state.marker_addresses().join(", "));
        if !confirm("Ask providers what happened and update state? [y/N]: ", "y")? {
            eprintln!("Reconciliation cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let report = engine.reconcile_markers().await?;
    emit(&formatter.format_reconcile(&report));

    if report.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Err(HalldyllError::internal(
            "some markers could not be resolved; retry once providers are reachable",
        ))
    }
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, config_file) = load_validated_config(config_path)?;
    let store = open_store(&config, &config_file).await?;

    match command {
        StateCommands::Show => {
            let state = store.load().await?;
            emit(&formatter.format_state(&state));
        }
        StateCommands::List => {
            let state = store.load().await?;
            emit(&formatter.format_state_list(&state));
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            emit(&formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                match store.force_unlock().await? {
                    Some(lock) => {
                        warn!("Removed lock {} held by {}", lock.lock_id, lock.holder);
                        eprintln!("State forcefully unlocked.");
                    }
                    None => eprintln!("State is not locked."),
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Configuration, state store, and providers for one invocation.
struct Workspace {
    config: InfraConfig,
    store: Box<dyn StateStore>,
    registry: ProviderRegistry,
}

impl Workspace {
    /// Loads configuration, opens the state store, and connects plugins.
    async fn open(config_path: Option<&PathBuf>) -> Result<Self> {
        let (config, config_file) = load_validated_config(config_path)?;
        let store = open_store(&config, &config_file).await?;
        let registry = connect_plugins(&config.providers).await?;
        debug!(
            "Connected {} provider(s) serving {} resource type(s)",
            config.providers.len(),
            registry.len()
        );

        Ok(Self {
            config,
            store,
            registry,
        })
    }

    fn engine(&self, concurrency: Option<usize>) -> Engine<'_> {
        let mut options = EngineOptions::from_config(&self.config.engine);
        if let Some(concurrency) = concurrency {
            options.concurrency = concurrency;
        }
        Engine::new(self.store.as_ref(), &self.registry).with_options(options)
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads configuration with `.env` and `HALLDYLL_*` overrides applied.
fn load_config(config_path: Option<&PathBuf>) -> Result<(InfraConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, config_file))
}

/// Loads configuration and fails on the first validation error.
fn load_validated_config(config_path: Option<&PathBuf>) -> Result<(InfraConfig, PathBuf)> {
    let (config, config_file) = load_config(config_path)?;
    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    Ok((config, config_file))
}

/// Creates the state store selected by configuration.
async fn open_store(config: &InfraConfig, config_file: &Path) -> Result<Box<dyn StateStore>> {
    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config.state.path.as_ref().map_or_else(
                || config_dir(config_file).join(STATE_DIR),
                PathBuf::from,
            );
            Box::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| HalldyllError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };

    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

fn config_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight steps");
            token.cancel();
        }
    });
}

/// Asks for confirmation unless `auto_approve` is set; destroys need the word.
fn prompt_approval(plan: &Plan, auto_approve: bool) -> Result<bool> {
    if auto_approve {
        return Ok(true);
    }
    if plan.destroy {
        confirm(
            "This action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )
    } else {
        confirm("Do you want to apply this plan? [y/N]: ", "y")
    }
}

/// Prompts on stderr and reads one line from stdin.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes command output to stdout.
fn emit(output: &str) {
    if output.ends_with('\n') {
        print!("{output}");
    } else {
        println!("{output}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halldyll_infra::cli::OutputFormat;
    use halldyll_infra::config::{LifecycleConfig, ResourceConfig};
    use halldyll_infra::provider::{MemoryProvider, Provider, ResourceSchema};
    use serde_json::json;
    use std::cell::Cell;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_interrupt_handler_armed_only_after_approval() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp.path());
        let vpc = Arc::new(MemoryProvider::new(ResourceSchema::new("aws_vpc")));
        let registry = ProviderRegistry::new().with(Arc::clone(&vpc) as Arc<dyn Provider>);
        let engine = Engine::new(&store, &registry);
        let formatter = OutputFormatter::new(OutputFormat::Json);

        let configs = vec![ResourceConfig {
            resource_type: String::from("aws_vpc"),
            name: String::from("main"),
            attributes: serde_json::from_value(json!({"cidr_block": "10.0.0.0/16"})).unwrap(),
            depends_on: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }];
        let graph = engine.build_graph(&configs).unwrap();

        let armed = Cell::new(false);
        run_locked(&engine, Some(&graph), |_| Ok(false), || armed.set(true), &formatter)
            .await
            .unwrap();
        assert!(!armed.get());
        assert!(vpc.object_ids().is_empty());

        run_locked(&engine, Some(&graph), |_| Ok(true), || armed.set(true), &formatter)
            .await
            .unwrap();
        assert!(armed.get());
        assert_eq!(vpc.object_ids().len(), 1);
    }
}
