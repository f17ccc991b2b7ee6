//! Binary entry point for the dyncore CLI and sandbox worker.
#![forbid(unsafe_code)]

mod ui;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use dyncore::catalog::{SchemaCatalog, StaticCatalog};
use dyncore::config::{Config, Isolation};
use dyncore::executor::{
    runner, ExecutionRequest, HandlerExecutor, HostCapabilities, ProcessSpawner, ScriptContext,
    ThreadSpawner, WorkerPool, WorkerSpawner,
};
use dyncore::query::errors::CompileErrorWithCode;
use dyncore::query::{compile_find, CompileOptions, FindRequest, PathPolicy, Statement};
use dyncore::repository::{RepositoryRegistry, ScopedCache};
use dyncore::store::SqliteStore;
use serde_json::{json, Value as Json};
use tracing_subscriber::EnvFilter;

use ui::Ui;

#[derive(Parser, Debug)]
#[command(
    name = "dyncore",
    version,
    about = "Query compiler and sandboxed handler runtime",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, env = "DYNCORE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for explain"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the sandbox worker protocol on stdin/stdout.
    Worker,
    /// Compile a find request and print its statements.
    Explain {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Compile and execute a find request.
    Find {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Run a handler script against the configured database.
    Run {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long, value_name = "FILE", help = "Rhai script to run")]
        script: PathBuf,
        #[arg(long, value_name = "JSON", help = "Request body exposed as `body`")]
        body: Option<String>,
        #[arg(long, value_name = "JSON", help = "Route params exposed as `params`")]
        params: Option<String>,
        #[arg(long, help = "Table `repos.main` resolves to")]
        table: Option<String>,
        #[arg(long, help = "Override the configured timeout")]
        timeout_ms: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct SourceArgs {
    #[arg(long, value_name = "FILE", help = "Schema catalog JSON")]
    catalog: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "SQLite database")]
    db: Option<PathBuf>,

    #[arg(long, help = "Reject unresolvable paths instead of dropping them")]
    strict: bool,
}

#[derive(Args, Debug)]
struct QueryArgs {
    #[arg(long, help = "Root table")]
    table: String,

    #[arg(long, value_name = "JSON")]
    filter: Option<String>,

    #[arg(long, value_name = "a,b.c,d.*")]
    fields: Option<String>,

    #[arg(long, value_name = "a,-b", allow_hyphen_values = true)]
    sort: Option<String>,

    #[arg(long)]
    page: Option<u64>,

    #[arg(long)]
    limit: Option<u64>,

    #[arg(long, value_name = "totalCount|filterCount|*")]
    meta: Option<String>,

    #[arg(long, value_name = "JSON")]
    aggregate: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // stdout carries the worker protocol; logs always go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    if let Command::Worker = cli.command {
        tokio::task::spawn_blocking(runner::serve_stdio).await??;
        return Ok(());
    }
    let config = Config::load(cli.config.clone())?;

    match cli.command {
        Command::Worker => {}
        Command::Explain { source, query } => {
            let catalog = load_catalog(&source, &config)?;
            let request = build_request(&query)?;
            let plan = compile_find(&catalog, &query.table, &request, &compile_options(&source, &config))
                .map_err(|err| CompileErrorWithCode(&err).to_string())?;
            match cli.format {
                OutputFormat::Json => {
                    let statements: serde_json::Map<String, Json> = plan
                        .statements()
                        .into_iter()
                        .map(|(label, stmt)| (label.to_string(), statement_json(stmt)))
                        .collect();
                    let deferred: Vec<String> =
                        plan.projection.deferred.iter().map(|link| link.path()).collect();
                    let out = json!({
                        "table": plan.table,
                        "window": {"limit": plan.window.limit, "skip": plan.window.skip},
                        "statements": statements,
                        "deferred": deferred,
                        "skipped": plan.skipped,
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Text => {
                    let ui = Ui::new(false);
                    for (label, stmt) in plan.statements() {
                        ui.heading(label, &format!("[{}]", stmt.fingerprint_hex()));
                        ui.row("sql", &stmt.sql);
                        ui.row("params", &statement_json(stmt)["params"].to_string());
                    }
                    for link in &plan.projection.deferred {
                        ui.row("deferred", &link.path());
                    }
                    for path in &plan.skipped {
                        ui.row("skipped", path);
                    }
                }
            }
        }
        Command::Find { source, query } => {
            let registry = build_registry(&source, &config)?;
            let request = build_request(&query)?;
            let result = registry.repository(&query.table)?.find(&request)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Run {
            source,
            script,
            body,
            params,
            table,
            timeout_ms,
        } => {
            let registry = build_registry(&source, &config)?;
            let spawner: Arc<dyn WorkerSpawner> = match config.executor.isolation {
                Isolation::Thread => Arc::new(ThreadSpawner),
                Isolation::Process => Arc::new(match &config.executor.worker_program {
                    Some(program) => ProcessSpawner::new(program),
                    None => ProcessSpawner::current_exe()?,
                }),
            };
            let pool = WorkerPool::new(spawner, config.executor.pool_options());
            pool.prewarm().await?;
            let executor = HandlerExecutor::new(
                pool,
                Arc::new(HostCapabilities::new(registry)),
                config.executor.executor_options(),
            );
            let context = ScriptContext {
                body: parse_json(body.as_deref())?,
                params: parse_json(params.as_deref())?,
                main_table: table,
                ..ScriptContext::default()
            };
            let mut request = ExecutionRequest::new(std::fs::read_to_string(&script)?).with_context(context);
            if let Some(ms) = timeout_ms {
                request = request.with_timeout(Duration::from_millis(ms));
            }
            let outcome = executor.run(request).await;
            executor.shutdown();
            match outcome {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(err) => {
                    return Err(format!("{} ({}): {err}", err.code(), err.status_code()).into())
                }
            }
        }
    }
    Ok(())
}

fn compile_options(source: &SourceArgs, config: &Config) -> CompileOptions {
    let mut options = config.query.compile_options();
    if source.strict {
        options.path_policy = PathPolicy::Strict;
    }
    options
}

fn load_catalog(source: &SourceArgs, config: &Config) -> Result<SchemaCatalog, Box<dyn Error>> {
    let path = source
        .catalog
        .as_ref()
        .or(config.database.catalog.as_ref())
        .ok_or("no catalog given; pass --catalog or set database.catalog")?;
    Ok(SchemaCatalog::load(path)?)
}

fn open_store(source: &SourceArgs, config: &Config) -> Result<SqliteStore, Box<dyn Error>> {
    let path: &Path = source
        .db
        .as_deref()
        .or(config.database.path.as_deref())
        .ok_or("no database given; pass --db or set database.path")?;
    Ok(SqliteStore::open(path)?)
}

fn build_registry(source: &SourceArgs, config: &Config) -> Result<RepositoryRegistry, Box<dyn Error>> {
    let catalog = load_catalog(source, config)?;
    let store = open_store(source, config)?;
    Ok(
        RepositoryRegistry::new(Arc::new(StaticCatalog::new(catalog)), Arc::new(store))
            .with_cache(Arc::new(ScopedCache::default()))
            .with_options(compile_options(source, config)),
    )
}

fn build_request(query: &QueryArgs) -> Result<FindRequest, Box<dyn Error>> {
    let mut request = FindRequest::new()
        .with_filter(parse_json(query.filter.as_deref())?)
        .with_aggregate(parse_json(query.aggregate.as_deref())?);
    if let Some(fields) = &query.fields {
        request = request.with_fields(fields.as_str());
    }
    if let Some(sort) = &query.sort {
        request = request.with_sort(sort.as_str());
    }
    if let Some(page) = query.page {
        request = request.with_page(page);
    }
    if let Some(limit) = query.limit {
        request = request.with_limit(limit);
    }
    if let Some(meta) = &query.meta {
        request = request.with_meta(meta.as_str());
    }
    Ok(request)
}

fn parse_json(text: Option<&str>) -> Result<Json, Box<dyn Error>> {
    match text {
        Some(text) => Ok(serde_json::from_str(text)?),
        None => Ok(Json::Null),
    }
}

fn statement_json(stmt: &Statement) -> Json {
    json!({
        "sql": stmt.sql,
        "params": stmt.params.iter().map(|p| p.to_json(None)).collect::<Vec<_>>(),
        "fingerprint": stmt.fingerprint_hex(),
    })
}
