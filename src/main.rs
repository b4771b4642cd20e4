use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowgate_core::config::AppConfig;
use flowgate_core::event::EventBus;
use flowgate_core::traits::FlowStore;
use flowgate_core::PlanContext;
use flowgate_engine::{
    cache_key, FlowExecutor, FlowPlanner, FlowSessions, Outcome, PlanCache, CACHE_PREFIX,
};
use flowgate_policy::PolicyEngine;
use flowgate_stages::StageRegistry;
use flowgate_store::{Blueprint, SqliteExecutionStore, SqliteFlowStore};

#[derive(Parser)]
#[command(name = "flowgate", version, about = "Policy-driven authentication flow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowgate.toml", env = "FLOWGATE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import flows, stages, policies and users from a TOML blueprint
    Import {
        /// Blueprint file
        blueprint: PathBuf,
    },
    /// List stored flows
    Flows,
    /// List available stage kinds
    Stages,
    /// Build and print the plan for a flow
    Plan {
        /// Flow slug
        slug: String,
        #[command(flatten)]
        request: RequestArgs,
        /// Bypass the plan cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Walk through a flow interactively
    Run {
        /// Flow slug
        slug: String,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Show the plan cache key of each flow for a request and check that a
    /// second lookup is served from the cache. The cache lives in memory, so
    /// this only reflects the current process.
    Cache {
        /// Only this flow
        #[arg(long)]
        flow: Option<String>,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Show current configuration
    Config,
}

#[derive(clap::Args)]
struct RequestArgs {
    /// Pending user for the request context
    #[arg(long)]
    user: Option<String>,
    /// Application the flow is entered for
    #[arg(long)]
    app: Option<String>,
    /// Client address
    #[arg(long)]
    ip: Option<String>,
    /// Extra context attribute as key=value
    #[arg(long = "attr", value_name = "KEY=VALUE")]
    attributes: Vec<String>,
}

impl RequestArgs {
    fn to_context(&self) -> anyhow::Result<PlanContext> {
        let mut ctx = PlanContext::new();
        if let Some(ref user) = self.user {
            ctx = ctx.with_user(user);
        }
        if let Some(ref app) = self.app {
            ctx = ctx.with_application(app);
        }
        if let Some(ref ip) = self.ip {
            ctx = ctx.with_source_ip(ip);
        }
        for pair in &self.attributes {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("attribute '{}' is not KEY=VALUE", pair))?;
            ctx = ctx.with_attribute(key.trim(), parse_input(value));
        }
        Ok(ctx)
    }
}

/// Objects, arrays and booleans are read as JSON; anything else is kept as
/// text so codes like `012345` survive.
fn parse_input(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    let looks_structured = trimmed.starts_with('{')
        || trimmed.starts_with('[')
        || trimmed == "true"
        || trimmed == "false";
    if looks_structured {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    serde_json::Value::String(raw.to_string())
}

/// Everything a command needs, wired from config.
struct Engine {
    flows: Arc<SqliteFlowStore>,
    planner: Arc<FlowPlanner>,
    sessions: FlowSessions,
}

fn build_engine(config: &AppConfig) -> anyhow::Result<Engine> {
    let db_path = config.database_path();
    let flows = Arc::new(SqliteFlowStore::open(&db_path)?);
    let executions = Arc::new(SqliteExecutionStore::open(&db_path)?);

    let registry = Arc::new(StageRegistry::with_builtins(flows.clone()));
    let cache = Arc::new(PlanCache::new(std::time::Duration::from_secs(
        config.engine.cache_ttl_secs,
    )));
    let event_bus = Arc::new(EventBus::default());
    let planner = Arc::new(
        FlowPlanner::new(
            flows.clone(),
            registry,
            Arc::new(PolicyEngine::new()),
            cache,
            event_bus,
        )
        .with_config(&config.engine),
    );
    let executor = Arc::new(FlowExecutor::new(planner.clone(), &config.engine));
    let sessions = FlowSessions::new(executor, executions);

    Ok(Engine {
        flows,
        planner,
        sessions,
    })
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    eprintln!(
        "Warning: {} not found, using defaults.",
        path.display()
    );
    Ok(AppConfig::default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let default_filter = config.log_filter().unwrap_or("flowgate=info,warn").to_string();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Import { blueprint } => {
            let engine = build_engine(&config)?;
            let summary = Blueprint::load(&blueprint)?.apply(engine.flows.as_ref())?;
            for (slug, version) in &summary.flows {
                println!("flow {} (version {})", slug, version);
            }
            println!(
                "Imported {} flow(s), {} binding(s), {} user(s).",
                summary.flows.len(),
                summary.bindings,
                summary.users
            );
        }
        Commands::Flows => {
            let engine = build_engine(&config)?;
            let flows = engine.flows.flows().await?;
            if flows.is_empty() {
                println!("No flows. Import a blueprint first.");
            }
            for flow in flows {
                let bindings = engine.flows.bindings(&flow.slug).await?;
                println!(
                    "{:<24} {:<20} v{:<4} {} stage(s)  {}",
                    flow.slug,
                    flow.designation.to_string(),
                    flow.version,
                    bindings.len(),
                    flow.title
                );
            }
        }
        Commands::Stages => {
            let engine = build_engine(&config)?;
            for info in engine.planner.registry().list() {
                println!(
                    "{:<24} {:<28} {}",
                    info.identifier, info.type_name, info.verbose_name
                );
            }
        }
        Commands::Plan {
            slug,
            request,
            no_cache,
        } => {
            let engine = build_engine(&config)?;
            let ctx = request.to_context()?;
            let plan = if no_cache {
                engine.planner.plan_uncached(&slug, &ctx).await?
            } else {
                engine.planner.plan(&slug, &ctx).await?
            };
            let stages: Vec<serde_json::Value> = plan
                .entries
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "name": e.stage().name,
                        "kind": e.stage().kind,
                        "order": e.binding.order,
                        "re_evaluate_policies": e.re_evaluate(),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "flow": plan.flow_slug,
                    "version": plan.flow_version,
                    "cache_key": plan.cache_key,
                    "stages": stages,
                }))?
            );
        }
        Commands::Cache { flow, request } => {
            let engine = build_engine(&config)?;
            let ctx = request.to_context()?;
            let slugs: Vec<String> = match flow {
                Some(slug) => vec![slug],
                None => engine
                    .flows
                    .flows()
                    .await?
                    .into_iter()
                    .map(|f| f.slug)
                    .collect(),
            };
            println!("{:<24} {:<6} KEY", "FLOW", "REUSED");
            for slug in &slugs {
                let (key, reused) = check_cache_reuse(&engine.planner, slug, &ctx).await;
                let reused = reused.map(|r| r.to_string()).unwrap_or_else(|| "-".into());
                println!("{:<24} {:<6} {}", slug, reused, key);
            }
            println!(
                "{} plan(s) cached in this process",
                engine.planner.cache().count(CACHE_PREFIX).await
            );
        }
        Commands::Run { slug, request } => {
            let engine = build_engine(&config)?;
            run_interactive(&engine, &slug, request.to_context()?).await?;
        }
    }

    Ok(())
}

/// Plan `slug` twice for `ctx`. Returns the cache key and whether the second
/// lookup returned the same plan, or `None` when the flow cannot be planned.
async fn check_cache_reuse(planner: &FlowPlanner, slug: &str, ctx: &PlanContext) -> (String, Option<bool>) {
    let key = cache_key(slug, ctx);
    let first = match planner.plan(slug, ctx).await {
        Ok(plan) => plan,
        Err(e) => {
            warn!(flow = %slug, error = %e, "Planning failed");
            return (key, None);
        }
    };
    let reused = match planner.plan(slug, ctx).await {
        Ok(second) => Arc::ptr_eq(&first, &second),
        Err(_) => false,
    };
    (key, Some(reused))
}

async fn run_interactive(engine: &Engine, slug: &str, ctx: PlanContext) -> anyhow::Result<()> {
    let (session, mut outcome) = engine.sessions.begin(slug, ctx).await?;
    info!(session = %session, flow = %slug, "Session started");
    println!("Session: {}", session);
    println!("Enter JSON or plain text for each stage, /abort to stop.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        if outcome.is_terminal() {
            break;
        }

        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF
            engine.sessions.abort(&session).await?;
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);

        outcome = match line {
            "/abort" => engine.sessions.abort(&session).await?,
            "/current" => engine.sessions.current(&session).await?,
            _ => engine.sessions.submit(&session, parse_input(line)).await?,
        };
    }

    if let Outcome::Completed { .. } = outcome {
        println!("Flow '{}' completed.", slug);
    }
    Ok(())
}
