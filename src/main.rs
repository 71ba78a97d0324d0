//!
//! permsql CLI
//! -----------
//! One-shot permission checks against a catalog database and a permissions file.
//! Prints JSON so results can be piped into other tools.

use std::env;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use permsql::config::{load_config_file, ConfigFile};
use permsql::{Actor, Catalog, EngineBuilder, PageRequest, Resource};

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} --catalog <db> --action <name> [--actor <json>] [--parent <p>] [--child <c>] [--config <file>]\n  {program} --catalog <db> --action <name> --list [--parent <p>] [--limit <n>] [--cursor <token>] [--reasons] [--private]\n  {program} --catalog <db> --action <name> --visibility [--parent <p>] [--child <c>]\n  {program} --catalog <db> --action <name> --explain [--parent <p>]\n\nFlags:\n  --catalog <path>   SQLite catalog (created if missing; default: in-memory)\n  --config <path>    JSON file with {{\"settings\": {{...}}, \"permissions\": {{...}}}}\n  --actor <json>     Actor attributes, e.g. '{{\"id\": \"alice\"}}'; omitted = anonymous\n  --action <name>    Action name or abbreviation\n  --parent/--child   Resource address\n  --list             List allowed resources (paged)\n  --visibility       Report visible/private for the resource\n  --explain          Print the composed query instead of running it\n  -h, --help         Show this help\n\nEnvironment:\n  PERMSQL_DEFAULT_DENY, PERMSQL_DEFAULT_ALLOW_SQL, PERMSQL_ROOT_ENABLED, PERMSQL_TIMEOUT_MS, PERMSQL_PAGE_SIZE"
    );
}

#[derive(Debug, Default)]
struct Args {
    catalog: Option<String>,
    config: Option<String>,
    actor: Option<String>,
    action: Option<String>,
    parent: Option<String>,
    child: Option<String>,
    limit: Option<u32>,
    cursor: Option<String>,
    list: bool,
    visibility: bool,
    explain: bool,
    reasons: bool,
    private: bool,
}

fn parse_args(program: &str, args: &[String]) -> Result<Args> {
    let mut out = Args::default();
    let mut i = 0;
    let value = |i: usize, flag: &str| -> Result<String> {
        args.get(i + 1).cloned().ok_or_else(|| anyhow!("{} requires a value", flag))
    };
    while i < args.len() {
        match args[i].as_str() {
            "--catalog" => { out.catalog = Some(value(i, "--catalog")?); i += 2; continue; }
            "--config" => { out.config = Some(value(i, "--config")?); i += 2; continue; }
            "--actor" => { out.actor = Some(value(i, "--actor")?); i += 2; continue; }
            "--action" => { out.action = Some(value(i, "--action")?); i += 2; continue; }
            "--parent" => { out.parent = Some(value(i, "--parent")?); i += 2; continue; }
            "--child" => { out.child = Some(value(i, "--child")?); i += 2; continue; }
            "--cursor" => { out.cursor = Some(value(i, "--cursor")?); i += 2; continue; }
            "--limit" => {
                let v = value(i, "--limit")?;
                out.limit = Some(v.parse().with_context(|| format!("--limit expects a number, got '{}'", v))?);
                i += 2; continue;
            }
            "--list" => out.list = true,
            "--visibility" => out.visibility = true,
            "--explain" => out.explain = true,
            "--reasons" => out.reasons = true,
            "--private" => out.private = true,
            "-h" | "--help" => { print_usage(program); std::process::exit(0); }
            other => return Err(anyhow!("unknown argument: {}", other)),
        }
        i += 1;
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut argv: Vec<String> = env::args().collect();
    let program = argv.remove(0);
    let args = match parse_args(&program, &argv) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}", e);
            print_usage(&program);
            std::process::exit(2);
        }
    };
    let Some(action) = args.action.clone() else {
        print_usage(&program);
        std::process::exit(2);
    };

    let file = match &args.config {
        Some(path) => load_config_file(path).with_context(|| format!("loading {}", path))?,
        None => {
            let mut f = ConfigFile::default();
            f.settings = f.settings.with_env_overrides();
            f.settings.validate()?;
            f
        }
    };
    let catalog = match &args.catalog {
        Some(path) => Catalog::open(path).with_context(|| format!("opening catalog {}", path))?,
        None => Catalog::in_memory()?,
    };
    info!(
        target: "permsql",
        "permsql starting: catalog='{}', config='{}', action='{}'",
        args.catalog.as_deref().unwrap_or("<memory>"),
        args.config.as_deref().unwrap_or("<none>"),
        action
    );

    let engine = EngineBuilder::new(Arc::new(catalog), file.settings.clone())
        .with_core_models()
        .with_core_actions()
        .with_default_sources(file.permissions.clone())
        .build()?;

    let actor = match &args.actor {
        Some(text) => {
            let v: serde_json::Value = serde_json::from_str(text).context("--actor must be JSON")?;
            Some(Actor::from_json(v).ok_or_else(|| anyhow!("--actor must be a JSON object"))?)
        }
        None => None,
    };
    let resource = Resource::new(args.parent.clone(), args.child.clone())
        .ok_or_else(|| anyhow!("--child requires --parent"))?;

    let out = if args.explain {
        serde_json::to_value(engine.explain(actor.as_ref(), &action, args.parent.as_deref()).await?)?
    } else if args.list {
        let mut req = PageRequest::new();
        req.parent = args.parent.clone();
        req.limit = args.limit;
        req.cursor = args.cursor.clone();
        req.include_reasons = args.reasons;
        req.include_is_private = args.private;
        serde_json::to_value(engine.allowed_resources(actor.as_ref(), &action, req).await?)?
    } else if args.visibility {
        serde_json::to_value(engine.check_visibility(actor.as_ref(), &action, Some(&resource)).await?)?
    } else {
        serde_json::to_value(engine.allowed_with_reason(actor.as_ref(), &action, Some(&resource)).await?)?
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
