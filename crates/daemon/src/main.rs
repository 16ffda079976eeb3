/// onionpath - offline front-end for the circuit engine
///
/// Loads a client configuration and a JSON router list and shows what
/// the engine would do with them:
/// - select routes for a destination port
/// - inspect and choose entry guards
/// - write or check a configuration file

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use onionpath_common::{ClientConfig, RouterDescriptor, Timestamp};
use onionpath_core::{
    GuardSelector, GuardStore, JsonFileGuardStore, MemoryGuardStore, NodeUsage, RouteBuilder,
    RouteRequestProperties, RouterDirectory, StaticDirectory,
};

const DEFAULT_CONFIG: &str = "onionpath.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = take_option(&mut args, "--config")?.map(PathBuf::from);
    let config = load_config(config_path.as_deref())?;

    init_logging(config.verbose);
    debug!("Effective configuration: {:?}", config);

    let Some(command) = args.first().cloned() else {
        print_help();
        return Ok(());
    };
    let rest = args.split_off(1);

    match command.as_str() {
        "help" | "--help" | "-h" => print_help(),
        "version" | "--version" | "-v" => {
            println!("onionpath v{}", env!("CARGO_PKG_VERSION"));
        }
        "route" => run_route(config, rest).await?,
        "guards" => run_guards(config, rest).await?,
        "config" => run_config(config, rest)?,
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `verbose` picks debug over info
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let config = match path {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            ClientConfig::from_file(Path::new(DEFAULT_CONFIG))
                .with_context(|| format!("loading {}", DEFAULT_CONFIG))?
        }
        None => ClientConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Remove `--name value` from `args`
fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(index) = args.iter().position(|arg| arg == name) else {
        return Ok(None);
    };
    if index + 1 >= args.len() {
        bail!("{} needs a value", name);
    }
    let value = args.remove(index + 1);
    args.remove(index);
    Ok(Some(value))
}

fn take_number<T: std::str::FromStr>(args: &mut Vec<String>, name: &str) -> Result<Option<T>> {
    take_option(args, name)?
        .map(|value| {
            value
                .parse()
                .map_err(|_| anyhow!("{} expects a number, got {:?}", name, value))
        })
        .transpose()
}

fn load_directory(args: &[String]) -> Result<Arc<StaticDirectory>> {
    let path = args
        .first()
        .ok_or_else(|| anyhow!("missing router list (JSON array of router descriptors)"))?;
    let directory = StaticDirectory::from_json_file(Path::new(path))?;
    info!("Loaded {} routers from {}", directory.len(), path);
    Ok(Arc::new(directory))
}

fn guard_store(config: &ClientConfig) -> Arc<dyn GuardStore> {
    match &config.guards.guard_file {
        Some(path) => Arc::new(JsonFileGuardStore::new(path)),
        None => {
            debug!("No guard file configured, guards live in memory");
            Arc::new(MemoryGuardStore::new())
        }
    }
}

async fn run_route(config: ClientConfig, mut args: Vec<String>) -> Result<()> {
    let exit_port: Option<u16> = take_number(&mut args, "--exit-port")?;
    let count: usize = take_number(&mut args, "--count")?.unwrap_or(1);
    let directory = load_directory(&args)?;

    let guards = Arc::new(
        GuardSelector::load(config.guards.clone(), directory.clone(), guard_store(&config))
            .await?,
    );
    let usage = Arc::new(NodeUsage::new());
    let routes = RouteBuilder::new(
        directory.clone(),
        guards.clone(),
        usage.clone(),
        config.max_circuits_per_node,
    );

    let mut props = RouteRequestProperties::from_config(&config);
    if let Some(port) = exit_port {
        props = props.with_exit_target(None, port);
    }

    for n in 1..=count {
        match routes.build_route(&props)? {
            Some(route) => {
                println!("Route {}:", n);
                print_route(&route);
                usage.increment(route.iter().map(|hop| &hop.identity));
            }
            None => {
                warn!("No route satisfies the request after {} routes", n - 1);
                break;
            }
        }
    }
    guards.save().await?;
    Ok(())
}

async fn run_guards(config: ClientConfig, args: Vec<String>) -> Result<()> {
    let directory = load_directory(&args)?;
    let guards = GuardSelector::load(config.guards.clone(), directory.clone(), guard_store(&config))
        .await?;

    let entries = guards.entries();
    println!("\n========================================");
    println!("         Entry Guards ({})", entries.len());
    println!("========================================");
    let now = Timestamp::now();
    for entry in &entries {
        let name = directory
            .router(&entry.identity)
            .map(|router| router.nickname)
            .unwrap_or_else(|| "<not in directory>".to_string());
        let discarded = entry
            .first_discard
            .map(|since| format!("  discarded {}s ago", since.elapsed_at(now).as_secs()))
            .unwrap_or_default();
        println!(
            "{} {:<16} failures: {}{}",
            entry.identity, name, entry.unsuccessful_connect, discarded
        );
    }

    match guards.select(&Default::default(), &directory.valid_routers()) {
        Some(router) => {
            let status = if guards.is_pending(&router.identity) {
                "candidate"
            } else {
                "guard"
            };
            println!("\nNext first hop: {} ({}, {})", router.identity, router.nickname, status);
        }
        None => println!("\nNo usable first hop"),
    }
    println!("========================================\n");
    guards.save().await?;
    Ok(())
}

fn run_config(config: ClientConfig, args: Vec<String>) -> Result<()> {
    let path = PathBuf::from(args.first().map(String::as_str).unwrap_or(DEFAULT_CONFIG));
    if path.exists() {
        let loaded = ClientConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?;
        loaded.validate()?;
        println!("{} is valid", path.display());
        println!("{:#?}", loaded);
    } else {
        config.to_file(&path)?;
        info!("Wrote configuration to {}", path.display());
    }
    Ok(())
}

fn print_route(route: &[RouterDescriptor]) {
    for (index, hop) in route.iter().enumerate() {
        let role = match index {
            0 => "entry",
            i if i + 1 == route.len() => "exit",
            _ => "middle",
        };
        println!(
            "  {:<6} {} {:<16} {}:{}",
            role, hop.identity, hop.nickname, hop.address, hop.or_port
        );
    }
}

fn print_help() {
    println!("onionpath - onion routing circuit engine");
    println!();
    println!("USAGE:");
    println!("    onionpath [--config FILE] [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    route <routers.json> [--exit-port N] [--count N]");
    println!("                Select routes the way circuit builds would");
    println!("    guards <routers.json>");
    println!("                Show persisted entry guards and the next first hop");
    println!("    config [FILE]");
    println!("                Check FILE, or write the defaults to it (default {})", DEFAULT_CONFIG);
    println!("    help        Show this help message");
    println!("    version     Show version information");
    println!();
    println!("LOGGING:");
    println!("    RUST_LOG overrides the level; 'verbose = true' in the config enables debug");
}
