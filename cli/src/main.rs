//! The `pigeon` binary.
//!
//! Three entry points share one executable: the default run mode
//! (`pigeon <cmd...>`), the worker loop (`pigeon worker`), and config
//! maintenance (`pigeon config ...`). Dispatch happens on the first
//! token before clap sees anything, so an arbitrary user command never
//! collides with subcommand parsing.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use pigeon_core::client;
use pigeon_core::config;
use pigeon_core::worker;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(
    name = "pigeon",
    about = "Run a command on a remote worker through a shared filesystem",
    disable_help_subcommand = true
)]
struct RunArgs {
    /// Config file (default: $PIGEON_CONFIG, else ~/.config/pigeon/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Route tag for selecting a worker pool
    #[arg(long, value_name = "ROUTE")]
    route: Option<String>,

    /// Seconds to wait for a live worker before giving up (exit 124)
    #[arg(long = "wait-worker", value_name = "SECS")]
    wait_worker: Option<f64>,

    /// Print session state transitions to stderr
    #[arg(short, long)]
    verbose: bool,

    /// The command to run remotely
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "CMD")]
    command: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(name = "pigeon worker", about = "Run the pigeon worker loop")]
struct WorkerArgs {
    /// Config file (default: $PIGEON_CONFIG, else ~/.config/pigeon/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Max concurrent session runners
    #[arg(long = "max-jobs", value_name = "N")]
    max_jobs: Option<usize>,

    /// Session discovery poll interval in seconds
    #[arg(long = "poll-interval", value_name = "SECS")]
    poll_interval: Option<f64>,

    /// Only claim sessions tagged with this route
    #[arg(long, value_name = "ROUTE")]
    route: Option<String>,

    /// Log claim arbitration, lock waits and byte-level I/O previews
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Parser)]
#[command(name = "pigeon config", about = "View and edit the pigeon config file")]
struct ConfigArgs {
    /// Config file (default: $PIGEON_CONFIG, else ~/.config/pigeon/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the resolved config file path
    Path,
    /// List configurable keys
    Keys,
    /// Show the config file contents
    Show {
        /// Also show effective values after environment overrides
        #[arg(long)]
        effective: bool,
    },
    /// Set one key
    Set { key: String, value: String },
    /// Unset one key
    Unset { key: String },
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match args.first().map(String::as_str) {
        Some("worker") => worker_main(&args[1..]),
        Some("config") => config_main(&args[1..]),
        _ => client_main(&args),
    };
    // Exit directly: the stdin pump thread may still be blocked in read().
    std::process::exit(code);
}

fn client_main(args: &[String]) -> i32 {
    let parsed = RunArgs::parse_from(std::iter::once("pigeon".to_string()).chain(args.iter().cloned()));
    init_tracing("warn", None);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("pigeon: failed to start runtime: {err}");
            return 1;
        }
    };
    let options = client::ClientOptions {
        config_path: parsed.config,
        route: parsed.route,
        wait_worker: parsed.wait_worker,
        verbose: parsed.verbose,
    };
    match runtime.block_on(client::run(parsed.command, options)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("pigeon: {err:#}");
            1
        }
    }
}

fn worker_main(args: &[String]) -> i32 {
    let parsed =
        WorkerArgs::parse_from(std::iter::once("pigeon worker".to_string()).chain(args.iter().cloned()));
    let reload = init_tracing(
        if parsed.debug { WORKER_DEBUG_FILTER } else { "info" },
        Some(()),
    );
    let set_debug = reload.map(|handle| {
        Arc::new(move |enabled: bool| {
            let directive = if enabled { WORKER_DEBUG_FILTER } else { "info" };
            if let Err(err) = handle.reload(EnvFilter::new(directive)) {
                eprintln!("pigeon-worker: log filter reload failed: {err}");
            }
        }) as Arc<dyn Fn(bool) + Send + Sync>
    });

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("pigeon-worker: failed to start runtime: {err}");
            return 1;
        }
    };
    let options = worker::WorkerOptions {
        config_path: parsed.config,
        route: parsed.route,
        max_jobs: parsed.max_jobs,
        poll_interval: parsed.poll_interval,
        debug: parsed.debug.then_some(true),
        set_debug,
    };
    match runtime.block_on(worker::run(options)) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("pigeon-worker: {err:#}");
            1
        }
    }
}

fn config_main(args: &[String]) -> i32 {
    let parsed =
        ConfigArgs::parse_from(std::iter::once("pigeon config".to_string()).chain(args.iter().cloned()));
    init_tracing("warn", None);
    match run_config(parsed) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("pigeon config: {err:#}");
            2
        }
    }
}

fn run_config(parsed: ConfigArgs) -> Result<()> {
    let path = config::config_path(parsed.config.as_deref());
    match parsed.action {
        ConfigAction::Path => {
            println!("{}", path.display());
        }
        ConfigAction::Keys => {
            for key in config::CONFIG_KEYS {
                println!("{key}");
            }
        }
        ConfigAction::Show { effective } => {
            println!("path={}", path.display());
            let body = match std::fs::read_to_string(&path) {
                Ok(body) => body,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(err) => {
                    return Err(err).with_context(|| format!("reading {}", path.display()));
                }
            };
            println!();
            println!("[file]");
            if body.trim().is_empty() {
                println!("# empty");
            } else {
                print!("{body}");
                if !body.ends_with('\n') {
                    println!();
                }
            }
            if effective {
                println!();
                print_effective(&path)?;
            }
        }
        ConfigAction::Set { key, value } => {
            config::set_value(&path, &key, &value)?;
            println!("updated {}: {key}", path.display());
        }
        ConfigAction::Unset { key } => {
            config::unset_value(&path, &key)?;
            println!("updated {}: {key} unset", path.display());
        }
    }
    Ok(())
}

fn print_effective(path: &std::path::Path) -> Result<()> {
    println!("[effective]");
    let file = config::load_file(path)?;
    match file.resolve() {
        Ok(settings) => {
            println!("cache={}", settings.layout.cache_root().display());
            println!("namespace={}", settings.layout.namespace());
            println!("user={}", or_unset(Some(&settings.user)));
            println!("route={}", or_unset(settings.route.as_deref()));
            println!("worker.route={}", or_unset(settings.worker_route.as_deref()));
            println!("worker.max_jobs={}", settings.worker_max_jobs);
            println!("worker.poll_interval={}", settings.worker_poll_interval);
            println!("worker.debug={}", settings.worker_debug);
            println!("worker.accept_unrouted={}", settings.accept_unrouted);
            println!("heartbeat_stale={}", settings.heartbeat_stale);
            println!("source_bashrc={}", settings.source_bashrc);
            for (key, value) in &settings.remote_env {
                println!("remote_env.{key}={value}");
            }
        }
        Err(err) => println!("# unresolved: {err}"),
    }
    Ok(())
}

fn or_unset(value: Option<&str>) -> &str {
    match value {
        Some(value) if !value.is_empty() => value,
        _ => "<unset>",
    }
}

const WORKER_DEBUG_FILTER: &str = "info,pigeon_core=debug";

type ReloadHandle =
    tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Installs the stderr subscriber. `RUST_LOG` wins over the mode default;
/// the worker gets a reload handle so config-driven debug toggles apply
/// without a restart.
fn init_tracing(default_directive: &str, reloadable: Option<()>) -> Option<ReloadHandle> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    if reloadable.is_some() {
        let (layer, handle) = tracing_subscriber::reload::Layer::new(filter);
        tracing_subscriber::registry()
            .with(layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
        Some(handle)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
        None
    }
}
