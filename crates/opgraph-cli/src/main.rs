//! opgraph CLI - run operation graphs from the command line.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use opgraph_runtime::observers::EventObserver;
use opgraph_runtime::service::{HttpFetcher, ServiceRequest, ServiceRequestTask};
use opgraph_runtime::{
    CoordinatorConfig, ExecutionQueue, QueueConfig, ServiceRegistry, TimedTaskCoordinator,
};

mod demo;
mod output;

use demo::{ByteCounter, RefreshProvider, StepPlan};

/// opgraph - dependency-ordered, condition-gated task graphs
#[derive(Parser)]
#[command(name = "opgraph")]
#[command(about = "Run operation graphs on a bounded execution queue", long_about = None)]
struct Cli {
    /// Output events as JSON lines on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Log filter (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Maximum number of units executing at once on each queue, group queues included
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the startup-sequence demo graph
    Startup {
        /// Simulated duration of each step in milliseconds
        #[arg(long, default_value = "100")]
        step_ms: u64,

        /// Make the named step fail
        #[arg(long)]
        fail_step: Option<String>,
    },

    /// Run the scheduled task coordinator for a number of ticks
    Schedule {
        /// Seconds between ticks
        #[arg(long, default_value = "10")]
        interval_secs: u64,

        /// Ticks to run, including the immediate one on resume
        #[arg(long, default_value = "3")]
        ticks: u32,

        /// Units produced per tick
        #[arg(long, default_value = "1")]
        per_tick: usize,
    },

    /// Fetch a URL and process the response
    Fetch {
        /// URL to fetch
        url: String,

        /// Timeout for fetch plus processing, in seconds
        #[arg(long, default_value = "20")]
        timeout_secs: u64,

        /// Stream the body instead of buffering it
        #[arg(long)]
        stream: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("opgraph=info"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    if cli.json {
        output::enable_json_mode();
    }

    let registry = ServiceRegistry::new();
    registry.insert(ExecutionQueue::new(queue_config("main", cli.max_concurrent)));

    match cli.command {
        Commands::Startup { step_ms, fail_step } => {
            run_startup(&registry, step_ms, fail_step, cli.max_concurrent).await?;
        }
        Commands::Schedule {
            interval_secs,
            ticks,
            per_tick,
        } => {
            run_schedule(&registry, interval_secs, ticks, per_tick).await?;
        }
        Commands::Fetch {
            url,
            timeout_secs,
            stream,
        } => {
            run_fetch(&registry, url, timeout_secs, stream, cli.max_concurrent).await?;
        }
    }

    Ok(())
}

fn queue_config(name: &str, max_concurrent: Option<usize>) -> QueueConfig {
    let config = QueueConfig::named(name);
    match max_concurrent {
        Some(max) => config.with_max_concurrent(max),
        None => config,
    }
}

async fn run_startup(
    registry: &ServiceRegistry,
    step_ms: u64,
    fail_step: Option<String>,
    max_concurrent: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let queue = registry.resolve::<ExecutionQueue>()?;
    let (events, rx) = EventObserver::channel();
    let (stop_printer, printer) = output::spawn_printer(rx);

    let plan = StepPlan {
        step: Duration::from_millis(step_ms),
        fail_step,
    };
    let children = queue_config("startup-sequence/children", max_concurrent);
    let group = demo::startup_sequence(&plan, &events, children);
    drop(events);

    info!(queue = %queue.name(), "Starting startup sequence");
    let unit = group.into_unit();
    queue.submit(unit.clone());
    unit.finished().await;
    queue.wait_until_idle().await;

    let report = unit.report();
    let _ = stop_printer.send(());
    printer.await?;

    output::emit_report(&report);
    output::emit_summary("startup", queue.submitted_count(), report.failed);
    if report.failed {
        return Err(format!("startup sequence failed: {}", report.errors.join("; ")).into());
    }
    Ok(())
}

async fn run_schedule(
    registry: &ServiceRegistry,
    interval_secs: u64,
    ticks: u32,
    per_tick: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let queue = registry.resolve::<ExecutionQueue>()?;
    let interval = Duration::from_secs(interval_secs.max(1));
    let coordinator =
        TimedTaskCoordinator::from_registry(registry, CoordinatorConfig::with_interval(interval))?;

    let (events, rx) = EventObserver::channel();
    let (stop_printer, printer) = output::spawn_printer(rx);
    coordinator.add_task_provider(Arc::new(RefreshProvider { per_tick, events }));

    coordinator.resume();
    // The first tick fires on resume; stop halfway between the last two.
    let ticks = ticks.max(1);
    tokio::time::sleep(interval * (ticks - 1) + interval / 2).await;
    coordinator.pause();
    queue.wait_until_idle().await;

    let _ = stop_printer.send(());
    printer.await?;

    output::emit_summary("schedule", queue.submitted_count(), false);
    Ok(())
}

async fn run_fetch(
    registry: &ServiceRegistry,
    url: String,
    timeout_secs: u64,
    stream: bool,
    max_concurrent: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let queue = registry.resolve::<ExecutionQueue>()?;
    let (events, rx) = EventObserver::channel();
    let (stop_printer, printer) = output::spawn_printer(rx);

    let fetcher = if stream {
        HttpFetcher::new().streaming()
    } else {
        HttpFetcher::new()
    };
    let request = ServiceRequest::get(url).with_timeout(Duration::from_secs(timeout_secs));
    let children = queue_config("fetch/children", max_concurrent);
    let task = ServiceRequestTask::with_config(request, Arc::new(fetcher), Arc::new(ByteCounter), children);
    task.unit().add_observer(events)?;

    let unit = task.into_unit();
    queue.submit(unit.clone());
    unit.finished().await;

    let report = unit.report();
    let _ = stop_printer.send(());
    printer.await?;

    output::emit_report(&report);
    output::emit_summary("fetch", queue.submitted_count(), report.failed);
    if report.failed {
        return Err(format!("fetch failed: {}", report.errors.join("; ")).into());
    }
    Ok(())
}
