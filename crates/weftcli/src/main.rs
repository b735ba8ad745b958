// crates/weftcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use weftcore::{ExecutionRange, Kwargs, LevelFilter, Shared};
use weftnodes::CounterBody;
use weftruntime::{Autorun, ComponentSpec, RuntimeConfig, SpawnTarget, WeftRuntime, Workflow};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Task and workflow runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo workflow: a shared counter, spawned counter workers and
    /// looping workers stopped by a terminate broadcast
    Run {
        /// Where spawned workers run: thread or process
        #[arg(short, long, default_value = "thread")]
        range: ExecutionRange,

        /// How often the workflow itself is run
        #[arg(short, long, default_value_t = 3)]
        iterations: u64,

        /// Counter workers spawned once
        #[arg(short, long, default_value_t = 2)]
        workers: u64,

        /// Counter workers looping until terminated
        #[arg(short, long, default_value_t = 1)]
        loopers: u64,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// List available components
    Components,

    /// Run one component on behalf of a parent process
    #[command(hide = true)]
    Worker {
        /// Component spec as JSON
        #[arg(long)]
        spec: String,
    },
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with_writer(std::io::stderr)
        .try_init();
}

fn runtime() -> Result<WeftRuntime> {
    let config = RuntimeConfig::from_env()?;
    Ok(WeftRuntime::with_registry(Arc::new(weftnodes::registry()), config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            range,
            iterations,
            workers,
            loopers,
            verbose,
        } => {
            init_logging(verbose);
            run_demo(range, iterations, workers, loopers, verbose)?;
        }

        Commands::Components => {
            list_components()?;
        }

        Commands::Worker { spec } => {
            init_logging(false);
            tracing::debug!("Worker {} received spec {}", std::process::id(), spec);
            runtime()?
                .run_worker(&spec)
                .context("worker failed")?;
        }
    }

    Ok(())
}

fn run_demo(range: ExecutionRange, iterations: u64, workers: u64, loopers: u64, verbose: bool) -> Result<()> {
    let runtime = runtime()?;
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };

    let mut workflow = runtime
        .workflow("demo")
        .range(range)
        .host_shared()
        .log_level(level)
        .build()?;
    let shared = workflow
        .shared()
        .cloned()
        .context("demo workflow has no shared object")?;

    // The count lives in the workflow's own mailbox slot
    let store = workflow.id();
    let counter_args = Kwargs::new().with("store", store.to_string());

    println!("Workflow {} ({}), range {}", workflow.name(), workflow.id(), workflow.range());
    if let Some(address) = workflow.manager_address() {
        println!("   Shared object served on {}", address);
    }

    let counter = workflow.new_component("shared.counter", &counter_args)?.build()?;
    let log = workflow
        .new_component(
            "debug.log",
            &Kwargs::new().with("message", "counter incremented"),
        )?
        .build()?;
    workflow.add_task(counter.clone(), &[])?;
    workflow.add_task(log, &[counter])?;

    let started = Instant::now();
    for iteration in 1..=iterations {
        workflow.run(Kwargs::new().with("iteration", iteration))?;
    }
    println!(
        "   {} workflow run(s), count {}",
        iterations,
        CounterBody::peek(shared.as_ref(), store)?
    );

    // One-shot workers
    for _ in 0..workers {
        let spec = ComponentSpec::new("shared.counter")
            .with_kwargs(counter_args.clone())
            .with_autorun(Autorun::Run)
            .with_log_level(level);
        workflow.task().run_async(SpawnTarget::component(spec))?;
    }
    report_outcomes(&workflow)?;
    println!(
        "   {} worker(s) joined, count {}",
        workers,
        CounterBody::peek(shared.as_ref(), store)?
    );

    // Looping workers: wait until each has checked in, then broadcast terminate
    let baseline = shared.active_tasks()?.len();
    for _ in 0..loopers {
        let spec = ComponentSpec::new("shared.counter")
            .with_kwargs(counter_args.clone())
            .with_autorun(Autorun::Loop)
            .with_log_level(level);
        workflow.task().run_async(SpawnTarget::component(spec))?;
    }
    wait_for_active(shared.as_ref(), baseline + loopers as usize, Duration::from_secs(10))?;

    let stopper = workflow.new_component("shared.terminate", &Kwargs::new())?.build()?;
    stopper.run(Kwargs::new())?;
    report_outcomes(&workflow)?;

    println!();
    println!("Summary:");
    println!("   Final count: {}", CounterBody::peek(shared.as_ref(), store)?);
    println!("   Elapsed: {}ms", started.elapsed().as_millis());
    Ok(())
}

fn wait_for_active(shared: &dyn Shared, expected: usize, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while shared.active_tasks()?.len() < expected {
        if Instant::now() >= deadline {
            bail!("looping workers did not check in within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn report_outcomes(workflow: &Workflow) -> Result<()> {
    let failed: Vec<String> = workflow
        .task()
        .wait_async_tasks()
        .into_iter()
        .filter(|outcome| !outcome.is_success())
        .map(|outcome| outcome.to_string())
        .collect();
    if !failed.is_empty() {
        bail!("{} async task(s) failed: {}", failed.len(), failed.join("; "));
    }
    Ok(())
}

fn list_components() -> Result<()> {
    println!("Available components:");
    println!();

    let runtime = runtime()?;
    let registry = runtime.registry();

    for component in registry.list_components() {
        if let Some(metadata) = registry.get_metadata(&component) {
            println!("  • {} ({})", component, metadata.category);
            println!("    {}", metadata.description);
            for argument in &metadata.arguments {
                let marker = if argument.required { "required" } else { "optional" };
                println!("      {} [{}]: {}", argument.name, marker, argument.description);
            }
        } else {
            println!("  • {}", component);
        }
    }
    Ok(())
}
