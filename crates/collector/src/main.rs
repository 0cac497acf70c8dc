use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use oa::RENDER_BASIC_GEN8_GUID;
use streams::{Backend, EngineContext, MainLoop, OaAggregator, Reactor, Stream, StreamConfig};

mod cpu_report;
mod update_printer;

use update_printer::PrintSink;

/// GPU OA counter collector
#[derive(Debug, Parser)]
struct Command {
    /// Verbose debug output
    #[arg(short, long)]
    verbose: bool,

    /// Track duration in seconds (0 = unlimited)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Generate reports instead of sampling the GPU
    #[arg(short, long)]
    simulated: bool,

    /// GUID of the metric set to sample
    #[arg(short, long, default_value = RENDER_BASIC_GEN8_GUID)]
    metric_set: String,

    /// OA sampling period exponent: one report every 2^(exponent + 1) timestamp ticks
    #[arg(short, long, default_value = "16")]
    exponent: u32,

    /// Aggregation period in milliseconds
    #[arg(short, long, default_value = "1000")]
    period_ms: u64,

    /// Only sample this GPU context (requires a registered context handle)
    #[arg(long)]
    ctx: Option<u32>,

    /// Also sample per-CPU statistics
    #[arg(long)]
    cpu_stats: bool,
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if verbose {
        builder.filter_level(LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(LevelFilter::Info);
    }
    builder.init();
}

fn report_cpu_stats(streams: &[Stream]) {
    for stream in streams {
        let report = stream
            .with_backend(|backend| match backend {
                Backend::Cpu(cpu) => Some(cpu_report::utilisation(&cpu.rows())),
                _ => None,
            })
            .flatten();

        for (cpu, busy) in report.iter().flatten().enumerate() {
            info!("CPU {:<3} busy {:>6.2}%", cpu, busy);
        }
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(opts.verbose);

    let mut config = StreamConfig::default();
    config.apply_env();
    config.simulated |= opts.simulated;
    config.aggregation_period = Duration::from_millis(opts.period_ms);

    let main_loop = Rc::new(MainLoop::new());
    let context = EngineContext::new(main_loop.clone(), config.clone())
        .context("Failed to set up GPU access (try --simulated)")?;

    let metric_set = context
        .metric_set(&opts.metric_set)
        .with_context(|| format!("Cannot sample metric set {}", opts.metric_set))?;
    let aggregator = OaAggregator::new(
        context.device(),
        metric_set.clone(),
        opts.ctx.is_some(),
        config.aggregation_period,
        PrintSink::new(metric_set.clone(), io::stdout()),
    );

    let mut streams = vec![context
        .open_oa_stream(
            &opts.metric_set,
            opts.exponent,
            opts.ctx,
            Box::new(aggregator),
            false,
        )
        .context("Failed to open OA stream")?];

    if opts.cpu_stats {
        let stream = context
            .open_cpu_stats(false, opts.period_ms)
            .context("Failed to open CPU statistics stream")?;
        streams.push(stream);
    }

    println!(
        "Successfully started! Sampling {} ({})...",
        metric_set.name, opts.metric_set
    );
    println!("{}", "-".repeat(60));

    if opts.duration > 0 {
        let loop_clone = main_loop.clone();
        main_loop.start_timer(
            Duration::from_secs(opts.duration),
            Duration::ZERO,
            Box::new(move || loop_clone.quit()),
        );
    }
    main_loop.run()?;

    report_cpu_stats(&streams);

    // Streams must be closed before the last handle goes away
    let open = Rc::new(Cell::new(streams.len()));
    for stream in &streams {
        let open = open.clone();
        stream.close(move || open.set(open.get() - 1));
    }
    while open.get() > 0 {
        main_loop.iterate(Some(Duration::from_millis(10)))?;
    }

    info!("All streams closed");
    Ok(())
}
