//! # Messaging Benchmark - Main Entry Point
//!
//! Subcommands:
//! - `send`: load test data and run one batch against receivers started elsewhere
//! - `receive`: run a single receiver until Ctrl-C
//! - `loopback`: start a receiver fleet and a sender in this process
//! - `generate-data`: write a test data file
//!
//! Batch results are printed as a summary and appended to the report file as
//! one JSON line per run.

use anyhow::{Context, Result};
use clap::Parser;
use messaging_benchmark::{
    benchmark::{BenchmarkConfig, BenchmarkRunner, ReceiverFleet},
    cli::{Args, Command, GenerateDataArgs, LoopbackArgs, ReceiveArgs, SendArgs},
    logging::init_logging,
    receiver::UnifiedReceiver,
    results::{print_receiver_table, ResultsManager},
    sender::OutboundMessage,
    test_data::{generate_test_data, load_test_data, validate_test_data, write_test_data},
    transport::{DriverRole, TransportFactory, TransportKind},
    utils::get_cpu_cores,
};
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Held for the process lifetime so buffered file logs are flushed.
    let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

    info!(
        "Starting Messaging Benchmark v{} ({} CPU cores)",
        messaging_benchmark::VERSION,
        get_cpu_cores()
    );

    match args.command {
        Command::Send(send) => run_send(send).await,
        Command::Receive(receive) => run_receive(receive, args.verbose).await,
        Command::Loopback(loopback) => run_loopback(loopback, args.verbose).await,
        Command::GenerateData(generate) => run_generate(generate),
    }
}

async fn run_send(args: SendArgs) -> Result<()> {
    if args.transport.transport == TransportKind::Memory {
        anyhow::bail!("The in-memory transport only works within one process; use `loopback`");
    }

    let config = BenchmarkConfig::from_args(&args.transport, &args.sender, args.receivers)?;
    let records = load_test_data(&args.data)?;
    for issue in validate_test_data(&records, args.receivers) {
        warn!("Test data: {}", issue);
    }
    let items: Vec<OutboundMessage> = records.iter().map(|record| record.to_outbound()).collect();

    let runner = BenchmarkRunner::new(config);
    let results = runner.run(&items).await?;
    results.print_summary();

    ResultsManager::new(&args.sender.output).append(&results)?;
    Ok(())
}

async fn run_receive(args: ReceiveArgs, verbose: bool) -> Result<()> {
    if args.transport.transport == TransportKind::Memory {
        anyhow::bail!("The in-memory transport only works within one process; use `loopback`");
    }

    let factory = TransportFactory::new(args.transport.transport, args.transport.to_config());
    let driver = factory.create(DriverRole::Receiver {
        receiver_id: args.id,
    })?;
    let mut receiver =
        UnifiedReceiver::new(args.id, driver).with_poll_interval(Duration::from_millis(args.poll_ms));

    let stop = receiver.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping receiver");
            stop.stop();
        }
    });

    let summary = receiver
        .run(true)
        .await
        .with_context(|| format!("Receiver {} failed", args.id))?;
    if verbose {
        print_receiver_table(&[summary]);
    }
    Ok(())
}

async fn run_loopback(args: LoopbackArgs, verbose: bool) -> Result<()> {
    let config = BenchmarkConfig::from_args(&args.transport, &args.sender, args.receivers)?;

    let records = match &args.data {
        Some(path) => load_test_data(path)?,
        None => generate_test_data(args.messages, args.receivers),
    };
    for issue in validate_test_data(&records, args.receivers) {
        warn!("Test data: {}", issue);
    }
    let items: Vec<OutboundMessage> = records.iter().map(|record| record.to_outbound()).collect();

    let runner = BenchmarkRunner::new(config);
    let fleet = ReceiverFleet::spawn(
        runner.factory(),
        args.receivers,
        Duration::from_millis(args.poll_ms),
        verbose,
    )
    .await?;

    let outcome = runner.run(&items).await;
    let summaries = fleet.shutdown().await?;
    let results = outcome?;

    results.print_summary();
    if verbose {
        print_receiver_table(&summaries);
    }

    ResultsManager::new(&args.sender.output).append(&results)?;
    Ok(())
}

fn run_generate(args: GenerateDataArgs) -> Result<()> {
    let records = generate_test_data(args.count, args.receivers);
    write_test_data(&args.output, &records)?;
    info!(
        "Generated {} messages in {} (distributed across {} receivers)",
        records.len(),
        args.output.display(),
        args.receivers
    );
    Ok(())
}
