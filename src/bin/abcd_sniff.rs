// src/bin/abcd_sniff.rs

//! Listens to an ABCD bus and prints every decoded frame.
//!
//! ```bash
//! abcd-sniff telnet://bridge.local:2626
//! abcd-sniff /dev/ttyUSB0 --archive frames.jsonl --metrics
//! RUST_LOG=abcdbus=debug abcd-sniff file://capture.bin --once
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use abcdbus::common::timing::RECONNECT_DELAY;
use abcdbus::common::{AbcdError, MonitorConfig};
use abcdbus::decoder::{DecodedRecord, RecordKind};
use abcdbus::monitor::{archive_channel, open_transport, spawn_archive_writer, BusMonitor, StateAggregator};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[clap(author, version, about = "Passive ABCD bus sniffer")]
struct Args {
    /// Transport: telnet://host[:port], file://path or a device path.
    /// Overrides the uri from the config file.
    uri: Option<String>,

    /// YAML monitor configuration.
    #[clap(short, long, env = "ABCD_CONFIG")]
    config: Option<PathBuf>,

    /// Append WRITE and ACK06 frames to this file as JSON lines.
    #[clap(short, long)]
    archive: Option<PathBuf>,

    /// Decode table version.
    #[clap(long)]
    decode_table: Option<String>,

    /// Accept frames from unknown device classes.
    #[clap(long)]
    lenient: bool,

    /// Exit when the transport closes instead of reconnecting.
    #[clap(long)]
    once: bool,

    /// Print the metrics exposition on exit.
    #[clap(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "abcdbus=info,abcd_sniff=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "abcd-sniff failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), AbcdError> {
    let mut config = match &args.config {
        Some(path) => MonitorConfig::load(path)?,
        None => MonitorConfig::default(),
    };
    if let Some(uri) = args.uri {
        config.uri = uri;
    }
    if let Some(version) = args.decode_table {
        config.decode_table = version;
    }
    if args.lenient {
        config.strict_addresses = false;
    }
    config.validate()?;
    if config.uri.is_empty() {
        return Err(AbcdError::Config("no transport uri given".to_string()));
    }
    let config = Arc::new(config);

    let (aggregator, archive_task) = match &args.archive {
        Some(path) => {
            let file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
            let (sender, rx) = archive_channel(config.archive_queue);
            info!(path = %path.display(), "Archiving frames");
            (StateAggregator::with_archive(sender), Some(spawn_archive_writer(rx, file)))
        }
        None => (StateAggregator::new(), None),
    };
    let aggregator = Arc::new(aggregator);

    let mut monitor = BusMonitor::new(Arc::clone(&config), Arc::clone(&aggregator))?.on_record(print_record);
    let exporter = monitor.exporter();
    let status = monitor.status();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    while !cancel.is_cancelled() {
        let transport = match open_transport(&config.uri).await {
            Ok(transport) => transport,
            Err(e) if !args.once => {
                warn!(uri = %config.uri, error = %e, "Connect failed, retrying");
                if cancelled_during_delay(&cancel).await {
                    break;
                }
                status.note_reconnect();
                continue;
            }
            Err(e) => return Err(e),
        };
        match monitor.run(transport, cancel.clone()).await {
            Ok(()) => break,
            Err(e) if args.once => {
                info!(error = %e, "Transport finished");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Transport lost, reconnecting");
                if cancelled_during_delay(&cancel).await {
                    break;
                }
                status.note_reconnect();
            }
        }
    }

    let stats = status.stats();
    info!(
        frames = stats.frames,
        reconnects = status.reconnects(),
        opaque = stats.opaque_frames,
        rejected = stats.rejected(),
        skipped = stats.bytes_skipped,
        "Bus monitor stopped"
    );
    if args.metrics {
        match exporter.render() {
            Ok(text) => print!("{}", text),
            Err(e) => warn!(error = %e, "Metrics rendering failed"),
        }
    }

    // Dropping the monitor drops the last archive sender, which ends the writer.
    drop(monitor);
    drop(exporter);
    drop(aggregator);
    if let Some(task) = archive_task {
        match task.await {
            Ok(Ok(written)) => info!(written, "Archive closed"),
            Ok(Err(e)) => warn!(error = %e, "Archive failed"),
            Err(e) => warn!(error = %e, "Archive task panicked"),
        }
    }
    Ok(())
}

/// Waits out the reconnect delay. Returns true if shutdown was requested meanwhile.
async fn cancelled_during_delay(cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(RECONNECT_DELAY) => false,
    }
}

fn print_record(record: &DecodedRecord) {
    let time = record.received_at.format("%H:%M:%S%.3f");
    match &record.kind {
        RecordKind::Known { name, fields, unparsed, .. } => {
            let mut line = format!("{} {} {}", time, record.frame, name);
            for field in fields {
                line.push_str(&format!(" {}={}", field.name, field.value));
            }
            if *unparsed > 0 {
                line.push_str(&format!(" (+{} bytes)", unparsed));
            }
            println!("{}", line);
        }
        RecordKind::Opaque { .. } => println!("{} {} opaque", time, record.frame),
    }
}
