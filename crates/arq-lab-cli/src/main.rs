use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, warn};

use arq_lab_abstract::{ArqConfig, InputSpec, Policy, SimConfig};
use arq_lab_net::{StopSignal, resolve_peer, run_receiver, run_sender};
use arq_lab_simulator::{
    DEFAULT_MAX_DURATION_MS, SimulationReport, Simulator, run_scenario_file, scenario_input,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Reliable file transfer over UDP with pluggable ARQ policies")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file to a listening receiver and print "<retransmissions> <KB/s>".
    Send {
        host: String,
        port: u16,
        file: PathBuf,
        /// Retransmission timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[command(flatten)]
        protocol: ProtocolArgs,
    },
    /// Receive files on a UDP port and write them to disk.
    Recv {
        port: u16,
        file: PathBuf,
        /// Number of streams to accept before exiting (0 = until interrupted).
        #[arg(long, default_value_t = 1)]
        streams: u32,
        #[command(flatten)]
        protocol: ProtocolArgs,
    },
    /// Run a transfer over the simulated channel.
    Simulate {
        /// Run a TOML scenario instead of an ad hoc transfer.
        #[arg(long)]
        scenario: Option<PathBuf>,
        #[arg(long, default_value_t = 0.1)]
        loss: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 64 * 1024)]
        input_size: usize,
        /// Write a JSON trace of the finished simulation.
        #[arg(long)]
        trace_out: Option<PathBuf>,
        #[command(flatten)]
        protocol: ProtocolArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct ProtocolArgs {
    /// unreliable | stop-and-wait | go-back-n | selective-repeat
    #[arg(long)]
    policy: Option<Policy>,
    #[arg(long)]
    window: Option<u32>,
    /// TOML file with an ARQ configuration; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl ProtocolArgs {
    fn resolve(&self, timeout_ms: Option<u64>) -> Result<ArqConfig> {
        let mut config = match &self.config {
            Some(path) => ArqConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ArqConfig::default(),
        };
        if let Some(policy) = self.policy {
            config.policy = policy;
            // pipelined policies default to a window of 8
            if self.window.is_none() && self.config.is_none() && policy.is_pipelined() {
                config.window_size = 8;
            }
        }
        if let Some(window) = self.window {
            config.window_size = window;
        }
        if let Some(timeout) = timeout_ms {
            config.timeout_ms = timeout;
        }
        config.validate().context("Invalid ARQ configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    match args.command {
        Command::Send {
            host,
            port,
            file,
            timeout_ms,
            protocol,
        } => send(&host, port, &file, protocol.resolve(timeout_ms)?).await,
        Command::Recv {
            port,
            file,
            streams,
            protocol,
        } => recv(port, &file, streams, protocol.resolve(None)?).await,
        Command::Simulate {
            scenario,
            loss,
            seed,
            input_size,
            trace_out,
            protocol,
        } => {
            let report = match scenario {
                Some(path) => run_scenario_file(&path)?,
                None => simulate(protocol.resolve(None)?, loss, seed, input_size)?,
            };
            print_simulation(&report);
            if let Some(path) = trace_out {
                report.write_json(&path)?;
                info!("Trace written to {}", path.display());
            }
            Ok(())
        }
    }
}

async fn send(host: &str, port: u16, file: &Path, config: ArqConfig) -> Result<()> {
    let source = File::open(file)
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let peer = resolve_peer(host, port).await?;
    let report = run_sender(config, BufReader::new(source), peer)
        .await
        .with_context(|| format!("Transfer of {} to {} failed", file.display(), peer))?;
    info!(
        "Sent {} bytes in {} packets ({} ms)",
        report.bytes, report.packets, report.elapsed_ms
    );
    println!("{}", report.summary_line());
    Ok(())
}

async fn recv(port: u16, file: &Path, streams: u32, config: ArqConfig) -> Result<()> {
    let sink = File::create(file)
        .with_context(|| format!("Failed to create {}", file.display()))?;
    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, shutting down receiver");
                stop.stop();
            }
        });
    }

    let summary = run_receiver(config, port, BufWriter::new(sink), streams, stop)
        .await
        .with_context(|| format!("Receiver on port {port} failed"))?;
    info!(
        "Received {} bytes in {} stream(s), {} duplicate packet(s)",
        summary.delivered_bytes, summary.streams_completed, summary.duplicates
    );
    if streams > 0 && summary.streams_completed < streams {
        bail!(
            "Receiver stopped after {} of {} stream(s)",
            summary.streams_completed,
            streams
        );
    }
    Ok(())
}

fn simulate(config: ArqConfig, loss: f64, seed: u64, input_size: usize) -> Result<SimulationReport> {
    let channel = SimConfig {
        loss_rate: loss,
        seed,
        ..Default::default()
    };
    let input = scenario_input(&InputSpec::Random {
        size: input_size,
        seed,
    });
    info!(
        "Simulating {} bytes with {} (window {}, loss {})",
        input.len(),
        config.policy,
        config.effective_window(),
        loss
    );

    let sender = arq_lab_core::sender(config.clone(), Cursor::new(input.clone()))?;
    let receiver = arq_lab_core::receiver(config, 1)?;
    let mut sim = Simulator::new(channel, sender, receiver);
    if !sim.run_for(DEFAULT_MAX_DURATION_MS)? {
        warn!("Simulation still running after {} ms", DEFAULT_MAX_DURATION_MS);
    }

    if sim.delivered_data == input {
        info!("Output matches input");
    } else {
        warn!(
            "Delivered {} of {} bytes; output differs from input",
            sim.delivered_data.len(),
            input.len()
        );
    }
    Ok(sim.export_report())
}

fn print_simulation(report: &SimulationReport) {
    match &report.transfer {
        Some(transfer) => println!("{}", transfer.summary_line()),
        None => println!("sender did not complete"),
    }
    println!(
        "delivered {} bytes, {} stream(s), {} data / {} ack datagrams, {} ms simulated",
        report.delivered_bytes,
        report.streams_completed,
        report.sender_packet_count,
        report.receiver_packet_count,
        report.duration_ms
    );
}
