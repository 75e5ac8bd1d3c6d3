use anyhow::{Context, anyhow, bail};
use arq_lab_abstract::{InputSpec, SimConfig, TestAction, TestAssertion, TestScenario};
use rand::{Rng, SeedableRng};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tracing::info;

use crate::engine::Simulator;
use crate::trace::SimulationReport;

/// Simulated-time bound applied when a scenario sets no `max_duration`.
pub const DEFAULT_MAX_DURATION_MS: u64 = 60_000;

pub fn load_scenario(path: impl AsRef<Path>) -> anyhow::Result<TestScenario> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse scenario")
}

/// Materialize the byte stream a scenario transfers.
pub fn scenario_input(spec: &InputSpec) -> Vec<u8> {
    match spec {
        InputSpec::Text { data } => data.as_bytes().to_vec(),
        InputSpec::Random { size, seed } => {
            let mut rng = rand::rngs::StdRng::seed_from_u64(*seed);
            let mut buf = vec![0u8; *size];
            rng.fill(&mut buf[..]);
            buf
        }
    }
}

pub fn run_scenario_file(path: impl AsRef<Path>) -> anyhow::Result<SimulationReport> {
    let scenario = load_scenario(path)?;
    run_scenario(&scenario)
}

pub fn run_scenario(scenario: &TestScenario) -> anyhow::Result<SimulationReport> {
    info!("Running Scenario: {}", scenario.name);
    if !scenario.description.is_empty() {
        info!("Description: {}", scenario.description);
    }

    scenario
        .arq
        .validate()
        .with_context(|| format!("Scenario '{}' has an invalid [arq] table", scenario.name))?;

    let mut config = SimConfig::default();
    scenario.config.apply_to(&mut config);

    let input = scenario_input(&scenario.input);
    let sender = arq_lab_core::sender(scenario.arq.clone(), Cursor::new(input.clone()))?;
    let receiver = arq_lab_core::receiver(scenario.arq.clone(), 1)?;
    let mut sim = Simulator::new(config, sender, receiver);

    for action in &scenario.actions {
        match action {
            TestAction::DropNextFromSenderSeq { seq } => sim.add_drop_sender_seq_once(*seq),
            TestAction::DropNextFromReceiverAck { ack } => sim.add_drop_receiver_ack_once(*ack),
            TestAction::DuplicateNextAck { ack, times } => {
                sim.add_duplicate_ack_once(*ack, *times)
            }
        }
    }

    sim.init()?;

    let max_duration = scenario
        .assertions
        .iter()
        .find_map(|a| match a {
            TestAssertion::MaxDuration { ms } => Some(*ms),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_DURATION_MS);

    while sim.step()? {
        if sim.current_time() > max_duration {
            return Err(anyhow!("Test timed out after {} ms", max_duration));
        }
    }

    check_assertions(&sim, &scenario.assertions, &input)?;

    info!("Test Scenario Passed!");
    Ok(sim.export_report())
}

fn check_assertions(
    sim: &Simulator,
    assertions: &[TestAssertion],
    input: &[u8],
) -> anyhow::Result<()> {
    for assertion in assertions {
        match assertion {
            TestAssertion::OutputMatchesInput => {
                expect_output(&sim.delivered_data, input)?;
            }
            TestAssertion::DataDelivered { data } => {
                expect_output(&sim.delivered_data, data.as_bytes())?;
            }
            TestAssertion::SenderPacketCount { min, max } => {
                if sim.sender_packet_count < *min {
                    bail!(
                        "Assertion Failed: Sender sent {} packets, expected min {}",
                        sim.sender_packet_count,
                        min
                    );
                }
                if let Some(max) = max
                    && sim.sender_packet_count > *max
                {
                    bail!(
                        "Assertion Failed: Sender sent {} packets, expected max {}",
                        sim.sender_packet_count,
                        max
                    );
                }
            }
            TestAssertion::MaxRetransmissions { max } => {
                let report = sim
                    .sender
                    .report()
                    .ok_or_else(|| anyhow!("Assertion Failed: sender never completed"))?;
                if report.retransmissions > *max {
                    bail!(
                        "Assertion Failed: {} retransmissions, expected at most {}",
                        report.retransmissions,
                        max
                    );
                }
            }
            TestAssertion::SenderCompleted => {
                if sim.sender_completed_at.is_none() {
                    bail!("Assertion Failed: sender never completed");
                }
            }
            TestAssertion::StreamsCompleted { count } => {
                if sim.streams_completed != *count {
                    bail!(
                        "Assertion Failed: receiver completed {} streams, expected {}",
                        sim.streams_completed,
                        count
                    );
                }
            }
            TestAssertion::MaxDuration { .. } => {} // enforced while running
        }
    }
    Ok(())
}

fn expect_output(delivered: &[u8], expected: &[u8]) -> anyhow::Result<()> {
    if delivered == expected {
        return Ok(());
    }
    let first_diff = delivered
        .iter()
        .zip(expected)
        .position(|(a, b)| a != b)
        .unwrap_or(delivered.len().min(expected.len()));
    Err(anyhow!(
        "Assertion Failed: delivered {} bytes, expected {} (first difference at byte {})",
        delivered.len(),
        expected.len(),
        first_diff
    ))
}
