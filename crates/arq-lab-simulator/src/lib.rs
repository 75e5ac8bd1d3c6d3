pub mod engine;
pub mod scenario_runner;
pub mod trace;

pub use engine::{LinkEventSummary, NodeId, Simulator};
pub use scenario_runner::{
    DEFAULT_MAX_DURATION_MS, load_scenario, run_scenario, run_scenario_file, scenario_input,
};
pub use trace::SimulationReport;
