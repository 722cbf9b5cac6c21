//! Remote simulator lifecycle

pub mod api;
pub mod controller;

pub use api::{HttpSimulatorApi, SimulatorApi, SimulatorRequest};
pub use controller::{SimulatorController, SimulatorOpResult};
