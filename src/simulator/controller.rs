//! Idempotent start/stop of the remote simulator

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::api::{SimulatorApi, SimulatorRequest};
use crate::events::{Listeners, SimulatorEvent};
use crate::models::SimulatorStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorOpResult {
    pub success: bool,
    pub status: SimulatorStatus,
    pub error: Option<String>,
}

impl SimulatorOpResult {
    fn ok(status: SimulatorStatus) -> Self {
        Self {
            success: true,
            status,
            error: None,
        }
    }

    pub(crate) fn failed(status: SimulatorStatus, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Copy)]
enum Op {
    Start,
    Stop,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Start => "start",
            Op::Stop => "stop",
        }
    }

    fn transitional(self) -> SimulatorStatus {
        match self {
            Op::Start => SimulatorStatus::Starting,
            Op::Stop => SimulatorStatus::Stopping,
        }
    }

    fn already_there(self, status: SimulatorStatus) -> bool {
        match self {
            Op::Start => status.is_up(),
            Op::Stop => status.is_down(),
        }
    }
}

#[derive(Default)]
struct State {
    status: SimulatorStatus,
    /// Bumped by every call that reaches the API; older completions are stale
    op: u64,
}

pub struct SimulatorController {
    api: Arc<dyn SimulatorApi>,
    state: Mutex<State>,
    listeners: Listeners<SimulatorEvent>,
}

impl SimulatorController {
    pub fn new(api: Arc<dyn SimulatorApi>) -> Self {
        Self {
            api,
            state: Mutex::new(State::default()),
            listeners: Listeners::new(),
        }
    }

    pub fn listeners(&self) -> &Listeners<SimulatorEvent> {
        &self.listeners
    }

    pub fn status(&self) -> SimulatorStatus {
        self.state.lock().status
    }

    pub async fn start(&self, ctx: &SimulatorRequest) -> SimulatorOpResult {
        self.run(Op::Start, ctx).await
    }

    pub async fn stop(&self, ctx: &SimulatorRequest) -> SimulatorOpResult {
        self.run(Op::Stop, ctx).await
    }

    /// Apply a server-reported status; `Unknown` carries no information
    pub fn observe(&self, status: SimulatorStatus) {
        if status != SimulatorStatus::Unknown {
            self.set(status);
        }
    }

    async fn run(&self, op: Op, ctx: &SimulatorRequest) -> SimulatorOpResult {
        let (previous, ticket) = {
            let mut state = self.state.lock();
            if op.already_there(state.status) {
                return SimulatorOpResult::ok(state.status);
            }
            state.op += 1;
            let previous = std::mem::replace(&mut state.status, op.transitional());
            (previous, state.op)
        };
        self.emit_change(previous, op.transitional());

        let outcome = match op {
            Op::Start => self.api.start(ctx).await,
            Op::Stop => self.api.stop(ctx).await,
        };

        let settled = match &outcome {
            Ok(SimulatorStatus::Unknown) => op.transitional(),
            Ok(reported) => *reported,
            Err(_) => SimulatorStatus::Error,
        };
        if let Err(current) = self.settle(ticket, settled) {
            // The newer operation owns the status and reports its own outcome
            debug!(
                operation = op.name(),
                status = %current,
                error = ?outcome.as_ref().err().map(|e| e.to_string()),
                "simulator_operation_superseded"
            );
            return SimulatorOpResult::ok(current);
        }

        match outcome {
            Ok(_) => {
                info!(operation = op.name(), status = %settled, "simulator_operation_ok");
                SimulatorOpResult::ok(settled)
            }
            Err(e) => {
                let error = e.to_string();
                warn!(operation = op.name(), error = %error, "simulator_operation_failed");
                self.listeners.emit(&SimulatorEvent::OperationFailed {
                    operation: op.name(),
                    error: error.clone(),
                });
                SimulatorOpResult::failed(SimulatorStatus::Error, error)
            }
        }
    }

    /// Apply the completion of operation `ticket`; Err with the current
    /// status when a newer operation has taken over
    fn settle(&self, ticket: u64, to: SimulatorStatus) -> Result<(), SimulatorStatus> {
        let from = {
            let mut state = self.state.lock();
            if state.op != ticket {
                return Err(state.status);
            }
            std::mem::replace(&mut state.status, to)
        };
        self.emit_change(from, to);
        Ok(())
    }

    fn set(&self, to: SimulatorStatus) {
        let from = std::mem::replace(&mut self.state.lock().status, to);
        self.emit_change(from, to);
    }

    fn emit_change(&self, from: SimulatorStatus, to: SimulatorStatus) {
        if from != to {
            self.listeners.emit(&SimulatorEvent::StatusChanged { from, to });
        }
    }
}
