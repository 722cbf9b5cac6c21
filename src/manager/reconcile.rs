//! Desired-state planning
//!
//! `plan` is a pure function of a snapshot of everything reconciliation
//! depends on. The manager takes the snapshot, plans, and executes; it never
//! decides inline.

use crate::models::{ConnectionStatus, DesiredState, DisconnectReason};
use crate::resilience::ResilienceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileInputs {
    pub auth_resolved: bool,
    pub authenticated: bool,
    pub device_invalidated: bool,
    pub resilience: ResilienceState,
    pub status: ConnectionStatus,
    pub desired: DesiredState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Wait for auth to resolve or the breaker to allow attempts
    Defer,
    Connect,
    Disconnect(DisconnectReason),
    Converged,
}

pub fn plan(inputs: &ReconcileInputs) -> Action {
    if !inputs.auth_resolved {
        return Action::Defer;
    }

    let identity_ok = inputs.authenticated && !inputs.device_invalidated;
    if !identity_ok && inputs.desired.connected {
        // A live retry loop or breaker hold still needs tearing down
        if inputs.status == ConnectionStatus::Disconnected
            && inputs.resilience == ResilienceState::Idle
        {
            return Action::Converged;
        }
        let reason = if inputs.authenticated {
            DisconnectReason::DeviceIdInvalidated
        } else {
            DisconnectReason::AuthLost
        };
        return Action::Disconnect(reason);
    }

    let breaker_holding = matches!(
        inputs.resilience,
        ResilienceState::Suspended | ResilienceState::GivenUp | ResilienceState::Attempting
    );
    if inputs.desired.connected && breaker_holding {
        return Action::Defer;
    }

    if inputs.desired.connected && inputs.status == ConnectionStatus::Disconnected {
        return Action::Connect;
    }

    if !inputs.desired.connected && inputs.status != ConnectionStatus::Disconnected {
        return Action::Disconnect(DisconnectReason::UserRequested);
    }

    Action::Converged
}
