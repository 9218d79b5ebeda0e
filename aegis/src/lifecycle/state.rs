//! Pure instance state machine.
//!
//! The manager consults [`next`] before mutating anything; the same table
//! drives [`Simulator`], the side-effect-free model the property tests
//! compare the live manager against. A rejected transition is a state
//! conflict and must leave no side effects.

use aegis_shared::errors::{AegisError, AegisResult};

use crate::types::InstanceState;

/// Inputs that can move an instance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Operator start request (also re-enables a disabled instance).
    Start,
    /// Harness handshake completed.
    StartOk,
    /// Boot failed; resources were rolled back.
    StartFail,
    /// Operator stop request. Idempotent.
    Stop,
    /// Stop plus `enabled = false`.
    Disable,
    /// Operator pause request.
    Pause,
    /// Operator resume or wake-on-connect.
    Resume,
    /// Idle watchdog: running → paused.
    IdlePause,
    /// Idle watchdog: paused → stopped.
    IdleStop,
    /// Guest main command exited cleanly.
    ProcessExit,
    /// Hypervisor died or the harness dropped while the VM was alive.
    BackendLost,
}

/// Result of applying an op: the successor state and the new enabled flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Next {
    pub state: InstanceState,
    pub enabled: bool,
}

/// The transition table. Returns a conflict for ops that are invalid in the
/// current state; idempotent ops (stop on stopped) return the current state
/// unchanged.
pub fn next(state: InstanceState, enabled: bool, op: Op) -> AegisResult<Next> {
    use InstanceState::*;

    let accept = |state, enabled| Ok(Next { state, enabled });
    let conflict = |why: String| Err(AegisError::Conflict(why));

    match op {
        Op::Start => match state {
            Stopped | Disabled | Failed => accept(Starting, true),
            Starting | Running | Paused => {
                conflict(format!("instance is already {state}"))
            }
            Creating => conflict("instance is still being created".into()),
        },
        Op::StartOk => match state {
            Starting => accept(Running, enabled),
            _ => conflict(format!("start completion in state {state}")),
        },
        Op::StartFail => match state {
            Starting => accept(Failed, enabled),
            _ => conflict(format!("start failure in state {state}")),
        },
        Op::Stop => match state {
            Stopped => accept(Stopped, enabled),
            Disabled => accept(Disabled, enabled),
            Running | Paused | Starting | Failed | Creating => accept(Stopped, enabled),
        },
        Op::Disable => accept(Disabled, false),
        Op::Pause => match state {
            Running => accept(Paused, enabled),
            Paused => accept(Paused, enabled),
            _ => conflict(format!("cannot pause a {state} instance")),
        },
        Op::Resume => match state {
            Paused => accept(Running, enabled),
            Running => accept(Running, enabled),
            _ => conflict(format!("cannot resume a {state} instance")),
        },
        Op::IdlePause => match state {
            Running => accept(Paused, enabled),
            // Watchdog raced an operator action; nothing to do.
            _ => accept(state, enabled),
        },
        Op::IdleStop => match state {
            Paused => accept(Stopped, enabled),
            _ => accept(state, enabled),
        },
        Op::ProcessExit => match state {
            Running | Paused | Starting => accept(Stopped, enabled),
            _ => accept(state, enabled),
        },
        Op::BackendLost => match state {
            Running | Paused | Starting => accept(Failed, enabled),
            _ => accept(state, enabled),
        },
    }
}

/// Side-effect-free model of a single instance, starting where `create`
/// leaves a real one: `stopped`, enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Simulator {
    pub state: InstanceState,
    pub enabled: bool,
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            state: InstanceState::Stopped,
            enabled: true,
        }
    }

    /// Apply an op; invalid ops leave the model untouched, mirroring the
    /// no-side-effects contract for rejected operations.
    pub fn apply(&mut self, op: Op) -> AegisResult<()> {
        match next(self.state, self.enabled, op) {
            Ok(next) => {
                self.state = next.state;
                self.enabled = next.enabled;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}
