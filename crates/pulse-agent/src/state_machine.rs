//! Pure state machine for the agent's hub session
//!
//! transition(state, event) -> (state, actions), with NO I/O. The session
//! driver feeds it socket events and executes the returned actions.
//!
//! Unlike a workflow engine, an agent never gives up: unexpected events are
//! ignored (and logged by the driver), and every failure path ends in
//! `Disconnected` with a reconnect scheduled.

use pulse_core::protocol::ValidateAssignment;
use pulse_core::{CorrelationId, ValidatorId};

/// Session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// No transport; waiting to (re)connect
    Disconnected,
    /// Transport connect in progress
    Connecting,
    /// Signup sent, waiting for the matching acknowledgement
    AwaitingSignupAck { callback_id: CorrelationId },
    /// Identity issued; assignments are accepted
    Registered { validator_id: ValidatorId },
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingSignupAck { .. } => "awaiting_signup_ack",
            Self::Registered { .. } => "registered",
        }
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Process start or reconnect timer fired
    Start,
    /// Transport connected; `callback_id` is freshly generated for signup
    Connected { callback_id: CorrelationId },
    /// Hub acknowledged a signup
    SignupAcknowledged {
        callback_id: CorrelationId,
        validator_id: ValidatorId,
    },
    /// Hub rejected a signup
    SignupRejected {
        callback_id: CorrelationId,
        message: String,
    },
    /// The pending signup was evicted before any reply
    SignupTimedOut { callback_id: CorrelationId },
    /// Hub sent a probe assignment
    AssignmentReceived { assignment: ValidateAssignment },
    /// Transport error or close
    TransportClosed { reason: String },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport
    Connect,
    /// Sign and send a signup request under `callback_id`
    SendSignup { callback_id: CorrelationId },
    /// Signup succeeded; reset the reconnect backoff
    ResetBackoff,
    /// Probe the target and send a signed report
    RunProbe {
        assignment: ValidateAssignment,
        validator_id: ValidatorId,
    },
    /// Drop the transport and reconnect after a backoff delay
    ScheduleReconnect,
    /// Log activity
    LogActivity { message: String },
    /// Event did not apply in this state
    Ignore { reason: String },
}

/// Pure state transition function
///
/// Deterministic, no side effects, never panics.
pub fn transition(state: State, event: Event) -> (State, Vec<Action>) {
    match (state, event) {
        // Any state: transport loss
        (State::Disconnected, Event::TransportClosed { .. }) => (State::Disconnected, vec![]),

        (state, Event::TransportClosed { reason }) => (
            State::Disconnected,
            vec![
                Action::LogActivity {
                    message: format!("Connection lost while {}: {}", state.name(), reason),
                },
                Action::ScheduleReconnect,
            ],
        ),

        // From Disconnected
        (State::Disconnected, Event::Start) => (State::Connecting, vec![Action::Connect]),

        // From Connecting
        (State::Connecting, Event::Connected { callback_id }) => {
            let actions = vec![
                Action::LogActivity {
                    message: format!("Connected, sending signup {}", callback_id),
                },
                Action::SendSignup {
                    callback_id: callback_id.clone(),
                },
            ];
            (State::AwaitingSignupAck { callback_id }, actions)
        }

        // From AwaitingSignupAck
        (
            State::AwaitingSignupAck { callback_id },
            Event::SignupAcknowledged {
                callback_id: acked,
                validator_id,
            },
        ) => {
            if acked == callback_id {
                let actions = vec![
                    Action::LogActivity {
                        message: format!("Signed up with validatorId: {}", validator_id),
                    },
                    Action::ResetBackoff,
                ];
                (State::Registered { validator_id }, actions)
            } else {
                (
                    State::AwaitingSignupAck { callback_id },
                    vec![Action::Ignore {
                        reason: format!("Signup ack for unknown callback {}", acked),
                    }],
                )
            }
        }

        (
            State::AwaitingSignupAck { callback_id },
            Event::SignupRejected {
                callback_id: rejected,
                message,
            },
        ) => {
            if rejected == callback_id {
                (
                    State::Disconnected,
                    vec![
                        Action::LogActivity {
                            message: format!("Signup rejected: {}", message),
                        },
                        Action::ScheduleReconnect,
                    ],
                )
            } else {
                (
                    State::AwaitingSignupAck { callback_id },
                    vec![Action::Ignore {
                        reason: format!("Rejection for unknown callback {}", rejected),
                    }],
                )
            }
        }

        (
            State::AwaitingSignupAck { callback_id },
            Event::SignupTimedOut {
                callback_id: expired,
            },
        ) => {
            if expired == callback_id {
                (
                    State::Disconnected,
                    vec![
                        Action::LogActivity {
                            message: format!("Signup {} timed out", expired),
                        },
                        Action::ScheduleReconnect,
                    ],
                )
            } else {
                (
                    State::AwaitingSignupAck { callback_id },
                    vec![Action::Ignore {
                        reason: format!("Timeout for unknown callback {}", expired),
                    }],
                )
            }
        }

        // From Registered: each assignment is a transient Assigned step
        (State::Registered { validator_id }, Event::AssignmentReceived { assignment }) => {
            let actions = vec![Action::RunProbe {
                assignment,
                validator_id: validator_id.clone(),
            }];
            (State::Registered { validator_id }, actions)
        }

        // Everything else is ignored in place
        (state, event) => {
            let reason = format!("{} cannot handle {:?}", state.name(), event);
            (state, vec![Action::Ignore { reason }])
        }
    }
}
