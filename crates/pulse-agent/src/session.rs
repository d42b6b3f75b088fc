//! Validator agent driver
//!
//! Owns the persistent connection to the hub. A single receive loop per
//! connection feeds socket events into [`transition`] and executes the
//! returned actions. Probes run on spawned tasks and hand their signed
//! reports back to the loop for sending.

use futures::{SinkExt, StreamExt};
use pulse_core::config::AgentConfig;
use pulse_core::protocol::{AgentMessage, HubMessage, SignupAck, SignupRequest, ValidateReport};
use pulse_core::signer::{report_message, signup_message};
use pulse_core::{new_correlation_id, PulseError, Result, Signer};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::pending::PendingCallbacks;
use crate::probe::Prober;
use crate::state_machine::{transition, Action, Event, State};

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// A validator agent bound to one keypair
pub struct ValidatorAgent {
    config: AgentConfig,
    signer: Arc<Signer>,
    prober: Arc<Prober>,
}

impl ValidatorAgent {
    pub fn new(config: AgentConfig, signer: Signer) -> Result<Self> {
        let prober = Prober::new(config.probe_timeout())?;
        Ok(Self {
            config,
            signer: Arc::new(signer),
            prober: Arc::new(prober),
        })
    }

    pub fn public_key(&self) -> String {
        self.signer.public_key()
    }

    /// Run forever: connect, sign up, serve assignments, reconnect on loss
    ///
    /// Transport errors never end the process; they trigger a reconnect with
    /// bounded exponential backoff and a fresh signup.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.initial_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
        );

        info!(
            "Validator agent starting with public key {}",
            self.signer.public_key()
        );

        loop {
            let (state, actions) = transition(State::Disconnected, Event::Start);
            debug!("Agent state: {}", state.name());

            for action in actions {
                match action {
                    Action::Connect => match self.connect().await {
                        Ok(socket) => {
                            info!("Connected to hub at {}", self.config.hub_url);
                            self.run_session(socket, &mut backoff).await;
                        }
                        Err(e) => {
                            warn!("Failed to connect to hub: {}", e);
                        }
                    },
                    other => debug!("Skipping {:?} while disconnected", other),
                }
            }

            let delay = backoff.next_delay();
            warn!(
                "Reconnecting in {}ms (attempt {})",
                delay.as_millis(),
                backoff.attempts()
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(&self) -> Result<HubSocket> {
        let connect = connect_async(self.config.hub_url.as_str());
        match tokio::time::timeout(self.config.pending_ttl(), connect).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(PulseError::Transport(e.to_string())),
            Err(_) => Err(PulseError::Transport(format!(
                "connect timed out after {:?}",
                self.config.pending_ttl()
            ))),
        }
    }

    /// Drive one connection until it must be torn down
    async fn run_session(&self, socket: HubSocket, backoff: &mut Backoff) {
        let (mut sink, mut stream) = socket.split();
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<AgentMessage>();
        let pending: PendingCallbacks<SignupAck> = PendingCallbacks::new(self.config.pending_ttl());
        let mut signup_rx: Option<oneshot::Receiver<SignupAck>> = None;

        let mut heartbeat =
            tokio::time::interval(self.config.heartbeat_interval().max(Duration::from_secs(1)));
        let mut sweep = tokio::time::interval((self.config.pending_ttl() / 4).max(MIN_SWEEP_INTERVAL));

        let mut state = State::Connecting;
        let mut queue = VecDeque::from([Event::Connected {
            callback_id: new_correlation_id(),
        }]);

        loop {
            while let Some(event) = queue.pop_front() {
                let (next, actions) = transition(state, event);
                state = next;

                for action in actions {
                    match action {
                        Action::SendSignup { callback_id } => {
                            signup_rx = Some(pending.register(callback_id.clone()).await);
                            let message = self.signup_request(&callback_id);
                            if let Err(e) = send(&mut sink, &message).await {
                                queue.push_back(Event::TransportClosed {
                                    reason: e.to_string(),
                                });
                            } else {
                                info!("Sent signup request to hub");
                            }
                        }
                        Action::RunProbe {
                            assignment,
                            validator_id,
                        } => {
                            let prober = Arc::clone(&self.prober);
                            let signer = Arc::clone(&self.signer);
                            let tx = report_tx.clone();
                            tokio::spawn(async move {
                                let signed_message =
                                    signer.sign(report_message(&assignment.callback_id).as_bytes());
                                let outcome = prober.probe(&assignment.url).await;
                                info!(
                                    "Validation result: {} is {} ({}ms)",
                                    assignment.url, outcome.status, outcome.latency_ms
                                );
                                let report = AgentMessage::Validate(ValidateReport {
                                    callback_id: assignment.callback_id,
                                    status: outcome.status,
                                    latency: outcome.latency_ms,
                                    website_id: assignment.website_id,
                                    validator_id,
                                    signed_message,
                                });
                                // Receiver gone means the session ended; the hub will time it out
                                let _ = tx.send(report);
                            });
                        }
                        Action::ResetBackoff => backoff.reset(),
                        Action::LogActivity { message } => info!("{}", message),
                        Action::Ignore { reason } => warn!("Ignoring event: {}", reason),
                        Action::ScheduleReconnect => {
                            let _ = sink.close().await;
                            return;
                        }
                        // Only issued from Disconnected, which `run` drives
                        Action::Connect => debug!("Already connected"),
                    }
                }
            }

            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(event) = self.handle_frame(&text, &pending).await {
                            queue.push_back(event);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        queue.push_back(Event::TransportClosed {
                            reason: "closed by hub".to_string(),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        queue.push_back(Event::TransportClosed {
                            reason: e.to_string(),
                        });
                    }
                },
                ack = recv_pending(&mut signup_rx) => {
                    signup_rx = None;
                    if let Ok(ack) = ack {
                        queue.push_back(Event::SignupAcknowledged {
                            callback_id: ack.callback_id,
                            validator_id: ack.validator_id,
                        });
                    }
                }
                Some(report) = report_rx.recv() => {
                    if let Err(e) = send(&mut sink, &report).await {
                        queue.push_back(Event::TransportClosed {
                            reason: e.to_string(),
                        });
                    }
                }
                _ = heartbeat.tick() => {
                    info!("Heartbeat: validator still running ({})", state.name());
                }
                _ = sweep.tick() => {
                    for callback_id in pending.evict_expired().await {
                        queue.push_back(Event::SignupTimedOut { callback_id });
                    }
                }
            }
        }
    }

    /// Translate an inbound frame into a state machine event
    ///
    /// Signup replies resolve their pending continuation instead; the event
    /// then arrives through the continuation.
    async fn handle_frame(
        &self,
        text: &str,
        pending: &PendingCallbacks<SignupAck>,
    ) -> Option<Event> {
        let message = match HubMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed message from hub: {}", e);
                return None;
            }
        };

        match message {
            HubMessage::Signup(ack) => {
                let callback_id = ack.callback_id.clone();
                if !pending.complete(&callback_id, ack).await {
                    warn!(
                        "{}",
                        PulseError::CorrelationMismatch(format!("signup reply {}", callback_id))
                    );
                }
                None
            }
            HubMessage::Validate(assignment) => {
                info!("Validating URL: {}", assignment.url);
                Some(Event::AssignmentReceived { assignment })
            }
            HubMessage::Error(reply) => match reply.callback_id {
                Some(callback_id) if pending.cancel(&callback_id).await => {
                    Some(Event::SignupRejected {
                        callback_id,
                        message: reply.message,
                    })
                }
                _ => {
                    warn!("Hub reported an error: {}", reply.message);
                    None
                }
            },
        }
    }

    fn signup_request(&self, callback_id: &str) -> AgentMessage {
        let public_key = self.signer.public_key();
        let signed_message = self
            .signer
            .sign(signup_message(callback_id, &public_key).as_bytes());
        AgentMessage::Signup(SignupRequest {
            callback_id: callback_id.to_string(),
            ip: self.config.ip.clone(),
            public_key,
            signed_message,
            location: self.config.location.clone(),
        })
    }
}

async fn send<S>(sink: &mut S, message: &AgentMessage) -> Result<()>
where
    S: futures::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = message.to_json()?;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(|e| PulseError::Transport(e.to_string()))
}

async fn recv_pending<T>(
    rx: &mut Option<oneshot::Receiver<T>>,
) -> std::result::Result<T, oneshot::error::RecvError> {
    match rx.as_mut() {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::signer::verify;

    fn agent() -> ValidatorAgent {
        ValidatorAgent::new(AgentConfig::default(), Signer::generate()).unwrap()
    }

    #[test]
    fn test_signup_request_is_verifiable() {
        let agent = agent();
        let AgentMessage::Signup(request) = agent.signup_request("cb-1") else {
            panic!("expected signup");
        };
        assert_eq!(request.public_key, agent.public_key());
        assert!(verify(
            signup_message("cb-1", &request.public_key).as_bytes(),
            &request.signed_message,
            &request.public_key,
        ));
    }

    #[tokio::test]
    async fn test_signup_reply_resolves_pending_callback() {
        let agent = agent();
        let pending = PendingCallbacks::new(Duration::from_secs(5));
        let rx = pending.register("cb-1".to_string()).await;

        let frame = r#"{"type":"signup","data":{"callbackId":"cb-1","validatorId":"v-9"}}"#;
        assert!(agent.handle_frame(frame, &pending).await.is_none());
        assert_eq!(rx.await.unwrap().validator_id, "v-9");
    }

    #[tokio::test]
    async fn test_unmatched_signup_reply_is_dropped() {
        let agent = agent();
        let pending = PendingCallbacks::new(Duration::from_secs(5));

        let frame = r#"{"type":"signup","data":{"callbackId":"stranger","validatorId":"v-9"}}"#;
        assert!(agent.handle_frame(frame, &pending).await.is_none());
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_error_reply_for_pending_signup_rejects() {
        let agent = agent();
        let pending: PendingCallbacks<SignupAck> = PendingCallbacks::new(Duration::from_secs(5));
        let _rx = pending.register("cb-1".to_string()).await;

        let frame = r#"{"type":"error","data":{"callbackId":"cb-1","message":"bad signature"}}"#;
        let event = agent.handle_frame(frame, &pending).await;
        assert!(matches!(event, Some(Event::SignupRejected { .. })));
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_assignment_and_garbage_frames() {
        let agent = agent();
        let pending: PendingCallbacks<SignupAck> = PendingCallbacks::new(Duration::from_secs(5));

        let frame = r#"{"type":"validate","data":{"url":"https://example.com","callbackId":"a-1","websiteId":"w-1"}}"#;
        assert!(matches!(
            agent.handle_frame(frame, &pending).await,
            Some(Event::AssignmentReceived { .. })
        ));

        assert!(agent.handle_frame("{not json", &pending).await.is_none());
        assert!(agent
            .handle_frame(r#"{"type":"mystery","data":{}}"#, &pending)
            .await
            .is_none());
    }
}
