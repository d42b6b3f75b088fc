//! Coordinator operations
//!
//! Connection handling, signup verification, dispatch, report acceptance and
//! deadline expiry. Signature and correlation failures are absorbed here:
//! they are logged and the offending frame is dropped, never propagated in a
//! way that could take the hub down.

use chrono::Utc;
use pulse_core::config::HubConfig;
use pulse_core::protocol::{
    AgentMessage, HubMessage, SignupAck, SignupRequest, ValidateAssignment,
};
use pulse_core::signer::{is_valid_public_key, report_message, signup_message, verify};
use pulse_core::{
    Assignment, ProbeStatus, PulseError, Result, SignedReport, Tick, TickSource, Validator,
};
use pulse_settlement::Ledger;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::assignments::AssignmentTable;
use crate::registry::ValidatorRegistry;
use crate::sessions::{Bind, SessionId, SessionTable};
use crate::ticks::TickLog;

/// A validator as shown on the admin surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorStatus {
    #[serde(flatten)]
    pub validator: Validator,
    pub online: bool,
}

pub struct Hub {
    config: HubConfig,
    registry: ValidatorRegistry,
    sessions: SessionTable,
    assignments: AssignmentTable,
    ledger: Arc<Ledger>,
    ticks: TickLog,
}

impl Hub {
    /// Build a hub over `ledger`, restoring known validators from its accounts
    pub async fn new(config: HubConfig, ledger: Arc<Ledger>) -> Self {
        let registry = ValidatorRegistry::from_accounts(ledger.accounts().await);
        info!("Hub restored {} known validators", registry.len().await);
        let ticks = TickLog::new(config.max_ticks);
        Self {
            config,
            registry,
            sessions: SessionTable::default(),
            assignments: AssignmentTable::default(),
            ledger,
            ticks,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Track a new connection; frames for it are queued on `outbound`
    pub async fn register_connection(
        &self,
        outbound: mpsc::UnboundedSender<HubMessage>,
    ) -> SessionId {
        let session_id = self.sessions.register(outbound).await;
        info!("Session {} opened", session_id);
        session_id
    }

    /// Forget a connection. Its outstanding assignments run to their deadline.
    pub async fn close_connection(&self, session_id: SessionId) {
        match self.sessions.remove(session_id).await {
            Some(validator_id) => info!(
                "Session {} closed (validator {})",
                session_id, validator_id
            ),
            None => info!("Session {} closed before signup", session_id),
        }
    }

    /// Route one text frame received on `session_id`
    pub async fn handle_frame(&self, session_id: SessionId, text: &str) {
        let message = match AgentMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed frame on session {}: {}", session_id, e);
                return;
            }
        };

        match message {
            AgentMessage::Signup(request) => {
                let reply = self.handle_signup(session_id, request).await;
                if !self.sessions.send(session_id, reply).await {
                    debug!("Session {} went away before the signup reply", session_id);
                }
            }
            AgentMessage::Validate(report) => {
                if let Err(e) = self.handle_report(session_id, report.into()).await {
                    warn!("Discarded report on session {}: {}", session_id, e);
                }
            }
        }
    }

    /// Verify a signup and bind the session to its validator
    ///
    /// Returns the reply for this session only. A failed verification never
    /// creates or reuses an identity.
    pub async fn handle_signup(
        &self,
        session_id: SessionId,
        request: SignupRequest,
    ) -> HubMessage {
        let callback_id = request.callback_id.clone();
        match self.verify_signup(session_id, request).await {
            Ok(validator_id) => HubMessage::Signup(SignupAck {
                callback_id,
                validator_id,
            }),
            Err(e) => {
                warn!("Rejected signup on session {}: {}", session_id, e);
                HubMessage::error(Some(callback_id), e.to_string())
            }
        }
    }

    async fn verify_signup(
        &self,
        session_id: SessionId,
        request: SignupRequest,
    ) -> Result<String> {
        if !is_valid_public_key(&request.public_key) {
            return Err(PulseError::Authentication(
                "public key is not a valid Ed25519 key".to_string(),
            ));
        }

        let message = signup_message(&request.callback_id, &request.public_key);
        if !verify(
            message.as_bytes(),
            &request.signed_message,
            &request.public_key,
        ) {
            return Err(PulseError::Authentication(
                "signup signature does not verify".to_string(),
            ));
        }

        if let Some(bound) = self.sessions.validator_of(session_id).await {
            let same_key = self
                .registry
                .get(&bound)
                .await
                .map(|record| record.public_key == request.public_key)
                .unwrap_or(false);
            if !same_key {
                return Err(PulseError::Authentication(format!(
                    "session is already registered as validator {}",
                    bound
                )));
            }
        }

        let (record, created) = self
            .registry
            .lookup_or_create(
                &self.ledger,
                &request.public_key,
                &request.ip,
                request.location,
            )
            .await
            .map_err(|e| PulseError::Other(format!("Failed to open ledger account: {}", e)))?;

        match self.sessions.bind(session_id, &record.id).await {
            Bind::Bound | Bind::Unchanged => {}
            Bind::Conflict(existing) => {
                return Err(PulseError::Authentication(format!(
                    "session is already registered as validator {}",
                    existing
                )));
            }
            Bind::UnknownSession => {
                return Err(PulseError::Transport(format!(
                    "session {} is closed",
                    session_id
                )));
            }
        }

        info!(
            "Signup accepted on session {}: validator {}{}",
            session_id,
            record.id,
            if created { " (new)" } else { "" }
        );
        Ok(record.id)
    }

    /// Send a probe of `url` to `replicas` distinct online validators
    pub async fn dispatch_assignment(
        &self,
        url: &str,
        website_id: &str,
    ) -> Result<Vec<Assignment>> {
        let targets = self.sessions.select(self.config.replicas).await;
        if targets.is_empty() {
            return Err(PulseError::NoValidatorsOnline);
        }

        let mut dispatched = Vec::with_capacity(targets.len());
        for (session_id, validator_id) in targets {
            let assignment = Assignment::new(
                url,
                website_id,
                validator_id.clone(),
                self.config.assignment_timeout(),
            );
            let correlation_id = assignment.correlation_id.clone();

            // Registered before sending so a fast reply always finds it
            self.assignments.insert(assignment.clone()).await;

            let message = HubMessage::Validate(ValidateAssignment {
                url: url.to_string(),
                callback_id: correlation_id.clone(),
                website_id: website_id.to_string(),
            });
            if self.sessions.send(session_id, message).await {
                debug!(
                    "Dispatched {} ({}) to validator {} as {}",
                    url, website_id, validator_id, correlation_id
                );
                dispatched.push(assignment);
            } else {
                self.assignments.take(&correlation_id).await;
                debug!("Session {} closed during dispatch", session_id);
            }
        }

        if dispatched.is_empty() {
            return Err(PulseError::NoValidatorsOnline);
        }
        info!(
            "Dispatched {} to {} validator(s)",
            website_id,
            dispatched.len()
        );
        Ok(dispatched)
    }

    /// Accept a report only if it answers an outstanding assignment of the
    /// reporting validator, before the deadline, with a valid signature
    pub async fn handle_report(
        &self,
        session_id: SessionId,
        report: SignedReport,
    ) -> Result<Tick> {
        let session_validator = self.sessions.validator_of(session_id).await.ok_or_else(|| {
            PulseError::Authentication("report on a session without signup".to_string())
        })?;

        if report.validator_id != session_validator {
            return Err(PulseError::Authentication(format!(
                "report claims validator {} on a session registered as {}",
                report.validator_id, session_validator
            )));
        }

        let assignment = self
            .assignments
            .get(&report.correlation_id)
            .await
            .ok_or_else(|| PulseError::CorrelationMismatch(report.correlation_id.clone()))?;

        if assignment.validator_id != session_validator {
            return Err(PulseError::CorrelationMismatch(format!(
                "{} was issued to another validator",
                report.correlation_id
            )));
        }
        if assignment.website_id != report.website_id {
            return Err(PulseError::Protocol(format!(
                "report for {} names website {}, assignment was for {}",
                report.correlation_id, report.website_id, assignment.website_id
            )));
        }
        if assignment.is_overdue(Instant::now()) {
            return Err(PulseError::CorrelationMismatch(format!(
                "{} arrived after its deadline",
                report.correlation_id
            )));
        }

        let record = self
            .registry
            .get(&session_validator)
            .await
            .ok_or_else(|| PulseError::ValidatorNotFound(session_validator.clone()))?;
        let message = report_message(&report.correlation_id);
        if !verify(message.as_bytes(), &report.signature, &record.public_key) {
            return Err(PulseError::Authentication(format!(
                "report signature for {} does not verify",
                report.correlation_id
            )));
        }

        // Exactly one of report and sweep gets the assignment
        let assignment = self
            .assignments
            .take(&report.correlation_id)
            .await
            .ok_or_else(|| PulseError::CorrelationMismatch(report.correlation_id.clone()))?;

        let tick = Tick {
            website_id: assignment.website_id,
            validator_id: assignment.validator_id.clone(),
            status: report.status,
            latency_ms: Some(report.latency_ms),
            source: TickSource::Report,
            recorded_at: Utc::now(),
        };

        let reward = self.config.reward_per_report;
        match self.ledger.credit(&assignment.validator_id, reward).await {
            Ok(pending) => info!(
                "Report accepted: {} {} in {}ms by {} (pending {})",
                tick.website_id, tick.status, report.latency_ms, tick.validator_id, pending
            ),
            Err(e) => {
                error!(
                    "Reward for {} on {} was not credited: {}",
                    assignment.validator_id, assignment.correlation_id, e
                );
                return Err(PulseError::Other(format!("Failed to credit reward: {}", e)));
            }
        }

        // Only credited reports show up as accepted
        self.ticks.push(tick.clone()).await;
        Ok(tick)
    }

    /// Expire overdue assignments as `Bad` ticks with no reward
    pub async fn expire_assignments(&self) -> Vec<Tick> {
        self.expire_assignments_at(Instant::now()).await
    }

    pub async fn expire_assignments_at(&self, now: Instant) -> Vec<Tick> {
        let expired = self.assignments.expire_overdue(now).await;
        let mut ticks = Vec::with_capacity(expired.len());
        for assignment in expired {
            info!(
                "Assignment {} for {} timed out (validator {})",
                assignment.correlation_id, assignment.website_id, assignment.validator_id
            );
            let tick = Tick {
                website_id: assignment.website_id,
                validator_id: assignment.validator_id,
                status: ProbeStatus::Bad,
                latency_ms: None,
                source: TickSource::Timeout,
                recorded_at: Utc::now(),
            };
            self.ticks.push(tick.clone()).await;
            ticks.push(tick);
        }
        ticks
    }

    /// Every known validator with its balance and whether it is connected
    pub async fn validators(&self) -> Vec<ValidatorStatus> {
        let online = self.sessions.online_validators().await;
        let mut statuses = Vec::new();
        for record in self.registry.all().await {
            let pending = self.ledger.pending_amount(&record.id).await.unwrap_or(0);
            statuses.push(ValidatorStatus {
                online: online.contains(&record.id),
                validator: record.with_balance(pending),
            });
        }
        statuses
    }

    pub async fn recent_ticks(&self) -> Vec<Tick> {
        self.ticks.recent().await
    }

    pub async fn outstanding_assignments(&self) -> usize {
        self.assignments.len().await
    }
}
