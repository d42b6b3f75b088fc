//! JSON wire protocol between validator agents and the hub
//!
//! Every frame is a text message shaped `{"type": ..., "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::{CorrelationId, ProbeStatus, Result, SignedReport, ValidatorId, WebsiteId};

/// Frames sent by an agent to the hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentMessage {
    Signup(SignupRequest),
    Validate(ValidateReport),
}

/// Frames sent by the hub to an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HubMessage {
    Signup(SignupAck),
    Validate(ValidateAssignment),
    Error(ErrorReply),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub callback_id: CorrelationId,
    pub ip: String,
    pub public_key: String,
    pub signed_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupAck {
    pub callback_id: CorrelationId,
    pub validator_id: ValidatorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateAssignment {
    pub url: String,
    pub callback_id: CorrelationId,
    pub website_id: WebsiteId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateReport {
    pub callback_id: CorrelationId,
    pub status: ProbeStatus,
    pub latency: u64,
    pub website_id: WebsiteId,
    pub validator_id: ValidatorId,
    pub signed_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<CorrelationId>,
    pub message: String,
}

impl From<ValidateReport> for SignedReport {
    fn from(r: ValidateReport) -> Self {
        Self {
            correlation_id: r.callback_id,
            status: r.status,
            latency_ms: r.latency,
            website_id: r.website_id,
            validator_id: r.validator_id,
            signature: r.signed_message,
        }
    }
}

impl From<SignedReport> for ValidateReport {
    fn from(r: SignedReport) -> Self {
        Self {
            callback_id: r.correlation_id,
            status: r.status,
            latency: r.latency_ms,
            website_id: r.website_id,
            validator_id: r.validator_id,
            signed_message: r.signature,
        }
    }
}

impl AgentMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl HubMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn error(callback_id: Option<CorrelationId>, message: impl Into<String>) -> Self {
        Self::Error(ErrorReply {
            callback_id,
            message: message.into(),
        })
    }
}
