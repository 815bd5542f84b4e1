//! Envelopes and the payloads they carry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CellId, ConflictReport, CorrelationId, EnvelopeId, Priority};

/// Routing direction of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Parent to child
    Downward,
    /// Child to parent
    Upward,
    /// Between siblings of one peer group
    Lateral,
    /// To every subscriber of a topic
    Broadcast,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Downward => write!(f, "downward"),
            Self::Upward => write!(f, "upward"),
            Self::Lateral => write!(f, "lateral"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Closed set of message payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Payload {
    Instruction {
        text: String,
    },
    Progress {
        fraction: f64,
        note: String,
    },
    Clarify {
        subtask: String,
        question: String,
    },
    ClarifyReply {
        #[serde(rename = "question-id")]
        question_id: EnvelopeId,
        answer: Option<String>,
    },
    Partial {
        output: String,
        confidence: f64,
    },
    Insight {
        text: String,
    },
    Escalate {
        reason: String,
    },
    Blocked {
        reason: String,
    },
    ConflictReport {
        report: Box<ConflictReport>,
    },
    Abort {
        reason: String,
    },
    DeliveryFailure {
        envelope: EnvelopeId,
        undeliverable: Vec<CellId>,
        reason: String,
    },
    PressureWarning {
        pressure: f64,
    },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Instruction { .. } => "instruction",
            Self::Progress { .. } => "progress",
            Self::Clarify { .. } => "clarify",
            Self::ClarifyReply { .. } => "clarify-reply",
            Self::Partial { .. } => "partial",
            Self::Insight { .. } => "insight",
            Self::Escalate { .. } => "escalate",
            Self::Blocked { .. } => "blocked",
            Self::ConflictReport { .. } => "conflict-report",
            Self::Abort { .. } => "abort",
            Self::DeliveryFailure { .. } => "delivery-failure",
            Self::PressureWarning { .. } => "pressure-warning",
        }
    }

    /// Priority an envelope gets unless the sender overrides it
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Abort { .. } => Priority::Critical,
            Self::Escalate { .. }
            | Self::Blocked { .. }
            | Self::Clarify { .. }
            | Self::ClarifyReply { .. }
            | Self::DeliveryFailure { .. }
            | Self::PressureWarning { .. } => Priority::High,
            Self::Instruction { .. } | Self::Partial { .. } | Self::ConflictReport { .. } => Priority::Normal,
            Self::Progress { .. } | Self::Insight { .. } => Priority::Low,
        }
    }

    /// Directions this payload may travel
    fn allowed(&self, direction: Direction) -> bool {
        use Direction::*;
        match self {
            Self::Instruction { .. } => matches!(direction, Downward | Lateral | Broadcast),
            Self::Progress { .. }
            | Self::Clarify { .. }
            | Self::Partial { .. }
            | Self::Escalate { .. }
            | Self::Blocked { .. }
            | Self::ConflictReport { .. } => direction == Upward,
            Self::ClarifyReply { .. } | Self::Abort { .. } => direction == Downward,
            Self::Insight { .. } => matches!(direction, Upward | Lateral | Broadcast),
            Self::PressureWarning { .. } => direction == Broadcast,
            Self::DeliveryFailure { .. } => true,
        }
    }

    /// Boundary check applied before anything reaches a mailbox
    pub fn validate(&self, direction: Direction) -> Result<(), String> {
        if !self.allowed(direction) {
            return Err(format!("{} payload cannot travel {}", self.kind(), direction));
        }
        let text = match self {
            Self::Instruction { text } | Self::Insight { text } => Some(text),
            Self::Clarify { question, .. } => Some(question),
            Self::Escalate { reason } | Self::Blocked { reason } | Self::Abort { reason } => Some(reason),
            Self::Partial { output, .. } => Some(output),
            _ => None,
        };
        if text.is_some_and(|t| t.trim().is_empty()) {
            return Err(format!("{} payload has empty text", self.kind()));
        }
        let fraction = match self {
            Self::Progress { fraction, .. } => Some(*fraction),
            Self::Partial { confidence, .. } => Some(*confidence),
            Self::PressureWarning { pressure } => Some(*pressure),
            _ => None,
        };
        if let Some(f) = fraction
            && !(0.0..=1.0).contains(&f)
        {
            return Err(format!("{} payload value {} outside [0, 1]", self.kind(), f));
        }
        Ok(())
    }
}

/// An immutable routed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Envelope {
    id: EnvelopeId,
    sender: CellId,
    recipients: Vec<CellId>,
    direction: Direction,
    topic: Option<String>,
    payload: Payload,
    priority: Priority,
    correlation: CorrelationId,
    created_at: DateTime<Utc>,

    /// Cell that pays for delivery when it is not the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relayed_by: Option<CellId>,
}

impl Envelope {
    fn build(
        sender: CellId,
        recipients: Vec<CellId>,
        direction: Direction,
        topic: Option<String>,
        payload: Payload,
        correlation: CorrelationId,
    ) -> Self {
        Self {
            id: EnvelopeId::new(),
            priority: payload.default_priority(),
            sender,
            recipients,
            direction,
            topic,
            payload,
            correlation,
            created_at: Utc::now(),
            relayed_by: None,
        }
    }

    /// Child to parent
    pub fn upward(sender: CellId, parent: CellId, payload: Payload, correlation: CorrelationId) -> Self {
        Self::build(sender, vec![parent], Direction::Upward, None, payload, correlation)
    }

    /// Parent to child
    pub fn downward(sender: CellId, child: CellId, payload: Payload, correlation: CorrelationId) -> Self {
        Self::build(sender, vec![child], Direction::Downward, None, payload, correlation)
    }

    /// Sibling to siblings in the same peer group
    pub fn lateral(sender: CellId, peers: Vec<CellId>, payload: Payload, correlation: CorrelationId) -> Self {
        Self::build(sender, peers, Direction::Lateral, None, payload, correlation)
    }

    /// To every subscriber of `topic`
    pub fn broadcast(sender: CellId, topic: impl Into<String>, payload: Payload, correlation: CorrelationId) -> Self {
        Self::build(sender, Vec::new(), Direction::Broadcast, Some(topic.into()), payload, correlation)
    }

    /// Returned-to-sender notice for recipients that could not be reached
    pub(crate) fn delivery_failure(original: &Envelope, undeliverable: Vec<CellId>, reason: String) -> Self {
        Self::build(
            original.sender.clone(),
            vec![original.sender.clone()],
            original.direction,
            None,
            Payload::DeliveryFailure {
                envelope: original.id,
                undeliverable,
                reason,
            },
            original.correlation,
        )
    }

    /// Charge delivery to `relay` instead of the sender
    pub fn relayed_by(mut self, relay: CellId) -> Self {
        self.relayed_by = Some(relay);
        self
    }

    /// Override the payload's default priority before sending
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn sender(&self) -> &CellId {
        &self.sender
    }

    /// Cell metered and rate limited for this envelope
    pub fn payer(&self) -> &CellId {
        self.relayed_by.as_ref().unwrap_or(&self.sender)
    }

    pub fn recipients(&self) -> &[CellId] {
        &self.recipients
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn correlation(&self) -> CorrelationId {
        self.correlation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
