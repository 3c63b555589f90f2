//! Shared types between the controller and worker-agent tooling
//!
//! These types are used by both:
//! - the bridge runtime (ractor actors, native Rust)
//! - external worker-agent tooling that speaks the same wire schema
//!
//! Serializable with serde for JSON over the shared broadcast channel.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ============================================================================
// Source Identifiers
// ============================================================================

/// Logical sender id the controller stamps on its own messages.
pub const CONTROLLER_SOURCE: &str = "controller";

/// Fixed identifier of the cooperating worker-agent.
pub const AGENT_SOURCE: &str = "scout-agent";

/// Identifier used by the local simulation stand-in.
pub const SIMULATION_SOURCE: &str = "simulation";

// ============================================================================
// Protocol Messages
// ============================================================================

/// The closed set of message kinds spoken over the broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Probe,
    ProbeReply,
    StartTask,
    Progress,
    Complete,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Probe => "probe",
            MessageKind::ProbeReply => "probe_reply",
            MessageKind::StartTask => "start_task",
            MessageKind::Progress => "progress",
            MessageKind::Complete => "complete",
            MessageKind::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One message on the shared broadcast channel.
///
/// The channel itself is untyped; everything a listener receives is decoded
/// through [`ProtocolMessage::from_value`] and anything that does not fit the
/// schema is dropped at the subscriber edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolMessage {
    /// Unique message identifier (ULID).
    #[serde(default)]
    pub id: String,

    /// Message kind classification.
    pub kind: MessageKind,

    /// Logical sender ("controller", the worker-agent id, or "simulation").
    pub source: String,

    /// When the message was produced.
    pub timestamp: DateTime<Utc>,

    /// Kind-specific payload; PROBE and PROBE_REPLY carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ProtocolMessage {
    /// Create a new message with auto-generated ID and timestamp.
    pub fn new(
        kind: MessageKind,
        source: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            kind,
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn probe(source: impl Into<String>) -> Self {
        Self::new(MessageKind::Probe, source, None)
    }

    pub fn probe_reply(source: impl Into<String>) -> Self {
        Self::new(MessageKind::ProbeReply, source, None)
    }

    pub fn start_task(source: impl Into<String>, job: &JobDescriptor) -> Self {
        let payload = serde_json::to_value(job).ok();
        Self::new(MessageKind::StartTask, source, payload)
    }

    pub fn progress(source: impl Into<String>, pages: u32, ads: u32) -> Self {
        let payload = serde_json::to_value(ProgressPayload { pages, ads }).ok();
        Self::new(MessageKind::Progress, source, payload)
    }

    pub fn complete(source: impl Into<String>, pages: u32, ads: u32) -> Self {
        let payload = serde_json::to_value(CompletePayload { pages, ads }).ok();
        Self::new(MessageKind::Complete, source, payload)
    }

    pub fn error_report(source: impl Into<String>, message: impl Into<String>) -> Self {
        let payload = serde_json::to_value(ErrorPayload {
            message: message.into(),
        })
        .ok();
        Self::new(MessageKind::Error, source, payload)
    }

    /// Tolerantly decode raw channel traffic.
    ///
    /// Returns `None` for anything missing a recognized `kind` or otherwise
    /// structurally invalid. The channel is shared and noisy; undecodable
    /// traffic is not an error.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// True when `source` is the worker-agent or the simulation stand-in.
    pub fn is_from_recognized_peer(&self) -> bool {
        self.source == AGENT_SOURCE || self.source == SIMULATION_SOURCE
    }

    /// Decode the payload into a typed struct, `None` when absent or invalid.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Option<T> {
        let payload = self.payload.as_ref()?;
        serde_json::from_value(payload.clone()).ok()
    }
}

/// Payload of a PROGRESS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub pages: u32,
    pub ads: u32,
}

/// Payload of a COMPLETE message (final totals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub pages: u32,
    pub ads: u32,
}

/// Payload of an ERROR message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

// ============================================================================
// Scrape Jobs
// ============================================================================

/// How deep a scrape job goes on each listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskType {
    /// Collect what the listing index page shows.
    ListOnly,
    /// Open every listing in a new page and collect detail fields.
    OpenOnNew,
}

/// Job urgency, assigned by the caller when the job is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// A single bounded unit of scraping work.
///
/// Created by the caller before dispatch and immutable once sent; the bridge
/// only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDescriptor {
    pub job_id: String,
    pub upload_token: String,
    pub target_site: String,
    pub query_keyword: String,
    pub task_type: TaskType,
    /// Free-form tuning knobs; the bridge reads `page_target` if present.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl JobDescriptor {
    pub fn new(
        target_site: impl Into<String>,
        query_keyword: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            upload_token: uuid::Uuid::new_v4().to_string(),
            target_site: target_site.into(),
            query_keyword: query_keyword.into(),
            task_type,
            parameters: serde_json::Map::new(),
        }
    }

    /// Set a parameter (builder pattern).
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Requested page count, falling back to `default` when absent or zero.
    pub fn page_target(&self, default: u32) -> u32 {
        self.parameters
            .get("page_target")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .filter(|v| *v > 0)
            .unwrap_or(default)
    }
}

// ============================================================================
// Credit Reward Calculation
// ============================================================================

/// Scoring constants for the reward calculator.
///
/// These are configuration, not law; callers that need different economics
/// pass their own policy to [`calculate_credit_gain_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreditPolicy {
    /// Base credits for a list-only scan.
    pub list_only_base: u32,
    /// Base credits for an open-on-new scan (deeper work).
    pub open_on_new_base: u32,
    /// Extra credits when the job priority is high.
    pub high_priority_bonus: u32,
    /// Hours of staleness that earn one staleness step.
    pub staleness_step_hours: f64,
    /// Credits per staleness step.
    pub staleness_step_credits: u32,
    /// Ceiling on the staleness bonus.
    pub staleness_max: u32,
    /// Global cap on the total reward.
    pub cap: u32,
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            list_only_base: 6,
            open_on_new_base: 12,
            high_priority_bonus: 5,
            staleness_step_hours: 24.0,
            staleness_step_credits: 2,
            staleness_max: 8,
            cap: 20,
        }
    }
}

/// One itemized term of a credit calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditGainItem {
    pub label: String,
    pub value: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result of a credit calculation, computed fresh on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditGainCalculation {
    pub total: u32,
    pub breakdown: Vec<CreditGainItem>,
    pub is_capped: bool,
    /// Amount subtracted by the cap (zero when uncapped).
    pub capped_amount: u32,
    /// Priority bonus applied (zero unless priority was high).
    pub priority_bonus: u32,
}

/// Compute the credit reward for a completed scrape job with default policy.
///
/// Deterministic for identical inputs; no side effects.
pub fn calculate_credit_gain(
    priority: Priority,
    task_type: TaskType,
    hours_since_last_scan: Option<f64>,
) -> CreditGainCalculation {
    calculate_credit_gain_with(
        &CreditPolicy::default(),
        priority,
        task_type,
        hours_since_last_scan,
    )
}

/// Compute the credit reward for a completed scrape job under `policy`.
pub fn calculate_credit_gain_with(
    policy: &CreditPolicy,
    priority: Priority,
    task_type: TaskType,
    hours_since_last_scan: Option<f64>,
) -> CreditGainCalculation {
    let mut breakdown = Vec::new();

    let (base, base_label) = match task_type {
        TaskType::ListOnly => (policy.list_only_base, "Listing scan base"),
        TaskType::OpenOnNew => (policy.open_on_new_base, "Deep scan base"),
    };
    breakdown.push(CreditGainItem {
        label: base_label.to_string(),
        value: base,
        description: None,
    });

    let priority_bonus = if priority == Priority::High {
        breakdown.push(CreditGainItem {
            label: "High priority bonus".to_string(),
            value: policy.high_priority_bonus,
            description: None,
        });
        policy.high_priority_bonus
    } else {
        0
    };

    let staleness = staleness_bonus(policy, hours_since_last_scan);
    if staleness > 0 {
        breakdown.push(CreditGainItem {
            label: "Staleness bonus".to_string(),
            value: staleness,
            description: hours_since_last_scan.map(|h| format!("{h:.0} hours since last scan")),
        });
    }

    let raw: u32 = breakdown.iter().map(|item| item.value).sum();
    let (total, is_capped, capped_amount) = if raw > policy.cap {
        (policy.cap, true, raw - policy.cap)
    } else {
        (raw, false, 0)
    };

    CreditGainCalculation {
        total,
        breakdown,
        is_capped,
        capped_amount,
        priority_bonus,
    }
}

fn staleness_bonus(policy: &CreditPolicy, hours: Option<f64>) -> u32 {
    let hours = match hours {
        Some(h) if h.is_finite() && h > 0.0 => h,
        _ => return 0,
    };
    let steps = (hours / policy.staleness_step_hours).floor() as u32;
    (steps * policy.staleness_step_credits).min(policy.staleness_max)
}

/// Render a calculation as a one-line human-readable summary.
pub fn describe_credit_gain(calc: &CreditGainCalculation) -> String {
    let terms: Vec<String> = calc
        .breakdown
        .iter()
        .map(|item| format!("{} +{}", item.label, item.value))
        .collect();
    let mut summary = format!("{} credits ({})", calc.total, terms.join(", "));
    if calc.is_capped {
        summary.push_str(&format!(
            "; capped at {}, {} forfeited",
            calc.total, calc.capped_amount
        ));
    }
    summary
}

// ============================================================================
// Tests
// ============================================================================
