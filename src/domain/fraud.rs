//! Fraud flags, assessments and review cases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{BusinessId, CodeType, FraudCaseId, RedemptionContext, UserId, VoucherId};

/// Upper bound of a risk score
pub const MAX_RISK_SCORE: u8 = 100;

/// Severity band of a single flag; each band contributes a fixed weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn weight(&self) -> u8 {
        match self {
            Self::Low => 10,
            Self::Medium => 25,
            Self::High => 50,
            Self::Critical => 75,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a code was considered misused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CodeMisuse {
    /// Code exists but has been deactivated
    InactiveCode { code: String },
    /// Code presented through a path that expects another type
    TypeMismatch {
        expected: CodeType,
        presented: CodeType,
    },
}

/// A heuristic that fired during scoring.
///
/// Closed set: every flag carries its own fixed payload shape. Serialized
/// as `{type, severity, message, ..payload}`; `message` is derived and
/// ignored when reading a flag back.
#[derive(Debug, Clone, PartialEq)]
pub enum FraudFlag {
    HighVelocity {
        severity: Severity,
        attempts: u32,
        limit: u32,
        window_secs: i64,
    },
    ImpossibleTravel {
        severity: Severity,
        distance_km: f64,
        elapsed_secs: i64,
        speed_kmh: f64,
    },
    SharedDeviceAbuse {
        severity: Severity,
        fingerprint: String,
        other_users: u32,
    },
    CodeMisuse {
        severity: Severity,
        misuse: CodeMisuse,
    },
}

/// Wire shape of [`FraudFlag`] without the derived message
#[allow(dead_code)]
#[derive(Serialize, Deserialize)]
#[serde(remote = "FraudFlag", tag = "type", rename_all = "snake_case")]
enum FraudFlagDef {
    HighVelocity {
        severity: Severity,
        attempts: u32,
        limit: u32,
        window_secs: i64,
    },
    ImpossibleTravel {
        severity: Severity,
        distance_km: f64,
        elapsed_secs: i64,
        speed_kmh: f64,
    },
    SharedDeviceAbuse {
        severity: Severity,
        fingerprint: String,
        other_users: u32,
    },
    CodeMisuse {
        severity: Severity,
        misuse: CodeMisuse,
    },
}

struct FlagPayload<'a>(&'a FraudFlag);

impl Serialize for FlagPayload<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        FraudFlagDef::serialize(self.0, serializer)
    }
}

#[derive(Serialize)]
struct FlagView<'a> {
    #[serde(flatten)]
    flag: FlagPayload<'a>,
    message: String,
}

impl Serialize for FraudFlag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        FlagView {
            flag: FlagPayload(self),
            message: self.message(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FraudFlag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        FraudFlagDef::deserialize(deserializer)
    }
}

impl FraudFlag {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HighVelocity { .. } => "high_velocity",
            Self::ImpossibleTravel { .. } => "impossible_travel",
            Self::SharedDeviceAbuse { .. } => "shared_device_abuse",
            Self::CodeMisuse { .. } => "code_misuse",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::HighVelocity { severity, .. }
            | Self::ImpossibleTravel { severity, .. }
            | Self::SharedDeviceAbuse { severity, .. }
            | Self::CodeMisuse { severity, .. } => *severity,
        }
    }

    /// Human-readable description for case reviewers.
    pub fn message(&self) -> String {
        match self {
            Self::HighVelocity {
                attempts,
                limit,
                window_secs,
                ..
            } => format!("{attempts} attempts in {window_secs}s (limit {limit})"),
            Self::ImpossibleTravel {
                distance_km,
                elapsed_secs,
                speed_kmh,
                ..
            } => format!(
                "{distance_km:.0} km in {elapsed_secs}s implies {speed_kmh:.0} km/h"
            ),
            Self::SharedDeviceAbuse {
                fingerprint,
                other_users,
                ..
            } => format!("device {fingerprint} used by {other_users} other user(s)"),
            Self::CodeMisuse { misuse, .. } => match misuse {
                CodeMisuse::InactiveCode { code } => format!("inactive code {code} presented"),
                CodeMisuse::TypeMismatch {
                    expected,
                    presented,
                } => format!("{presented} code presented where {expected} expected"),
            },
        }
    }

    pub fn is_code_misuse(&self) -> bool {
        matches!(self, Self::CodeMisuse { .. })
    }
}

/// Outcome of the decision step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudDecision {
    /// Accept without opening a case
    Accept,
    /// Accept and open a case for review
    Review,
    /// Refuse and open a case
    Reject,
}

impl FraudDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Review => "review",
            Self::Reject => "reject",
        }
    }

    pub fn opens_case(&self) -> bool {
        !matches!(self, Self::Accept)
    }
}

impl FromStr for FraudDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(Self::Accept),
            "review" => Ok(Self::Review),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown fraud decision: {other}")),
        }
    }
}

/// Score, flags and decision for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAssessment {
    pub score: u8,
    pub flags: Vec<FraudFlag>,
    pub decision: FraudDecision,
}

impl FraudAssessment {
    pub fn clean() -> Self {
        Self {
            score: 0,
            flags: Vec::new(),
            decision: FraudDecision::Accept,
        }
    }

    pub fn flag_kinds(&self) -> Vec<&'static str> {
        self.flags.iter().map(FraudFlag::kind).collect()
    }
}

/// Review status of a case; only changed by the review workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FraudCaseStatus {
    #[default]
    Open,
    Reviewed,
    Dismissed,
    Confirmed,
}

impl FraudCaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Reviewed => "reviewed",
            Self::Dismissed => "dismissed",
            Self::Confirmed => "confirmed",
        }
    }
}

impl FromStr for FraudCaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "reviewed" => Ok(Self::Reviewed),
            "dismissed" => Ok(Self::Dismissed),
            "confirmed" => Ok(Self::Confirmed),
            other => Err(format!("unknown fraud case status: {other}")),
        }
    }
}

/// A flagged attempt awaiting review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudCase {
    pub id: FraudCaseId,
    pub voucher_id: VoucherId,
    pub customer_id: UserId,
    pub provider_id: BusinessId,
    pub code: String,
    pub flags: Vec<FraudFlag>,
    pub risk_score: u8,
    pub decision: FraudDecision,
    pub status: FraudCaseStatus,
    pub context: RedemptionContext,
    pub created_at: DateTime<Utc>,
}

impl FraudCase {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        voucher_id: VoucherId,
        customer_id: UserId,
        provider_id: BusinessId,
        code: impl Into<String>,
        assessment: &FraudAssessment,
        context: RedemptionContext,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: FraudCaseId::new(),
            voucher_id,
            customer_id,
            provider_id,
            code: code.into(),
            flags: assessment.flags.clone(),
            risk_score: assessment.score,
            decision: assessment.decision,
            status: FraudCaseStatus::Open,
            context,
            created_at,
        }
    }
}
