//! External verification gates.
//!
//! A gate is an async check (invitation code lookup) that local rules cannot
//! decide. Each wizard keeps one [`GateState`] per gate. A verification is
//! issued as a numbered ticket and settled later; only the newest ticket
//! whose code still matches the field is ever applied, so a slow response
//! for an abandoned input cannot mark a different input as verified.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collab::CollaboratorError;

/// Reason shown when the verifier could not be reached.
pub const VERIFY_UNAVAILABLE: &str = "Could not verify the code. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    ClinicInvitation,
    StaffInvitation,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::ClinicInvitation => "clinic_invitation",
            GateKind::StaffInvitation => "staff_invitation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clinic_invitation" => Some(GateKind::ClinicInvitation),
            "staff_invitation" => Some(GateKind::StaffInvitation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Clinic,
    Hospital,
    Organization,
}

/// Outcome of one verification call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_kind: Option<SubjectKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl VerificationResult {
    pub fn accepted(subject_name: impl Into<String>, subject_kind: Option<SubjectKind>) -> Self {
        Self {
            valid: true,
            subject_name: Some(subject_name.into()),
            subject_kind,
            error_reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            subject_name: None,
            subject_kind: None,
            error_reason: Some(reason.into()),
        }
    }

    /// Reason to show for a negative result.
    pub fn reason(&self) -> String {
        match &self.error_reason {
            Some(reason) if !reason.trim().is_empty() => reason.clone(),
            _ => "Invalid invitation code".to_string(),
        }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    /// Check a code. Must be safe to call repeatedly with the same code.
    async fn verify(&self, code: &str) -> Result<VerificationResult, CollaboratorError>;
}

/// Identifies one issued verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub gate: GateKind,
    pub seq: u64,
}

/// A verification the caller must run and hand back via
/// `Wizard::complete_verification`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVerification {
    pub ticket: Ticket,
    pub code: String,
}

/// Answer to a request to start a verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginVerification {
    Pending(PendingVerification),
    /// The same code is already in flight.
    Suppressed,
    /// A definitive result already exists for this exact code.
    Settled(VerificationResult),
    /// The gate does not guard its step under the current branch.
    NotApplicable,
    /// The code fails local rules; no call is made.
    LocallyInvalid(String),
}

/// Whether a settled verification changed wizard state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationApplied {
    Applied(VerificationResult),
    /// Superseded ticket or the field changed since issue.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Verdict {
    code: String,
    result: VerificationResult,
}

/// Per-gate bookkeeping inside one wizard.
#[derive(Debug, Clone, Default)]
pub struct GateState {
    next_seq: u64,
    in_flight: Option<(u64, String)>,
    verdict: Option<Verdict>,
}

impl GateState {
    /// Issue a ticket for `code`, or `None` if that code is already in flight.
    pub(crate) fn issue(&mut self, code: &str) -> Option<u64> {
        if let Some((_, pending)) = &self.in_flight
            && pending == code
        {
            return None;
        }
        self.next_seq += 1;
        self.in_flight = Some((self.next_seq, code.to_string()));
        Some(self.next_seq)
    }

    /// Retire ticket `seq`. Returns the code it was issued for when the
    /// ticket is still the newest one and that code equals `current`.
    pub(crate) fn settle(&mut self, seq: u64, current: Option<&str>) -> Option<String> {
        let newest = matches!(&self.in_flight, Some((pending, _)) if *pending == seq);
        if !newest {
            return None;
        }
        let (_, code) = self.in_flight.take()?;
        (current == Some(code.as_str())).then_some(code)
    }

    pub(crate) fn record(&mut self, code: String, result: VerificationResult) {
        self.verdict = Some(Verdict { code, result });
    }

    /// Forget the verdict; the gated value was edited.
    pub(crate) fn invalidate(&mut self) {
        self.verdict = None;
    }

    pub fn verdict_for(&self, code: &str) -> Option<&VerificationResult> {
        self.verdict
            .as_ref()
            .filter(|v| v.code == code)
            .map(|v| &v.result)
    }

    pub fn passed_for(&self, code: &str) -> bool {
        self.verdict_for(code).is_some_and(|r| r.valid)
    }

    pub fn in_flight_code(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|(_, code)| code.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_code_in_flight_is_suppressed() {
        let mut state = GateState::default();
        assert_eq!(state.issue("ABC123"), Some(1));
        assert_eq!(state.issue("ABC123"), None);
        assert_eq!(state.in_flight_code(), Some("ABC123"));
    }

    #[test]
    fn test_newer_ticket_supersedes_older() {
        let mut state = GateState::default();
        let first = state.issue("AAAA").unwrap();
        let second = state.issue("BBBB").unwrap();
        assert!(second > first);

        assert_eq!(state.settle(first, Some("BBBB")), None);
        assert_eq!(state.settle(second, Some("BBBB")), Some("BBBB".to_string()));
        assert_eq!(state.in_flight_code(), None);
    }

    #[test]
    fn test_settle_discards_when_field_changed() {
        let mut state = GateState::default();
        let seq = state.issue("AAAA").unwrap();
        assert_eq!(state.settle(seq, Some("CCCC")), None);
        // The ticket is retired either way.
        assert_eq!(state.in_flight_code(), None);
    }

    #[test]
    fn test_verdict_is_keyed_to_code() {
        let mut state = GateState::default();
        state.record(
            "VALID99".to_string(),
            VerificationResult::accepted("Downtown Clinic", Some(SubjectKind::Clinic)),
        );
        assert!(state.passed_for("VALID99"));
        assert!(!state.passed_for("VALID98"));

        state.invalidate();
        assert!(!state.passed_for("VALID99"));
    }

    #[test]
    fn test_rejected_reason_fallback() {
        assert_eq!(VerificationResult::rejected("expired").reason(), "expired");
        assert_eq!(
            VerificationResult::rejected("").reason(),
            "Invalid invitation code"
        );
    }

    #[test]
    fn test_result_wire_format() {
        let result: VerificationResult = serde_json::from_str(
            r#"{"valid": true, "subjectName": "Downtown Clinic", "subjectKind": "clinic"}"#,
        )
        .unwrap();
        assert!(result.valid);
        assert_eq!(result.subject_name.as_deref(), Some("Downtown Clinic"));
        assert_eq!(result.subject_kind, Some(SubjectKind::Clinic));
        assert_eq!(result.error_reason, None);
    }
}
