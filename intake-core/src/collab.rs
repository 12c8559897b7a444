//! Collaborator handles and the failure shape they report.
//!
//! The wizard never talks to the network itself. Verification, upload and
//! registration are async traits supplied by the host; any failure they
//! return is turned into user-presentable state by the wizard.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::gate::{GateKind, PendingVerification, VerificationResult, Verifier};
use crate::submission::{FileUploader, Registrar};

/// Generic message for failures nobody mapped to something better.
pub const GENERIC_FAILURE: &str = "Something went wrong. Please try again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Transport failure, timeout, unreachable backend.
    Network,
    /// The collaborator answered with a structured rejection.
    Rejected { code: String },
    Unexpected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CollaboratorError {
    pub kind: FailureKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Network,
            message: message.into(),
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Rejected { code: code.into() },
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unexpected,
            message: message.into(),
        }
    }
}

/// Map a registration failure to the message shown to the user.
///
/// Always returns a non-empty string.
pub fn describe_failure(error: &CollaboratorError) -> String {
    match &error.kind {
        FailureKind::Network => {
            "Network error. Check your connection and try again.".to_string()
        }
        FailureKind::Rejected { code } => match code.as_str() {
            "email_taken" => "An account with this email already exists.".to_string(),
            "invalid_invitation" => "The invitation code is no longer valid.".to_string(),
            "license_exists" => "This license number is already registered.".to_string(),
            _ if !error.message.trim().is_empty() => error.message.clone(),
            _ => GENERIC_FAILURE.to_string(),
        },
        FailureKind::Unexpected => GENERIC_FAILURE.to_string(),
    }
}

/// Everything a wizard needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    verifiers: HashMap<GateKind, Arc<dyn Verifier>>,
    pub uploader: Arc<dyn FileUploader>,
    pub registrar: Arc<dyn Registrar>,
}

impl Collaborators {
    pub fn new(uploader: Arc<dyn FileUploader>, registrar: Arc<dyn Registrar>) -> Self {
        Self {
            verifiers: HashMap::new(),
            uploader,
            registrar,
        }
    }

    pub fn with_verifier(mut self, gate: GateKind, verifier: Arc<dyn Verifier>) -> Self {
        self.verifiers.insert(gate, verifier);
        self
    }

    pub fn verifier(&self, gate: GateKind) -> Option<&Arc<dyn Verifier>> {
        self.verifiers.get(&gate)
    }

    /// Run the verifier for an issued ticket. A gate without a configured
    /// verifier fails like an unreachable one.
    pub async fn verify(
        &self,
        pending: &PendingVerification,
    ) -> Result<VerificationResult, CollaboratorError> {
        match self.verifier(pending.ticket.gate) {
            Some(verifier) => verifier.verify(&pending.code).await,
            None => Err(CollaboratorError::unexpected(format!(
                "no verifier configured for {}",
                pending.ticket.gate.as_str()
            ))),
        }
    }
}
