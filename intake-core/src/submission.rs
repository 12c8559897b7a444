//! Submission pipeline types: upload and registration collaborators, the
//! assembled payload, and the submission status machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collab::CollaboratorError;
use crate::field::FileRef;
use crate::variants::Role;

/// Prefix of every upload failure reason.
pub const UPLOAD_ERROR: &str = "upload error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub url: String,
}

/// Backend reference of a created account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountRef(pub String);

#[async_trait]
pub trait FileUploader: Send + Sync {
    async fn upload(&self, file: &FileRef) -> Result<UploadedFile, CollaboratorError>;
}

#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, payload: &RegistrationPayload) -> Result<AccountRef, CollaboratorError>;
}

/// Role-specific body of the create-account call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationPayload {
    pub role: Role,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RegistrationPayload {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }
}

/// Payload key holding the uploaded URL for a file field.
pub fn upload_key(field: &str) -> String {
    let stem = field.strip_suffix("File").unwrap_or(field);
    format!("{}Url", stem)
}

/// Context handed to the routing layer once the account exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    pub email_or_identifier: String,
    pub is_new_registration: bool,
}

/// `idle -> uploading? -> submitting -> (succeeded | failed)`, and
/// `failed -> idle` for a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionStatus {
    Idle,
    Uploading,
    Submitting,
    Succeeded { account: AccountRef },
    Failed { reason: String },
}

impl SubmissionStatus {
    pub fn can_transition_to(&self, next: &SubmissionStatus) -> bool {
        use SubmissionStatus::*;
        matches!(
            (self, next),
            (Idle, Uploading)
                | (Idle, Submitting)
                | (Uploading, Submitting)
                | (Uploading, Failed { .. })
                | (Submitting, Succeeded { .. })
                | (Submitting, Failed { .. })
                | (Failed { .. }, Idle)
        )
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, SubmissionStatus::Uploading | SubmissionStatus::Submitting)
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, SubmissionStatus::Succeeded { .. })
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            SubmissionStatus::Failed { reason } => Some(reason.as_str()),
            _ => None,
        }
    }
}

/// Reason recorded when an upload fails.
pub fn upload_failure_reason(error: &CollaboratorError) -> String {
    let detail = error.message.trim();
    if detail.is_empty() {
        UPLOAD_ERROR.to_string()
    } else {
        format!("{}: {}", UPLOAD_ERROR, detail)
    }
}
