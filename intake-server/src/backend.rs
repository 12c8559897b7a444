//! HTTP implementations of the wizard collaborators.
//!
//! Every call goes to the configured registration backend. Transport
//! failures, 408 and 429 become network errors; only a 4xx carrying
//! `{"code", "message"}` becomes a structured rejection. Anything else is
//! unexpected.

use async_trait::async_trait;
use intake_core::{
    AccountRef, CollaboratorError, Collaborators, FailureKind, FileRef, FileUploader, GateKind,
    Registrar, RegistrationPayload, UploadedFile, VerificationResult, Verifier,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BackendSettings;

#[derive(Debug, Deserialize)]
struct Rejection {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedAccount {
    id: String,
}

fn transport_error(url: &str, e: reqwest::Error) -> CollaboratorError {
    tracing::warn!(url = %url, error = %e, "Backend request failed");
    CollaboratorError::network(e.to_string())
}

fn is_transient(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
    )
}

/// Turn a non-success response into a collaborator error.
async fn rejection(url: &str, response: reqwest::Response) -> CollaboratorError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(url = %url, status = %status, "Backend rejected request");

    if is_transient(status) {
        return CollaboratorError::network(format!("backend returned {}", status));
    }
    match serde_json::from_str::<Rejection>(&body) {
        Ok(Rejection {
            code: Some(code),
            message,
        }) if status.is_client_error() => {
            CollaboratorError::rejected(code, message.unwrap_or_default())
        }
        _ => CollaboratorError::unexpected(format!("backend returned {}", status)),
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> Result<T, CollaboratorError> {
    response.json::<T>().await.map_err(|e| {
        tracing::warn!(url = %url, error = %e, "Malformed backend response");
        CollaboratorError::unexpected(e.to_string())
    })
}

/// Checks invitation codes against one verification endpoint.
pub struct HttpVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpVerifier {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify(&self, code: &str) -> Result<VerificationResult, CollaboratorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "code": code }))
            .send()
            .await
            .map_err(|e| transport_error(&self.url, e))?;

        if response.status().is_success() {
            return decode(&self.url, response).await;
        }

        // A structured 4xx is the backend's definitive "no".
        let error = rejection(&self.url, response).await;
        match error.kind {
            FailureKind::Rejected { .. } => Ok(VerificationResult::rejected(error.message)),
            _ => Err(error),
        }
    }
}

/// Sends each file as a raw request body.
pub struct HttpUploader {
    client: reqwest::Client,
    url: String,
}

impl HttpUploader {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl FileUploader for HttpUploader {
    async fn upload(&self, file: &FileRef) -> Result<UploadedFile, CollaboratorError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, file.content_type.as_str())
            .header("X-File-Name", file.name.as_str())
            .body(file.bytes.to_vec())
            .send()
            .await
            .map_err(|e| transport_error(&self.url, e))?;

        if !response.status().is_success() {
            return Err(rejection(&self.url, response).await);
        }
        let uploaded: UploadedFile = decode(&self.url, response).await?;
        tracing::info!(url = %self.url, file = %file.name, size = file.size, "File uploaded");
        Ok(uploaded)
    }
}

pub struct HttpRegistrar {
    client: reqwest::Client,
    url: String,
}

impl HttpRegistrar {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn register(&self, payload: &RegistrationPayload) -> Result<AccountRef, CollaboratorError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| transport_error(&self.url, e))?;

        if !response.status().is_success() {
            return Err(rejection(&self.url, response).await);
        }
        let created: CreatedAccount = decode(&self.url, response).await?;
        Ok(AccountRef(created.id))
    }
}

/// Wire every collaborator to the configured backend.
pub fn http_collaborators(settings: &BackendSettings) -> Result<Collaborators, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.timeout_secs))
        .build()?;

    let clinic = HttpVerifier::new(client.clone(), settings.url(&settings.verify_clinic_path));
    let staff = HttpVerifier::new(client.clone(), settings.url(&settings.verify_staff_path));
    let uploader = HttpUploader::new(client.clone(), settings.url(&settings.upload_path));
    let registrar = HttpRegistrar::new(client, settings.url(&settings.register_path));

    Ok(Collaborators::new(Arc::new(uploader), Arc::new(registrar))
        .with_verifier(GateKind::ClinicInvitation, Arc::new(clinic))
        .with_verifier(GateKind::StaffInvitation, Arc::new(staff)))
}
