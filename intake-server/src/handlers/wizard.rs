use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use base64::Engine;
use intake_core::{
    AdvanceOutcome, BeginVerification, FieldKind, FileRef, GateKind, IntakeError, NavigationError,
    PendingVerification, Role, SubmitOutcome, UPLOAD_ERROR, VerificationApplied, Wizard,
    WizardView,
};
use intake_store::{AttemptEvent, AttemptOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use super::{ApiError, api_error, not_found};
use crate::AppState;
use crate::session::SessionHandle;

#[derive(Serialize)]
struct SessionBody<'a> {
    id: &'a str,
    #[serde(flatten)]
    wizard: WizardView,
}

/// File field body: the picked file, base64-encoded.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
    name: String,
    content_type: String,
    data: String,
}

async fn session(state: &AppState, id: &str) -> Result<SessionHandle, ApiError> {
    state
        .sessions
        .get(id)
        .await
        .ok_or_else(|| not_found("Wizard", id))
}

fn intake_error(e: IntakeError) -> ApiError {
    match e {
        IntakeError::UnknownField(_) => api_error(StatusCode::NOT_FOUND, e.to_string()),
        IntakeError::NotOnCurrentStep { .. } | IntakeError::Busy | IntakeError::Completed => {
            api_error(StatusCode::CONFLICT, e.to_string())
        }
        IntakeError::Definition { .. } => {
            tracing::error!(error = %e, "Wizard definition error");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn navigation_error(e: NavigationError) -> ApiError {
    match e {
        NavigationError::OutOfRange { .. } => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        NavigationError::NotReachable { .. } | NavigationError::Locked => {
            api_error(StatusCode::CONFLICT, e.to_string())
        }
    }
}

fn decode_upload(body: &Value) -> Result<FileRef, ApiError> {
    let upload: UploadBody = serde_json::from_value(body.clone())
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid file body: {}", e)))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(upload.data.as_bytes())
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid file data: {}", e)))?;
    Ok(FileRef::new(upload.name, upload.content_type, bytes))
}

fn advance_json(outcome: &AdvanceOutcome) -> Value {
    match outcome {
        AdvanceOutcome::Advanced { step } => json!({ "outcome": "advanced", "step": step }),
        AdvanceOutcome::Blocked { issues } => json!({ "outcome": "blocked", "issues": issues }),
        AdvanceOutcome::NeedsVerification(PendingVerification { ticket, .. }) => {
            json!({ "outcome": "verification_in_flight", "gate": ticket.gate })
        }
        AdvanceOutcome::VerificationInFlight { gate } => {
            json!({ "outcome": "verification_in_flight", "gate": gate })
        }
        AdvanceOutcome::AtFinalStep => json!({ "outcome": "ready_to_submit" }),
        AdvanceOutcome::Locked => json!({ "outcome": "locked" }),
    }
}

fn with_view(mut body: Value, view: WizardView) -> Value {
    if let Value::Object(map) = &mut body {
        map.insert("wizard".to_string(), json!(view));
    }
    body
}

/// Run one issued verification outside the session lock and apply its
/// result. The work is spawned so the ticket settles even if the client
/// goes away mid-request.
async fn run_verification(
    state: Arc<AppState>,
    handle: SessionHandle,
    session_id: String,
    role: Role,
    pending: PendingVerification,
) -> VerificationApplied {
    let gate = pending.ticket.gate;
    let task = tokio::spawn(async move {
        let outcome = state.collaborators.verify(&pending).await;
        let (attempt, detail) = match &outcome {
            Ok(result) if result.valid => (AttemptOutcome::Accepted, None),
            Ok(result) => (AttemptOutcome::Rejected, Some(result.reason())),
            Err(e) => (AttemptOutcome::Failed, Some(e.to_string())),
        };

        let applied = handle
            .lock()
            .await
            .wizard
            .complete_verification(pending.ticket, outcome);
        state
            .record_attempt(
                &session_id,
                role,
                AttemptEvent::Verification,
                attempt,
                detail.as_deref(),
            )
            .await;
        applied
    });

    task.await.unwrap_or_else(|e| {
        tracing::error!(gate = gate.as_str(), error = %e, "Verification task failed");
        VerificationApplied::Stale
    })
}

/// Validate the current step and run any verification it needs until the
/// wizard reaches a settled outcome.
async fn drive_advance(
    state: &Arc<AppState>,
    handle: &SessionHandle,
    session_id: &str,
) -> AdvanceOutcome {
    let (mut outcome, role) = {
        let mut session = handle.lock().await;
        session.touch();
        (session.wizard.try_advance(), session.wizard.role())
    };

    while let AdvanceOutcome::NeedsVerification(pending) = outcome {
        let gate = pending.ticket.gate;
        let applied = run_verification(
            state.clone(),
            handle.clone(),
            session_id.to_string(),
            role,
            pending,
        )
        .await;
        outcome = handle.lock().await.wizard.resume_advance(gate, &applied);
    }
    outcome
}

/// Start a wizard (POST /wizards/{role})
pub async fn create(
    State(state): State<Arc<AppState>>,
    Path(role): Path<String>,
) -> Result<Response, ApiError> {
    let role: Role = role.parse().map_err(|_| not_found("Role", &role))?;
    let definition = state
        .definitions
        .get(&role)
        .cloned()
        .ok_or_else(|| not_found("Role", role.as_str()))?;

    let wizard = Wizard::new(definition);
    let view = wizard.view();
    let (id, _) = state.sessions.create(wizard).await;
    tracing::info!(session = %id, role = %role, "Started registration wizard");

    Ok((
        StatusCode::CREATED,
        Json(SessionBody {
            id: &id,
            wizard: view,
        }),
    )
        .into_response())
}

/// Read a wizard (GET /wizards/{id})
pub async fn show(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let handle = session(&state, &id).await?;
    let mut session = handle.lock().await;
    session.touch();
    Ok(Json(SessionBody {
        id: &id,
        wizard: session.wizard.view(),
    })
    .into_response())
}

/// Discard a wizard (DELETE /wizards/{id})
pub async fn discard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.remove(&id).await {
        tracing::info!(session = %id, "Discarded registration wizard");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Wizard", &id))
    }
}

/// Set or clear one field (PUT /wizards/{id}/fields/{field})
pub async fn set_field(
    State(state): State<Arc<AppState>>,
    Path((id, field)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let handle = session(&state, &id).await?;
    let mut session = handle.lock().await;
    session.touch();

    let kind = session.wizard.definition().field(&field).map(|spec| spec.kind);
    let validity = match kind {
        Some(FieldKind::File) if !body.is_null() => {
            let file = decode_upload(&body)?;
            session.wizard.set_file(&field, file)
        }
        Some(FieldKind::File) => session.wizard.set_value(&field, None),
        _ => session.wizard.set_json(&field, &body),
    }
    .map_err(intake_error)?;

    let body = json!({ "field": field, "validity": validity });
    Ok(Json(with_view(body, session.wizard.view())).into_response())
}

/// Validate the current step and move on (POST /wizards/{id}/advance)
pub async fn advance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let handle = session(&state, &id).await?;
    let outcome = drive_advance(&state, &handle, &id).await;

    let view = handle.lock().await.wizard.view();
    Ok(Json(with_view(advance_json(&outcome), view)).into_response())
}

/// Go back one step (POST /wizards/{id}/retreat)
pub async fn retreat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let handle = session(&state, &id).await?;
    let mut session = handle.lock().await;
    session.touch();
    let moved = session.wizard.retreat();
    Ok(Json(with_view(json!({ "moved": moved }), session.wizard.view())).into_response())
}

/// Jump to a reachable step (POST /wizards/{id}/jump/{step})
pub async fn jump(
    State(state): State<Arc<AppState>>,
    Path((id, step)): Path<(String, usize)>,
) -> Result<Response, ApiError> {
    let handle = session(&state, &id).await?;
    let mut session = handle.lock().await;
    session.touch();
    let step = session.wizard.jump_to(step).map_err(navigation_error)?;
    Ok(Json(with_view(json!({ "step": step }), session.wizard.view())).into_response())
}

/// Live check of a gated code (POST /wizards/{id}/gates/{gate}/verify)
pub async fn verify_gate(
    State(state): State<Arc<AppState>>,
    Path((id, gate)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let gate = GateKind::parse(&gate).ok_or_else(|| not_found("Gate", &gate))?;
    let handle = session(&state, &id).await?;

    let (begin, role) = {
        let mut session = handle.lock().await;
        session.touch();
        (session.wizard.begin_verification(gate), session.wizard.role())
    };

    let (status, body) = match begin {
        BeginVerification::Pending(pending) => {
            let applied =
                run_verification(state.clone(), handle.clone(), id.clone(), role, pending).await;
            match applied {
                VerificationApplied::Applied(result) => {
                    (StatusCode::OK, json!({ "status": "settled", "result": result }))
                }
                VerificationApplied::Stale => (StatusCode::OK, json!({ "status": "stale" })),
            }
        }
        BeginVerification::Suppressed => (StatusCode::OK, json!({ "status": "in_flight" })),
        BeginVerification::Settled(result) => {
            (StatusCode::OK, json!({ "status": "settled", "result": result }))
        }
        BeginVerification::LocallyInvalid(reason) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "status": "invalid", "reason": reason }),
        ),
        BeginVerification::NotApplicable => {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!("{} does not guard the current step", gate.as_str()),
            ));
        }
    };

    let view = handle.lock().await.wizard.view();
    Ok((status, Json(with_view(body, view))).into_response())
}

/// Upload files and create the account (POST /wizards/{id}/submit)
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let handle = session(&state, &id).await?;

    let (role, on_final_step) = {
        let session = handle.lock().await;
        let wizard = &session.wizard;
        (
            wizard.role(),
            wizard.current_step() == wizard.step_count() && !wizard.status().is_succeeded(),
        )
    };

    // Settle the final step's gate first so the registration call itself
    // runs with no verification pending.
    if on_final_step {
        let check = drive_advance(&state, &handle, &id).await;
        if let AdvanceOutcome::Blocked { issues } = check {
            let view = handle.lock().await.wizard.view();
            let body = json!({ "outcome": "blocked", "issues": issues });
            return Ok(Json(with_view(body, view)).into_response());
        }
    }

    let task_state = state.clone();
    let task_handle = handle.clone();
    let outcome = tokio::spawn(async move {
        let mut session = task_handle.lock().await;
        session.touch();
        session.wizard.submit(&task_state.collaborators).await
    })
    .await
    .map_err(|e| {
        tracing::error!(session = %id, error = %e, "Submission task failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Submission failed")
    })?;

    let (status, body) = match &outcome {
        SubmitOutcome::Succeeded(handoff) => {
            state
                .record_attempt(
                    &id,
                    role,
                    AttemptEvent::Submission,
                    AttemptOutcome::Accepted,
                    None,
                )
                .await;
            (
                StatusCode::OK,
                json!({ "outcome": "succeeded", "handoff": handoff }),
            )
        }
        SubmitOutcome::Failed { reason } => {
            let event = if reason.starts_with(UPLOAD_ERROR) {
                AttemptEvent::Upload
            } else {
                AttemptEvent::Submission
            };
            state
                .record_attempt(&id, role, event, AttemptOutcome::Failed, Some(reason))
                .await;
            (StatusCode::OK, json!({ "outcome": "failed", "reason": reason }))
        }
        SubmitOutcome::Blocked { issues } => (
            StatusCode::OK,
            json!({ "outcome": "blocked", "issues": issues }),
        ),
        SubmitOutcome::NotOnFinalStep { current } => (
            StatusCode::CONFLICT,
            json!({ "outcome": "not_on_final_step", "current": current }),
        ),
        SubmitOutcome::AlreadySubmitted => (
            StatusCode::CONFLICT,
            json!({ "outcome": "already_submitted" }),
        ),
    };

    let view = handle.lock().await.wizard.view();
    Ok((status, Json(with_view(body, view))).into_response())
}
