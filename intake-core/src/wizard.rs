//! Wizard state machine.
//!
//! One [`Wizard`] holds everything about a single registration attempt: the
//! current step, every field value with its validity, gate verdicts and the
//! submission status. Public operations report problems as values; nothing
//! here panics or returns a raw collaborator error to the caller.

use chrono::{Local, NaiveDate};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::collab::{CollaboratorError, Collaborators, describe_failure};
use crate::error::{IntakeError, Result};
use crate::field::{FieldKind, FieldTable, FieldValue, FileRef, Validity, WizardField};
use crate::gate::{
    BeginVerification, GateKind, GateState, PendingVerification, Ticket, VERIFY_UNAVAILABLE,
    VerificationApplied, VerificationResult,
};
use crate::rules::{self, RuleContext};
use crate::steps::WizardDefinition;
use crate::submission::{
    Handoff, RegistrationPayload, SubmissionStatus, upload_failure_reason, upload_key,
};
use crate::variants::Role;

/// Source of "today" for age rules.
pub type Clock = fn() -> NaiveDate;

fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

/// A required field that is not valid, with the reason to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced { step: usize },
    Blocked { issues: Vec<FieldIssue> },
    /// The step is locally complete but its gate has to be consulted first.
    NeedsVerification(PendingVerification),
    VerificationInFlight { gate: GateKind },
    /// The last step is complete; the next move is `submit`.
    AtFinalStep,
    /// Submission is running or already succeeded.
    Locked,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavigationError {
    #[error("Step {requested} does not exist")]
    OutOfRange { requested: usize },

    #[error("Step {requested} is not reachable yet; the furthest reachable step is {furthest}")]
    NotReachable { requested: usize, furthest: usize },

    #[error("Registration already completed")]
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Succeeded(Handoff),
    Failed { reason: String },
    Blocked { issues: Vec<FieldIssue> },
    NotOnFinalStep { current: usize },
    AlreadySubmitted,
}

enum StepCheck {
    Ready,
    Blocked(Vec<FieldIssue>),
    NeedsVerification(PendingVerification),
    InFlight(GateKind),
}

pub struct Wizard {
    definition: Arc<WizardDefinition>,
    current: usize,
    highest_completed: usize,
    /// Furthest step ever completed; `highest_completed` never exceeds it.
    completed_cap: usize,
    fields: FieldTable,
    gates: BTreeMap<GateKind, GateState>,
    status: SubmissionStatus,
    handoff: Option<Handoff>,
    clock: Clock,
}

impl Wizard {
    pub fn new(definition: Arc<WizardDefinition>) -> Self {
        let mut fields = FieldTable::new();
        for spec in definition.field_specs() {
            fields.insert(spec.name, WizardField::new(spec.kind));
        }
        let gates = definition
            .gates()
            .map(|gate| (gate, GateState::default()))
            .collect();

        Self {
            definition,
            current: 1,
            highest_completed: 0,
            completed_cap: 0,
            fields,
            gates,
            status: SubmissionStatus::Idle,
            handoff: None,
            clock: local_today,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn definition(&self) -> &WizardDefinition {
        &self.definition
    }

    pub fn role(&self) -> Role {
        self.definition.role()
    }

    pub fn current_step(&self) -> usize {
        self.current
    }

    pub fn highest_completed_step(&self) -> usize {
        self.highest_completed
    }

    pub fn step_count(&self) -> usize {
        self.definition.step_count()
    }

    pub fn status(&self) -> &SubmissionStatus {
        &self.status
    }

    pub fn handoff(&self) -> Option<&Handoff> {
        self.handoff.as_ref()
    }

    pub fn field(&self, name: &str) -> Option<&WizardField> {
        self.fields.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).and_then(|f| f.value.as_ref())
    }

    pub fn validity(&self, name: &str) -> Validity {
        self.fields
            .validity(name)
            .cloned()
            .unwrap_or(Validity::Unvalidated)
    }

    pub fn gate(&self, gate: GateKind) -> Option<&GateState> {
        self.gates.get(&gate)
    }

    /// Whether `step` is complete and its gate, if any, passed.
    pub fn is_step_ready(&self, step: usize) -> bool {
        let snapshot = self.fields.snapshot();
        let fields_valid = self.definition.is_step_complete(step, &snapshot, |name| {
            match self.validity(name) {
                // Optional fields nobody touched have never been evaluated.
                Validity::Unvalidated => self.compute_validity(name).is_valid(),
                validity => validity.is_valid(),
            }
        });
        if !fields_valid {
            return false;
        }
        match self.definition.gate_for(step, &snapshot) {
            Some(binding) => match self.gate_code(binding.field) {
                Some(code) => self
                    .gates
                    .get(&binding.gate)
                    .is_some_and(|g| g.passed_for(&code)),
                None => false,
            },
            None => true,
        }
    }

    // ------------------------------------------------------------------
    // Field edits
    // ------------------------------------------------------------------

    /// Set or clear a field on the current step and re-run live validation.
    pub fn set_value(&mut self, name: &str, value: Option<FieldValue>) -> Result<Validity> {
        self.ensure_editable()?;
        let (name, _) = self.editable_field(name)?;
        self.store(name, value);
        Ok(self.validity(name))
    }

    /// Like [`Wizard::set_value`] but from client JSON. A malformed value
    /// clears the field and marks it invalid with the conversion reason.
    pub fn set_json(&mut self, name: &str, value: &Value) -> Result<Validity> {
        self.ensure_editable()?;
        let (name, kind) = self.editable_field(name)?;
        match FieldValue::from_json(kind, value) {
            Ok(parsed) => self.store(name, parsed),
            Err(reason) => {
                self.store(name, None);
                if let Some(field) = self.fields.get_mut(name) {
                    field.validity = Validity::Invalid(reason);
                }
                self.refresh_progress();
            }
        }
        Ok(self.validity(name))
    }

    pub fn set_file(&mut self, name: &str, file: FileRef) -> Result<Validity> {
        self.set_value(name, Some(FieldValue::File(file)))
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.status.is_in_progress() {
            return Err(IntakeError::Busy);
        }
        if self.status.is_succeeded() {
            return Err(IntakeError::Completed);
        }
        Ok(())
    }

    fn editable_field(&self, name: &str) -> Result<(&'static str, FieldKind)> {
        let spec = self
            .definition
            .field(name)
            .ok_or_else(|| IntakeError::UnknownField(name.to_string()))?;
        let owner = self.definition.owner_step(spec.name).unwrap_or_default();
        if owner != self.current {
            return Err(IntakeError::NotOnCurrentStep {
                field: spec.name.to_string(),
                owner,
                current: self.current,
            });
        }
        Ok((spec.name, spec.kind))
    }

    fn store(&mut self, name: &'static str, value: Option<FieldValue>) {
        let changed = match self.fields.get_mut(name) {
            Some(field) => {
                let changed = field.value != value;
                field.value = value;
                field.touched = true;
                changed
            }
            None => return,
        };

        if changed {
            let definition = Arc::clone(&self.definition);
            for (gate, state) in self.gates.iter_mut() {
                if definition
                    .gate_binding(*gate)
                    .is_some_and(|(_, binding)| binding.field == name)
                {
                    state.invalidate();
                }
            }
        }

        self.revalidate(name);
        for dependent in self.definition.dependents(name) {
            let seen = self
                .fields
                .get(dependent)
                .is_some_and(|f| f.touched || f.validity != Validity::Unvalidated);
            if seen {
                self.revalidate(dependent);
            }
        }
        self.refresh_progress();
    }

    fn revalidate(&mut self, name: &'static str) {
        let validity = self.compute_validity(name);
        if let Some(field) = self.fields.get_mut(name) {
            field.validity = validity;
        }
    }

    /// Local rules first, then any definitive negative gate verdict for the
    /// exact value. Inactive conditional fields are never validated.
    fn compute_validity(&self, name: &'static str) -> Validity {
        let Some(spec) = self.definition.field(name) else {
            return Validity::Unvalidated;
        };
        let snapshot = self.fields.snapshot();
        if !self.definition.is_active(name, &snapshot) {
            return Validity::Unvalidated;
        }

        let touched = self.fields.touched();
        let ctx = RuleContext {
            snapshot: &snapshot,
            touched: &touched,
            today: (self.clock)(),
        };
        let local = rules::evaluate(spec, snapshot.get(name), &ctx);
        if !local.is_valid() {
            return local;
        }

        let Some(code) = self.gate_code(name) else {
            return local;
        };
        for (gate, state) in &self.gates {
            let Some((_, binding)) = self.definition.gate_binding(*gate) else {
                continue;
            };
            if binding.field != name || !binding.applies(&snapshot) {
                continue;
            }
            if let Some(result) = state.verdict_for(&code)
                && !result.valid
            {
                return Validity::Invalid(result.reason());
            }
        }
        local
    }

    fn gate_code(&self, field: &str) -> Option<String> {
        self.value(field)
            .and_then(|v| v.as_str())
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty())
    }

    /// Recompute `highest_completed` as the longest run of ready steps from
    /// step 1, bounded by the furthest step ever completed.
    fn refresh_progress(&mut self) {
        let mut highest = 0;
        while highest < self.completed_cap && self.is_step_ready(highest + 1) {
            highest += 1;
        }
        self.highest_completed = highest;
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    /// Validate the current step without calling any gate. A gated step
    /// whose verdict is missing yields a ticket for the caller to run.
    pub fn try_advance(&mut self) -> AdvanceOutcome {
        if self.ensure_editable().is_err() {
            return AdvanceOutcome::Locked;
        }

        match self.check_current_step() {
            StepCheck::Blocked(issues) => {
                tracing::debug!(
                    role = %self.role(),
                    step = self.current,
                    issues = issues.len(),
                    "Step blocked by validation"
                );
                AdvanceOutcome::Blocked { issues }
            }
            StepCheck::NeedsVerification(pending) => AdvanceOutcome::NeedsVerification(pending),
            StepCheck::InFlight(gate) => AdvanceOutcome::VerificationInFlight { gate },
            StepCheck::Ready if self.current == self.step_count() => AdvanceOutcome::AtFinalStep,
            StepCheck::Ready => {
                self.completed_cap = self.completed_cap.max(self.current);
                self.current += 1;
                self.refresh_progress();
                tracing::info!(role = %self.role(), step = self.current, "Advanced to step");
                AdvanceOutcome::Advanced { step: self.current }
            }
        }
    }

    /// Validate the current step, consult its gate when needed, and move on.
    pub async fn advance(&mut self, collaborators: &Collaborators) -> AdvanceOutcome {
        match self.try_advance() {
            AdvanceOutcome::NeedsVerification(pending) => {
                let outcome = collaborators.verify(&pending).await;
                let applied = self.complete_verification(pending.ticket, outcome);
                self.resume_advance(pending.ticket.gate, &applied)
            }
            other => other,
        }
    }

    /// Continue an advance whose verification was run by the caller and
    /// already applied with [`Wizard::complete_verification`].
    pub fn resume_advance(&mut self, gate: GateKind, applied: &VerificationApplied) -> AdvanceOutcome {
        match applied {
            VerificationApplied::Applied(result) if !result.valid => AdvanceOutcome::Blocked {
                issues: self.gate_issue(gate, result.reason()),
            },
            _ => self.try_advance(),
        }
    }

    /// Go back one step. Values are kept; nothing is validated.
    pub fn retreat(&mut self) -> bool {
        if self.status.is_succeeded() || self.current <= 1 {
            return false;
        }
        self.current -= 1;
        tracing::debug!(role = %self.role(), step = self.current, "Retreated to step");
        true
    }

    /// Jump to any step up to one past the highest completed step.
    pub fn jump_to(&mut self, step: usize) -> std::result::Result<usize, NavigationError> {
        if self.status.is_succeeded() {
            return Err(NavigationError::Locked);
        }
        if step == 0 || step > self.step_count() {
            return Err(NavigationError::OutOfRange { requested: step });
        }
        let furthest = self.highest_completed + 1;
        if step > furthest {
            return Err(NavigationError::NotReachable {
                requested: step,
                furthest,
            });
        }
        self.current = step;
        Ok(step)
    }

    fn check_current_step(&mut self) -> StepCheck {
        let definition = Arc::clone(&self.definition);
        let step = self.current;
        let snapshot = self.fields.snapshot();
        let required = definition.fields_for(step, &snapshot);

        for name in &required {
            if let Some(field) = self.fields.get_mut(name) {
                field.touched = true;
            }
        }
        if let Some(def) = definition.step(step) {
            for name in def.declared_fields() {
                self.revalidate(name);
            }
        }

        let issues: Vec<FieldIssue> = required
            .iter()
            .copied()
            .filter_map(|name| match self.validity(name) {
                Validity::Valid => None,
                Validity::Invalid(reason) => Some(FieldIssue {
                    field: name,
                    reason,
                }),
                Validity::Unvalidated => Some(FieldIssue {
                    field: name,
                    reason: "Not yet validated".to_string(),
                }),
            })
            .collect();
        self.refresh_progress();
        if !issues.is_empty() {
            return StepCheck::Blocked(issues);
        }

        let Some(binding) = definition.gate_for(step, &snapshot) else {
            return StepCheck::Ready;
        };
        let Some(code) = self.gate_code(binding.field) else {
            let issues = self.gate_issue(binding.gate, "A code is required".to_string());
            return StepCheck::Blocked(issues);
        };
        let state = self.gates.entry(binding.gate).or_default();
        if state.passed_for(&code) {
            return StepCheck::Ready;
        }
        match state.issue(&code) {
            Some(seq) => {
                tracing::debug!(gate = binding.gate.as_str(), ticket = seq, "Issued verification");
                StepCheck::NeedsVerification(PendingVerification {
                    ticket: Ticket {
                        gate: binding.gate,
                        seq,
                    },
                    code,
                })
            }
            None => StepCheck::InFlight(binding.gate),
        }
    }

    fn gate_issue(&self, gate: GateKind, reason: String) -> Vec<FieldIssue> {
        let field = self
            .definition
            .gate_binding(gate)
            .map(|(_, binding)| binding.field)
            .unwrap_or("code");
        vec![FieldIssue { field, reason }]
    }

    // ------------------------------------------------------------------
    // Verification gate
    // ------------------------------------------------------------------

    /// Start a live verification of the current value of `gate`'s field.
    pub fn begin_verification(&mut self, gate: GateKind) -> BeginVerification {
        let definition = Arc::clone(&self.definition);
        let Some((step, binding)) = definition.gate_binding(gate) else {
            return BeginVerification::NotApplicable;
        };
        if step != self.current || self.ensure_editable().is_err() {
            return BeginVerification::NotApplicable;
        }
        if !binding.applies(&self.fields.snapshot()) {
            return BeginVerification::NotApplicable;
        }

        let code = self.gate_code(binding.field);
        if let Some(code) = &code
            && let Some(result) = self.gates.get(&gate).and_then(|s| s.verdict_for(code))
        {
            return BeginVerification::Settled(result.clone());
        }

        if let Some(field) = self.fields.get_mut(binding.field) {
            field.touched = true;
        }
        self.revalidate(binding.field);
        if let Validity::Invalid(reason) = self.validity(binding.field) {
            return BeginVerification::LocallyInvalid(reason);
        }
        let Some(code) = code else {
            return BeginVerification::LocallyInvalid("A code is required".to_string());
        };

        match self.gates.entry(gate).or_default().issue(&code) {
            Some(seq) => {
                tracing::debug!(gate = gate.as_str(), ticket = seq, "Issued verification");
                BeginVerification::Pending(PendingVerification {
                    ticket: Ticket { gate, seq },
                    code,
                })
            }
            None => BeginVerification::Suppressed,
        }
    }

    /// Apply the outcome of a verification issued earlier. Results for a
    /// superseded ticket, or for a code the user has since changed, are
    /// discarded.
    pub fn complete_verification(
        &mut self,
        ticket: Ticket,
        outcome: std::result::Result<VerificationResult, CollaboratorError>,
    ) -> VerificationApplied {
        let definition = Arc::clone(&self.definition);
        let Some((_, binding)) = definition.gate_binding(ticket.gate) else {
            return VerificationApplied::Stale;
        };
        let current = self.gate_code(binding.field);
        let Some(state) = self.gates.get_mut(&ticket.gate) else {
            return VerificationApplied::Stale;
        };
        let Some(code) = state.settle(ticket.seq, current.as_deref()) else {
            tracing::debug!(
                gate = ticket.gate.as_str(),
                ticket = ticket.seq,
                "Discarded stale verification result"
            );
            return VerificationApplied::Stale;
        };

        let (result, definitive) = match outcome {
            Ok(result) => {
                state.record(code, result.clone());
                (result, true)
            }
            Err(e) => {
                tracing::warn!(gate = ticket.gate.as_str(), error = %e, "Verification call failed");
                (VerificationResult::rejected(VERIFY_UNAVAILABLE), false)
            }
        };

        self.revalidate(binding.field);
        if !definitive && let Some(field) = self.fields.get_mut(binding.field) {
            field.validity = Validity::invalid(VERIFY_UNAVAILABLE);
        }
        self.refresh_progress();

        tracing::info!(
            gate = ticket.gate.as_str(),
            ticket = ticket.seq,
            valid = result.valid,
            "Applied verification result"
        );
        VerificationApplied::Applied(result)
    }

    /// Run a verification to completion for the current value.
    pub async fn verify(
        &mut self,
        gate: GateKind,
        collaborators: &Collaborators,
    ) -> BeginVerification {
        match self.begin_verification(gate) {
            BeginVerification::Pending(pending) => {
                let outcome = collaborators.verify(&pending).await;
                match self.complete_verification(pending.ticket, outcome) {
                    VerificationApplied::Applied(result) => BeginVerification::Settled(result),
                    VerificationApplied::Stale => BeginVerification::Suppressed,
                }
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Upload any attached files, then create the account. Each call is a
    /// single attempt; after a failure the same call retries everything.
    pub async fn submit(&mut self, collaborators: &Collaborators) -> SubmitOutcome {
        if self.status.is_succeeded() {
            return SubmitOutcome::AlreadySubmitted;
        }
        if self.current != self.step_count() {
            return SubmitOutcome::NotOnFinalStep {
                current: self.current,
            };
        }

        let check = match self.check_current_step() {
            StepCheck::NeedsVerification(pending) => {
                let outcome = collaborators.verify(&pending).await;
                match self.complete_verification(pending.ticket, outcome) {
                    VerificationApplied::Applied(result) if !result.valid => StepCheck::Blocked(
                        self.gate_issue(pending.ticket.gate, result.reason()),
                    ),
                    VerificationApplied::Applied(_) => self.check_current_step(),
                    VerificationApplied::Stale => StepCheck::InFlight(pending.ticket.gate),
                }
            }
            other => other,
        };
        match check {
            StepCheck::Ready => {}
            StepCheck::Blocked(issues) => return SubmitOutcome::Blocked { issues },
            StepCheck::NeedsVerification(PendingVerification { ticket, .. }) => {
                return SubmitOutcome::Blocked {
                    issues: self.gate_issue(ticket.gate, VERIFY_UNAVAILABLE.to_string()),
                };
            }
            StepCheck::InFlight(gate) => {
                return SubmitOutcome::Blocked {
                    issues: self.gate_issue(gate, "Verification still in progress".to_string()),
                };
            }
        }

        if matches!(self.status, SubmissionStatus::Failed { .. }) {
            self.transition(SubmissionStatus::Idle);
        }

        let uploaded = match self.upload_files(collaborators).await {
            Ok(uploaded) => uploaded,
            Err(reason) => {
                tracing::warn!(role = %self.role(), reason = %reason, "Upload failed");
                self.transition(SubmissionStatus::Failed {
                    reason: reason.clone(),
                });
                return SubmitOutcome::Failed { reason };
            }
        };

        self.transition(SubmissionStatus::Submitting);
        let payload = self.payload(&uploaded);
        tracing::info!(role = %self.role(), fields = payload.fields.len(), "Submitting registration");

        match collaborators.registrar.register(&payload).await {
            Ok(account) => {
                let handoff = Handoff {
                    email_or_identifier: self
                        .value(self.definition.identifier())
                        .and_then(|v| v.as_str())
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                    is_new_registration: true,
                };
                tracing::info!(role = %self.role(), account = %account.0, "Registration succeeded");
                self.transition(SubmissionStatus::Succeeded { account });
                self.handoff = Some(handoff.clone());
                SubmitOutcome::Succeeded(handoff)
            }
            Err(e) => {
                let reason = describe_failure(&e);
                tracing::warn!(role = %self.role(), error = %e, "Registration failed");
                self.transition(SubmissionStatus::Failed {
                    reason: reason.clone(),
                });
                SubmitOutcome::Failed { reason }
            }
        }
    }

    /// Clear a failed submission back to idle without retrying.
    pub fn reset_failure(&mut self) -> bool {
        if matches!(self.status, SubmissionStatus::Failed { .. }) {
            self.transition(SubmissionStatus::Idle);
            true
        } else {
            false
        }
    }

    async fn upload_files(
        &mut self,
        collaborators: &Collaborators,
    ) -> std::result::Result<BTreeMap<&'static str, String>, String> {
        let snapshot = self.fields.snapshot();
        let active = self.definition.active_fields(&snapshot);
        let files: Vec<(&'static str, FileRef)> = snapshot
            .iter()
            .filter(|(name, _)| active.contains(name))
            .filter(|(name, _)| self.definition.field(name).is_some_and(|s| s.in_payload))
            .filter_map(|(name, value)| match value {
                FieldValue::File(file) => Some((name, file.clone())),
                _ => None,
            })
            .collect();

        let mut uploaded = BTreeMap::new();
        if files.is_empty() {
            return Ok(uploaded);
        }

        self.transition(SubmissionStatus::Uploading);
        for (name, file) in files {
            tracing::debug!(field = name, size = file.size, "Uploading file");
            match collaborators.uploader.upload(&file).await {
                Ok(done) => {
                    uploaded.insert(name, done.url);
                }
                Err(e) => return Err(upload_failure_reason(&e)),
            }
        }
        Ok(uploaded)
    }

    /// Assemble the backend payload from the fields whose requirement holds
    /// right now. Inactive conditional fields and client-only fields are left
    /// out entirely; file fields appear as their uploaded URL.
    pub fn payload(&self, uploaded: &BTreeMap<&'static str, String>) -> RegistrationPayload {
        let snapshot = self.fields.snapshot();
        let mut fields = Map::new();

        for name in self.definition.active_fields(&snapshot) {
            let Some(spec) = self.definition.field(name) else {
                continue;
            };
            if !spec.in_payload {
                continue;
            }
            match snapshot.get(name) {
                Some(FieldValue::File(_)) => {
                    if let Some(url) = uploaded.get(name) {
                        fields.insert(upload_key(name), Value::String(url.clone()));
                    }
                }
                Some(value) if !value.is_blank() => {
                    let json = if spec.verbatim {
                        value.to_verbatim_json()
                    } else {
                        value.to_payload_json()
                    };
                    if let Some(json) = json {
                        fields.insert(name.to_string(), json);
                    }
                }
                _ => {}
            }
        }

        RegistrationPayload {
            role: self.role(),
            fields,
        }
    }

    fn transition(&mut self, next: SubmissionStatus) {
        if self.status.can_transition_to(&next) {
            self.status = next;
        } else {
            tracing::error!(from = ?self.status, to = ?next, "Rejected submission status transition");
        }
    }

    // ------------------------------------------------------------------
    // Presentation
    // ------------------------------------------------------------------

    pub fn view(&self) -> WizardView {
        let snapshot = self.fields.snapshot();
        let steps = self
            .definition
            .steps()
            .map(|(index, step)| StepView {
                index,
                label: step.label,
                complete: index <= self.highest_completed,
            })
            .collect();

        let current_fields = self
            .definition
            .step(self.current)
            .map(|step| {
                step.declared_fields()
                    .filter_map(|name| {
                        let spec = self.definition.field(name)?;
                        let field = self.fields.get(name)?;
                        let active = self.definition.is_active(name, &snapshot);
                        Some(FieldView {
                            name,
                            label: spec.label,
                            kind: spec.kind,
                            active,
                            optional: spec.optional,
                            value: field.value.clone(),
                            validity: field.validity.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let gates = self
            .definition
            .gate_for(self.current, &snapshot)
            .and_then(|binding| {
                let state = self.gates.get(&binding.gate)?;
                let code = self.gate_code(binding.field)?;
                Some(GateView {
                    gate: binding.gate,
                    field: binding.field,
                    pending: state.in_flight_code() == Some(code.as_str()),
                    result: state.verdict_for(&code).cloned(),
                    code,
                })
            })
            .into_iter()
            .collect();

        WizardView {
            role: self.role(),
            current_step: self.current,
            step_count: self.step_count(),
            highest_completed_step: self.highest_completed,
            steps,
            fields: current_fields,
            gates,
            status: self.status.clone(),
            handoff: self.handoff.clone(),
        }
    }
}

/// Serializable summary of a wizard for the page that renders it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardView {
    pub role: Role,
    pub current_step: usize,
    pub step_count: usize,
    pub highest_completed_step: usize,
    pub steps: Vec<StepView>,
    pub fields: Vec<FieldView>,
    pub gates: Vec<GateView>,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff: Option<Handoff>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub index: usize,
    pub label: &'static str,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldView {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub active: bool,
    pub optional: bool,
    pub value: Option<FieldValue>,
    pub validity: Validity,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateView {
    pub gate: GateKind,
    pub field: &'static str,
    pub code: String,
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<VerificationResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{SubjectKind, Verifier};
    use crate::submission::{AccountRef, FileUploader, Registrar, UploadedFile};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 15).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> FieldValue {
        FieldValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[derive(Default)]
    struct FakeVerifier {
        answers: HashMap<&'static str, VerificationResult>,
        calls: AtomicUsize,
        offline: AtomicBool,
    }

    #[async_trait]
    impl Verifier for FakeVerifier {
        async fn verify(
            &self,
            code: &str,
        ) -> std::result::Result<VerificationResult, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(CollaboratorError::network("connection refused"));
            }
            Ok(self
                .answers
                .get(code)
                .cloned()
                .unwrap_or_else(|| VerificationResult::rejected("not found")))
        }
    }

    #[derive(Default)]
    struct FakeUploader {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl FileUploader for FakeUploader {
        async fn upload(
            &self,
            file: &FileRef,
        ) -> std::result::Result<UploadedFile, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(CollaboratorError::network("connection reset"));
            }
            Ok(UploadedFile {
                url: format!("https://files.test/{}", file.name),
            })
        }
    }

    #[derive(Default)]
    struct FakeRegistrar {
        payloads: Mutex<Vec<RegistrationPayload>>,
        reject_with: Mutex<Option<CollaboratorError>>,
    }

    #[async_trait]
    impl Registrar for FakeRegistrar {
        async fn register(
            &self,
            payload: &RegistrationPayload,
        ) -> std::result::Result<AccountRef, CollaboratorError> {
            self.payloads.lock().unwrap().push(payload.clone());
            match self.reject_with.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(AccountRef("acc-42".to_string())),
            }
        }
    }

    struct Harness {
        verifier: Arc<FakeVerifier>,
        uploader: Arc<FakeUploader>,
        registrar: Arc<FakeRegistrar>,
        collaborators: Collaborators,
    }

    fn harness() -> Harness {
        let mut answers = HashMap::new();
        answers.insert("ABC123", VerificationResult::rejected("expired"));
        answers.insert(
            "VALID99",
            VerificationResult::accepted("Downtown Clinic", Some(SubjectKind::Clinic)),
        );
        answers.insert(
            "STAFF42",
            VerificationResult::accepted("Riverside Hospital", Some(SubjectKind::Hospital)),
        );
        let verifier = Arc::new(FakeVerifier {
            answers,
            ..Default::default()
        });
        let uploader = Arc::new(FakeUploader::default());
        let registrar = Arc::new(FakeRegistrar::default());
        let collaborators = Collaborators::new(uploader.clone(), registrar.clone())
            .with_verifier(GateKind::ClinicInvitation, verifier.clone())
            .with_verifier(GateKind::StaffInvitation, verifier.clone());
        Harness {
            verifier,
            uploader,
            registrar,
            collaborators,
        }
    }

    fn wizard(role: Role) -> Wizard {
        Wizard::new(Arc::new(role.definition().unwrap())).with_clock(today)
    }

    fn set(w: &mut Wizard, name: &str, value: FieldValue) -> Validity {
        w.set_value(name, Some(value)).unwrap()
    }

    fn fill_account(w: &mut Wizard) {
        set(w, "email", FieldValue::text("jane@clinic.org"));
        set(w, "password", FieldValue::text("Abcdefg1"));
        set(w, "confirmPassword", FieldValue::text("Abcdefg1"));
    }

    fn fill_personal(w: &mut Wizard, dob: FieldValue) {
        set(w, "firstName", FieldValue::text("Jane"));
        set(w, "lastName", FieldValue::text("Doe"));
        set(w, "dateOfBirth", dob);
        set(w, "gender", FieldValue::choice("female"));
        set(w, "phone", FieldValue::text("+1 555 010 2030"));
    }

    fn certificate() -> FileRef {
        FileRef::new("license.pdf", "application/pdf", vec![7; 64])
    }

    async fn doctor_at_practice(h: &Harness) -> Wizard {
        let mut w = wizard(Role::Doctor);
        fill_account(&mut w);
        assert_eq!(w.advance(&h.collaborators).await, AdvanceOutcome::Advanced { step: 2 });
        fill_personal(&mut w, date(1980, 1, 1));
        assert_eq!(w.advance(&h.collaborators).await, AdvanceOutcome::Advanced { step: 3 });
        set(&mut w, "specialty", FieldValue::choice("cardiology"));
        set(&mut w, "licenseNumber", FieldValue::text("LIC-55501"));
        set(&mut w, "yearsOfExperience", FieldValue::Number(12.0));
        set(&mut w, "qualifications", FieldValue::choices(["md"]));
        w.set_file("certificationFile", certificate()).unwrap();
        assert_eq!(w.advance(&h.collaborators).await, AdvanceOutcome::Advanced { step: 4 });
        w
    }

    async fn staff_at_role(h: &Harness) -> Wizard {
        let mut w = wizard(Role::Staff);
        fill_account(&mut w);
        w.advance(&h.collaborators).await;
        fill_personal(&mut w, date(1990, 3, 3));
        assert_eq!(w.advance(&h.collaborators).await, AdvanceOutcome::Advanced { step: 3 });
        w
    }

    #[test]
    fn test_new_wizard_starts_at_step_one() {
        let w = wizard(Role::Patient);
        assert_eq!(w.current_step(), 1);
        assert_eq!(w.highest_completed_step(), 0);
        assert_eq!(w.status(), &SubmissionStatus::Idle);
        assert_eq!(w.validity("email"), Validity::Unvalidated);
    }

    #[tokio::test]
    async fn test_advance_blocked_by_untouched_required_fields() {
        let h = harness();
        let mut w = wizard(Role::Patient);
        set(&mut w, "email", FieldValue::text("jane@clinic.org"));

        match w.advance(&h.collaborators).await {
            AdvanceOutcome::Blocked { issues } => {
                let fields: Vec<_> = issues.iter().map(|i| i.field).collect();
                assert!(fields.contains(&"password"));
                assert!(fields.contains(&"confirmPassword"));
                assert!(!fields.contains(&"email"));
            }
            other => panic!("expected Blocked, got {:?}", other),
        }
        assert_eq!(w.current_step(), 1);
    }

    #[test]
    fn test_password_confirmation_cross_field() {
        let mut w = wizard(Role::Patient);
        set(&mut w, "password", FieldValue::text("Abcdefg1"));
        let mismatch = set(&mut w, "confirmPassword", FieldValue::text("Abcdefg2"));
        assert_eq!(
            mismatch.reason().map(str::to_lowercase).as_deref(),
            Some("passwords do not match")
        );

        let fixed = set(&mut w, "confirmPassword", FieldValue::text("Abcdefg1"));
        assert_eq!(fixed, Validity::Valid);
    }

    #[test]
    fn test_changing_password_revalidates_confirmation() {
        let mut w = wizard(Role::Patient);
        set(&mut w, "password", FieldValue::text("Abcdefg1"));
        set(&mut w, "confirmPassword", FieldValue::text("Abcdefg1"));
        assert!(w.validity("confirmPassword").is_valid());

        set(&mut w, "password", FieldValue::text("Abcdefg9"));
        assert!(!w.validity("confirmPassword").is_valid());
    }

    #[tokio::test]
    async fn test_password_sent_exactly_as_validated() {
        let h = harness();
        let mut w = wizard(Role::Patient);
        set(&mut w, "email", FieldValue::text("jane@clinic.org"));
        assert!(set(&mut w, "password", FieldValue::text("Abcdef1 ")).is_valid());
        assert!(set(&mut w, "confirmPassword", FieldValue::text("Abcdef1 ")).is_valid());
        w.advance(&h.collaborators).await;
        set(&mut w, "firstName", FieldValue::text("  Jane "));

        let payload = w.payload(&BTreeMap::new());
        assert_eq!(payload.get("password"), Some(&serde_json::json!("Abcdef1 ")));
        assert_eq!(payload.get("firstName"), Some(&serde_json::json!("Jane")));
    }

    #[tokio::test]
    async fn test_patient_age_bounds() {
        let h = harness();
        let mut w = wizard(Role::Patient);
        fill_account(&mut w);
        w.advance(&h.collaborators).await;

        let twelve = set(&mut w, "dateOfBirth", date(2013, 6, 16));
        assert!(twelve.reason().unwrap().contains("at least 13 years old"));

        let thirteen = set(&mut w, "dateOfBirth", date(2013, 6, 15));
        assert_eq!(thirteen, Validity::Valid);
    }

    #[test]
    fn test_field_on_other_step_is_rejected() {
        let mut w = wizard(Role::Patient);
        let err = w
            .set_value("firstName", Some(FieldValue::text("Jane")))
            .unwrap_err();
        assert!(matches!(err, IntakeError::NotOnCurrentStep { owner: 2, current: 1, .. }));

        let err = w.set_value("nickname", None).unwrap_err();
        assert!(matches!(err, IntakeError::UnknownField(_)));
    }

    #[test]
    fn test_set_json_reports_shape_errors_as_validity() {
        let mut w = wizard(Role::Patient);
        let validity = w
            .set_json("email", &serde_json::json!(["not", "text"]))
            .unwrap();
        assert_eq!(validity, Validity::invalid("Expected text"));
        assert!(w.value("email").is_none());
    }

    #[tokio::test]
    async fn test_retreat_preserves_values() {
        let h = harness();
        let mut w = wizard(Role::Patient);
        fill_account(&mut w);
        w.advance(&h.collaborators).await;
        assert_eq!(w.current_step(), 2);

        assert!(w.retreat());
        assert_eq!(w.current_step(), 1);
        assert_eq!(w.value("email"), Some(&FieldValue::text("jane@clinic.org")));
        assert!(!w.retreat());
    }

    #[tokio::test]
    async fn test_jump_to_never_skips_ahead() {
        let h = harness();
        let mut w = wizard(Role::Patient);
        assert_eq!(
            w.jump_to(2),
            Err(NavigationError::NotReachable {
                requested: 2,
                furthest: 1
            })
        );
        assert_eq!(w.jump_to(0), Err(NavigationError::OutOfRange { requested: 0 }));

        fill_account(&mut w);
        w.advance(&h.collaborators).await;
        fill_personal(&mut w, date(1990, 1, 1));
        w.advance(&h.collaborators).await;
        assert_eq!(w.current_step(), 3);
        assert_eq!(w.highest_completed_step(), 2);

        assert_eq!(w.jump_to(1), Ok(1));
        assert_eq!(w.jump_to(3), Ok(3));
        assert!(matches!(
            w.jump_to(4),
            Err(NavigationError::NotReachable { requested: 4, .. })
        ));
        assert_eq!(w.current_step(), 3);
    }

    #[tokio::test]
    async fn test_invalidating_earlier_step_lowers_progress() {
        let h = harness();
        let mut w = wizard(Role::Patient);
        fill_account(&mut w);
        w.advance(&h.collaborators).await;
        fill_personal(&mut w, date(1990, 1, 1));
        w.advance(&h.collaborators).await;
        assert_eq!(w.highest_completed_step(), 2);

        w.jump_to(1).unwrap();
        set(&mut w, "email", FieldValue::text("broken"));
        assert_eq!(w.highest_completed_step(), 0);
        assert!(w.jump_to(3).is_err());

        set(&mut w, "email", FieldValue::text("jane@clinic.org"));
        assert_eq!(w.highest_completed_step(), 2);
        assert_eq!(w.jump_to(3), Ok(3));
    }

    #[tokio::test]
    async fn test_doctor_invitation_code_gate() {
        let h = harness();
        let mut w = doctor_at_practice(&h).await;
        set(&mut w, "practiceType", FieldValue::choice("existing_clinic"));

        match w.advance(&h.collaborators).await {
            AdvanceOutcome::Blocked { issues } => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].field, "clinicInvitationCode");
            }
            other => panic!("expected Blocked, got {:?}", other),
        }
        assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 0);

        set(&mut w, "clinicInvitationCode", FieldValue::text("ABC123"));
        match w.advance(&h.collaborators).await {
            AdvanceOutcome::Blocked { issues } => assert_eq!(issues[0].reason, "expired"),
            other => panic!("expected Blocked, got {:?}", other),
        }
        assert_eq!(w.validity("clinicInvitationCode"), Validity::invalid("expired"));
        assert!(!w.is_step_ready(4));

        set(&mut w, "clinicInvitationCode", FieldValue::text("VALID99"));
        assert_eq!(w.advance(&h.collaborators).await, AdvanceOutcome::AtFinalStep);
        assert!(w.is_step_ready(4));
        let verdict = w
            .gate(GateKind::ClinicInvitation)
            .and_then(|g| g.verdict_for("VALID99"))
            .unwrap();
        assert_eq!(verdict.subject_name.as_deref(), Some("Downtown Clinic"));
        assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_editing_verified_code_requires_regating() {
        let h = harness();
        let mut w = doctor_at_practice(&h).await;
        set(&mut w, "practiceType", FieldValue::choice("existing_clinic"));
        set(&mut w, "clinicInvitationCode", FieldValue::text("VALID99"));
        assert_eq!(
            w.verify(GateKind::ClinicInvitation, &h.collaborators).await,
            BeginVerification::Settled(VerificationResult::accepted(
                "Downtown Clinic",
                Some(SubjectKind::Clinic)
            ))
        );
        assert!(w.is_step_ready(4));

        set(&mut w, "clinicInvitationCode", FieldValue::text("VALID98"));
        assert!(!w.is_step_ready(4));
        set(&mut w, "clinicInvitationCode", FieldValue::text("VALID99"));
        assert!(!w.is_step_ready(4));
        assert!(matches!(
            w.try_advance(),
            AdvanceOutcome::NeedsVerification(_)
        ));
    }

    #[tokio::test]
    async fn test_stale_verification_is_discarded() {
        let h = harness();
        let mut w = doctor_at_practice(&h).await;
        set(&mut w, "practiceType", FieldValue::choice("existing_clinic"));
        set(&mut w, "clinicInvitationCode", FieldValue::text("VALID99"));

        let BeginVerification::Pending(pending) = w.begin_verification(GateKind::ClinicInvitation)
        else {
            panic!("expected a pending verification");
        };
        assert_eq!(
            w.begin_verification(GateKind::ClinicInvitation),
            BeginVerification::Suppressed
        );

        set(&mut w, "clinicInvitationCode", FieldValue::text("OTHER77"));
        let applied = w.complete_verification(
            pending.ticket,
            Ok(VerificationResult::accepted("Downtown Clinic", None)),
        );
        assert_eq!(applied, VerificationApplied::Stale);
        assert!(!w.is_step_ready(4));
        assert!(
            w.gate(GateKind::ClinicInvitation)
                .unwrap()
                .verdict_for("OTHER77")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_superseded_ticket_is_discarded() {
        let h = harness();
        let mut w = staff_at_role(&h).await;
        set(&mut w, "staffRole", FieldValue::choice("nurse"));
        set(&mut w, "invitationCode", FieldValue::text("FIRST11"));
        let BeginVerification::Pending(first) = w.begin_verification(GateKind::StaffInvitation)
        else {
            panic!("expected pending");
        };

        set(&mut w, "invitationCode", FieldValue::text("STAFF42"));
        let BeginVerification::Pending(second) = w.begin_verification(GateKind::StaffInvitation)
        else {
            panic!("expected pending");
        };

        let late = w.complete_verification(first.ticket, Ok(VerificationResult::accepted("x", None)));
        assert_eq!(late, VerificationApplied::Stale);

        let fresh = w.complete_verification(
            second.ticket,
            Ok(VerificationResult::accepted("Riverside Hospital", None)),
        );
        assert!(matches!(fresh, VerificationApplied::Applied(r) if r.valid));
        assert!(w.is_step_ready(3));
    }

    #[tokio::test]
    async fn test_verifier_outage_is_recoverable() {
        let h = harness();
        let mut w = staff_at_role(&h).await;
        set(&mut w, "staffRole", FieldValue::choice("nurse"));
        set(&mut w, "invitationCode", FieldValue::text("STAFF42"));

        h.verifier.offline.store(true, Ordering::SeqCst);
        match w.verify(GateKind::StaffInvitation, &h.collaborators).await {
            BeginVerification::Settled(result) => {
                assert!(!result.valid);
                assert_eq!(result.reason(), VERIFY_UNAVAILABLE);
            }
            other => panic!("expected Settled, got {:?}", other),
        }
        assert_eq!(w.validity("invitationCode"), Validity::invalid(VERIFY_UNAVAILABLE));

        h.verifier.offline.store(false, Ordering::SeqCst);
        match w.verify(GateKind::StaffInvitation, &h.collaborators).await {
            BeginVerification::Settled(result) => assert!(result.valid),
            other => panic!("expected Settled, got {:?}", other),
        }
        assert!(w.validity("invitationCode").is_valid());
    }

    #[tokio::test]
    async fn test_staff_custom_role_condition() {
        let h = harness();
        let mut w = staff_at_role(&h).await;
        set(&mut w, "invitationCode", FieldValue::text("STAFF42"));
        set(&mut w, "staffRole", FieldValue::choice("other"));
        set(&mut w, "customRole", FieldValue::text(""));

        match w.try_advance() {
            AdvanceOutcome::Blocked { issues } => {
                assert!(issues.iter().any(|i| i.field == "customRole"));
            }
            other => panic!("expected Blocked, got {:?}", other),
        }

        set(&mut w, "customRole", FieldValue::text("x"));
        assert!(!w.validity("customRole").is_valid());
        set(&mut w, "customRole", FieldValue::text("Scribe"));
        assert!(w.validity("customRole").is_valid());

        set(&mut w, "customRole", FieldValue::text("x"));
        set(&mut w, "staffRole", FieldValue::choice("receptionist"));
        assert_eq!(w.validity("customRole"), Validity::Unvalidated);
        assert_eq!(w.value("customRole"), Some(&FieldValue::text("x")));
        assert!(matches!(
            w.try_advance(),
            AdvanceOutcome::NeedsVerification(_)
        ));
    }

    #[tokio::test]
    async fn test_conditional_fields_excluded_when_branch_switched() {
        let h = harness();
        let mut w = doctor_at_practice(&h).await;
        set(&mut w, "practiceType", FieldValue::choice("private_clinic"));
        set(&mut w, "clinicName", FieldValue::text("x"));
        set(&mut w, "clinicAddress", FieldValue::text("1 Main Street"));
        assert!(!w.validity("clinicName").is_valid());

        set(&mut w, "practiceType", FieldValue::choice("hospital"));
        set(&mut w, "hospitalName", FieldValue::text("St. Mary's"));
        assert_eq!(w.validity("clinicName"), Validity::Unvalidated);
        assert_eq!(w.try_advance(), AdvanceOutcome::AtFinalStep);

        let payload = w.payload(&BTreeMap::new());
        assert_eq!(payload.get("hospitalName"), Some(&serde_json::json!("St. Mary's")));
        assert!(!payload.contains("clinicName"));
        assert!(!payload.contains("clinicAddress"));
        assert!(!payload.contains("clinicInvitationCode"));
        assert!(!payload.contains("confirmPassword"));
        assert!(!payload.contains("consultationFee"));

        // Toggling back restores the retained values.
        set(&mut w, "practiceType", FieldValue::choice("private_clinic"));
        assert_eq!(w.value("clinicAddress"), Some(&FieldValue::text("1 Main Street")));
        assert!(w.validity("clinicAddress").is_valid());
    }

    #[tokio::test]
    async fn test_doctor_submission_uploads_then_registers() {
        let h = harness();
        let mut w = doctor_at_practice(&h).await;
        set(&mut w, "practiceType", FieldValue::choice("independent"));
        set(&mut w, "consultationFee", FieldValue::Number(80.0));

        let outcome = w.submit(&h.collaborators).await;
        assert_eq!(
            outcome,
            SubmitOutcome::Succeeded(Handoff {
                email_or_identifier: "jane@clinic.org".to_string(),
                is_new_registration: true,
            })
        );
        assert!(w.status().is_succeeded());
        assert_eq!(h.uploader.calls.load(Ordering::SeqCst), 1);

        let payloads = h.registrar.payloads.lock().unwrap();
        let sent = &payloads[0];
        assert_eq!(sent.role, Role::Doctor);
        assert_eq!(
            sent.get("certificationUrl"),
            Some(&serde_json::json!("https://files.test/license.pdf"))
        );
        assert_eq!(sent.get("yearsOfExperience"), Some(&serde_json::json!(12)));
        assert_eq!(sent.get("consultationFee"), Some(&serde_json::json!(80)));
        assert!(!sent.contains("certificationFile"));
    }

    #[tokio::test]
    async fn test_upload_failure_aborts_before_registration() {
        let h = harness();
        let mut w = doctor_at_practice(&h).await;
        set(&mut w, "practiceType", FieldValue::choice("independent"));
        h.uploader.failing.store(true, Ordering::SeqCst);

        let outcome = w.submit(&h.collaborators).await;
        let SubmitOutcome::Failed { reason } = outcome else {
            panic!("expected failure");
        };
        assert!(reason.starts_with("upload error"));
        assert_eq!(w.status().failure(), Some(reason.as_str()));
        assert!(h.registrar.payloads.lock().unwrap().is_empty());
        assert_eq!(w.current_step(), 4);
        assert_eq!(w.value("licenseNumber"), Some(&FieldValue::text("LIC-55501")));

        // Retry re-runs the whole pipeline without re-entering any step.
        h.uploader.failing.store(false, Ordering::SeqCst);
        assert!(matches!(
            w.submit(&h.collaborators).await,
            SubmitOutcome::Succeeded(_)
        ));
        assert_eq!(h.uploader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.registrar.payloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_registration_failure_keeps_data_for_retry() {
        let h = harness();
        let mut w = staff_at_role(&h).await;
        set(&mut w, "staffRole", FieldValue::choice("nurse"));
        set(&mut w, "invitationCode", FieldValue::text("STAFF42"));
        *h.registrar.reject_with.lock().unwrap() =
            Some(CollaboratorError::rejected("email_taken", "duplicate"));

        let outcome = w.submit(&h.collaborators).await;
        assert_eq!(
            outcome,
            SubmitOutcome::Failed {
                reason: "An account with this email already exists.".to_string()
            }
        );
        assert_eq!(w.current_step(), 3);
        assert_eq!(h.uploader.calls.load(Ordering::SeqCst), 0);
        assert!(w.jump_to(1).is_ok());
        assert!(w.jump_to(3).is_ok());

        *h.registrar.reject_with.lock().unwrap() = None;
        assert!(matches!(
            w.submit(&h.collaborators).await,
            SubmitOutcome::Succeeded(_)
        ));
        // The gate verdict was reused for the unchanged code.
        assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.registrar.payloads.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unexpected_registrar_error_becomes_generic_failure() {
        let h = harness();
        let mut w = staff_at_role(&h).await;
        set(&mut w, "staffRole", FieldValue::choice("nurse"));
        set(&mut w, "invitationCode", FieldValue::text("STAFF42"));
        *h.registrar.reject_with.lock().unwrap() =
            Some(CollaboratorError::unexpected("panic in handler"));

        w.submit(&h.collaborators).await;
        assert_eq!(
            w.status(),
            &SubmissionStatus::Failed {
                reason: crate::collab::GENERIC_FAILURE.to_string()
            }
        );
        assert!(w.reset_failure());
        assert_eq!(w.status(), &SubmissionStatus::Idle);
    }

    #[tokio::test]
    async fn test_submit_requires_final_step() {
        let h = harness();
        let mut w = wizard(Role::Patient);
        assert_eq!(
            w.submit(&h.collaborators).await,
            SubmitOutcome::NotOnFinalStep { current: 1 }
        );
    }

    #[tokio::test]
    async fn test_completed_wizard_is_locked() {
        let h = harness();
        let mut w = staff_at_role(&h).await;
        set(&mut w, "staffRole", FieldValue::choice("nurse"));
        set(&mut w, "invitationCode", FieldValue::text("STAFF42"));
        assert!(matches!(
            w.submit(&h.collaborators).await,
            SubmitOutcome::Succeeded(_)
        ));

        assert_eq!(
            w.submit(&h.collaborators).await,
            SubmitOutcome::AlreadySubmitted
        );
        assert!(matches!(
            w.set_value("department", None),
            Err(IntakeError::Completed)
        ));
        assert!(!w.retreat());
        assert_eq!(w.try_advance(), AdvanceOutcome::Locked);
        assert_eq!(w.handoff().unwrap().email_or_identifier, "jane@clinic.org");
    }

    #[tokio::test]
    async fn test_patient_full_flow_without_files() {
        let h = harness();
        let mut w = wizard(Role::Patient);
        fill_account(&mut w);
        w.advance(&h.collaborators).await;
        fill_personal(&mut w, date(2000, 5, 20));
        w.advance(&h.collaborators).await;
        set(&mut w, "emergencyContactName", FieldValue::text("John Doe"));
        set(&mut w, "emergencyContactPhone", FieldValue::text("555-010-9999"));
        set(&mut w, "allergies", FieldValue::choices(["latex"]));
        assert_eq!(w.advance(&h.collaborators).await, AdvanceOutcome::Advanced { step: 4 });

        set(&mut w, "consents", FieldValue::choices(["terms"]));
        assert!(matches!(
            w.submit(&h.collaborators).await,
            SubmitOutcome::Blocked { .. }
        ));
        set(&mut w, "consents", FieldValue::choices(["terms", "privacy"]));
        assert!(matches!(
            w.submit(&h.collaborators).await,
            SubmitOutcome::Succeeded(_)
        ));
        assert_eq!(h.uploader.calls.load(Ordering::SeqCst), 0);

        let payloads = h.registrar.payloads.lock().unwrap();
        assert_eq!(payloads[0].get("dateOfBirth"), Some(&serde_json::json!("2000-05-20")));
        assert_eq!(payloads[0].get("allergies"), Some(&serde_json::json!(["latex"])));
        assert!(!payloads[0].contains("bloodType"));
    }

    #[tokio::test]
    async fn test_view_reports_current_step_fields() {
        let h = harness();
        let mut w = doctor_at_practice(&h).await;
        set(&mut w, "practiceType", FieldValue::choice("existing_clinic"));
        set(&mut w, "clinicInvitationCode", FieldValue::text("VALID99"));
        w.verify(GateKind::ClinicInvitation, &h.collaborators).await;

        let view = w.view();
        assert_eq!(view.current_step, 4);
        assert_eq!(view.highest_completed_step, 3);
        let code = view
            .fields
            .iter()
            .find(|f| f.name == "clinicInvitationCode")
            .unwrap();
        assert!(code.active);
        let clinic_name = view.fields.iter().find(|f| f.name == "clinicName").unwrap();
        assert!(!clinic_name.active);
        assert_eq!(view.gates.len(), 1);
        assert_eq!(
            view.gates[0].result.as_ref().and_then(|r| r.subject_name.as_deref()),
            Some("Downtown Clinic")
        );

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["currentStep"], 4);
        assert_eq!(json["status"]["state"], "idle");
    }
}
