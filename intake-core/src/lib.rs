//! intake-core - staged registration wizard engine
//!
//! Field rules, step tables, external verification gates and the submission
//! pipeline shared by the patient, doctor and staff registration flows.

pub mod collab;
pub mod error;
pub mod field;
pub mod gate;
pub mod rules;
pub mod steps;
pub mod submission;
pub mod variants;
pub mod wizard;

pub use collab::{CollaboratorError, Collaborators, FailureKind, describe_failure};
pub use error::{IntakeError, Result};
pub use field::{FieldKind, FieldValue, FileRef, Snapshot, Validity, WizardField};
pub use gate::{
    BeginVerification, GateKind, PendingVerification, SubjectKind, Ticket, VerificationApplied,
    VerificationResult, Verifier,
};
pub use rules::{FieldSpec, Rule};
pub use steps::{Predicate, StepDef, WizardDefinition};
pub use submission::{
    AccountRef, FileUploader, Handoff, Registrar, RegistrationPayload, SubmissionStatus,
    UPLOAD_ERROR, UploadedFile,
};
pub use variants::Role;
pub use wizard::{
    AdvanceOutcome, Clock, FieldIssue, FieldView, GateView, NavigationError, StepView,
    SubmitOutcome, Wizard, WizardView,
};
