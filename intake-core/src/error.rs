use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Field {field} belongs to step {owner}, not the current step {current}")]
    NotOnCurrentStep {
        field: String,
        owner: usize,
        current: usize,
    },

    #[error("Invalid wizard definition: {message}")]
    Definition { message: String },

    #[error("Wizard is busy submitting")]
    Busy,

    #[error("Registration already completed")]
    Completed,
}

impl IntakeError {
    pub(crate) fn definition(message: impl Into<String>) -> Self {
        Self::Definition {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IntakeError>;
