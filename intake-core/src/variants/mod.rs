//! The three registration wizards built on the shared engine.
//!
//! Patient, doctor and staff registration differ only in their step tables
//! and field rules. Account and personal-details fields are shared; age
//! bounds differ per role.

mod doctor;
mod patient;
mod staff;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{IntakeError, Result};
use crate::field::FieldKind;
use crate::rules::{FieldSpec, Rule};
use crate::steps::WizardDefinition;

pub use doctor::{PRACTICE_TYPES, SPECIALTIES};
pub use staff::STAFF_ROLES;

pub const GENDERS: &[&str] = &["male", "female", "other", "prefer_not_to_say"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Doctor,
    Staff,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Patient, Role::Doctor, Role::Staff];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Staff => "staff",
        }
    }

    /// Build the wizard definition for this role.
    pub fn definition(self) -> Result<WizardDefinition> {
        match self {
            Role::Patient => patient::definition(),
            Role::Doctor => doctor::definition(),
            Role::Staff => staff::definition(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            "staff" => Ok(Role::Staff),
            _ => Err(IntakeError::definition(format!("unknown role '{}'", s))),
        }
    }
}

/// Step 1 of every wizard.
pub(crate) const ACCOUNT_FIELDS: [&str; 3] = ["email", "password", "confirmPassword"];

pub(crate) fn account_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::text("email", "Email")
            .rule(Rule::Email)
            .rule(Rule::MaxLength(254)),
        FieldSpec::text("password", "Password")
            .verbatim()
            .rule(Rule::Password)
            .rule(Rule::MaxLength(128)),
        FieldSpec::text("confirmPassword", "Confirm password")
            .client_only()
            .verbatim()
            .rule(Rule::Matches {
                field: "password",
                message: "Passwords do not match",
            }),
    ]
}

pub(crate) const PERSONAL_FIELDS: [&str; 5] =
    ["firstName", "lastName", "dateOfBirth", "gender", "phone"];

/// Personal details shared by every role; only the age bounds differ.
pub(crate) fn personal_fields(min_age: i32, max_age: i32) -> Vec<FieldSpec> {
    vec![
        FieldSpec::text("firstName", "First name")
            .rule(Rule::MinLength(2))
            .rule(Rule::MaxLength(50)),
        FieldSpec::text("lastName", "Last name")
            .rule(Rule::MinLength(2))
            .rule(Rule::MaxLength(50)),
        FieldSpec::new("dateOfBirth", "Date of birth", FieldKind::Date).rule(Rule::AgeBetween {
            min: min_age,
            max: max_age,
        }),
        FieldSpec::new("gender", "Gender", FieldKind::Choice).rule(Rule::OneOf(GENDERS)),
        FieldSpec::text("phone", "Phone number").rule(Rule::Phone),
    ]
}
