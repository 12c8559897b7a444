use crate::error::Result;
use crate::field::FieldKind;
use crate::rules::{FieldSpec, Rule};
use crate::steps::{StepDef, WizardDefinition};

use super::{ACCOUNT_FIELDS, PERSONAL_FIELDS, Role, account_fields, personal_fields};

pub const BLOOD_TYPES: &[&str] = &["A+", "A-", "B+", "B-", "AB+", "AB-", "O+", "O-"];

pub const ALLERGIES: &[&str] = &[
    "penicillin",
    "sulfa",
    "aspirin",
    "latex",
    "peanuts",
    "shellfish",
    "other",
];

pub const CONSENTS: &[&str] = &["terms", "privacy", "marketing"];

pub(super) fn definition() -> Result<WizardDefinition> {
    let mut fields = account_fields();
    fields.extend(personal_fields(13, 120));
    fields.extend([
        FieldSpec::new("bloodType", "Blood type", FieldKind::Choice)
            .optional()
            .rule(Rule::OneOf(BLOOD_TYPES)),
        FieldSpec::new("allergies", "Allergies", FieldKind::ChoiceSet)
            .optional()
            .rule(Rule::SubsetOf(ALLERGIES)),
        FieldSpec::text("emergencyContactName", "Emergency contact name")
            .rule(Rule::MinLength(2))
            .rule(Rule::MaxLength(100)),
        FieldSpec::text("emergencyContactPhone", "Emergency contact phone").rule(Rule::Phone),
        FieldSpec::new("consents", "Consents", FieldKind::ChoiceSet)
            .rule(Rule::SubsetOf(CONSENTS))
            .rule(Rule::MustInclude {
                option: "terms",
                message: "You must accept the terms of service",
            })
            .rule(Rule::MustInclude {
                option: "privacy",
                message: "You must accept the privacy policy",
            }),
    ]);

    let steps = vec![
        StepDef::new("Account").fields(ACCOUNT_FIELDS),
        StepDef::new("Personal details").fields(PERSONAL_FIELDS),
        StepDef::new("Health information").fields([
            "bloodType",
            "allergies",
            "emergencyContactName",
            "emergencyContactPhone",
        ]),
        StepDef::new("Consent").fields(["consents"]),
    ];

    WizardDefinition::new(Role::Patient, "email", fields, steps)
}
