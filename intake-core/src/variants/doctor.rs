use crate::error::Result;
use crate::field::FieldKind;
use crate::gate::GateKind;
use crate::rules::{FieldSpec, Rule};
use crate::steps::{Predicate, StepDef, WizardDefinition};

use super::{ACCOUNT_FIELDS, PERSONAL_FIELDS, Role, account_fields, personal_fields};

pub const SPECIALTIES: &[&str] = &[
    "general_practice",
    "cardiology",
    "dermatology",
    "neurology",
    "pediatrics",
    "psychiatry",
    "orthopedics",
    "oncology",
    "radiology",
    "other",
];

pub const QUALIFICATIONS: &[&str] = &["mbbs", "md", "do", "phd", "board_certified", "fellowship"];

pub const PRACTICE_TYPES: &[&str] = &["private_clinic", "existing_clinic", "hospital", "independent"];

pub const CERTIFICATE_TYPES: &[&str] = &["application/pdf", "image/png", "image/jpeg"];

pub const CERTIFICATE_MAX_BYTES: usize = 5 * 1024 * 1024;

pub(super) fn definition() -> Result<WizardDefinition> {
    let mut fields = account_fields();
    fields.extend(personal_fields(21, 100));
    fields.extend([
        FieldSpec::new("specialty", "Specialty", FieldKind::Choice).rule(Rule::OneOf(SPECIALTIES)),
        FieldSpec::text("licenseNumber", "License number")
            .rule(Rule::MinLength(5))
            .rule(Rule::MaxLength(30)),
        FieldSpec::new("yearsOfExperience", "Years of experience", FieldKind::Number)
            .rule(Rule::NumberRange { min: 0.0, max: 70.0 }),
        FieldSpec::new("qualifications", "Qualifications", FieldKind::ChoiceSet)
            .rule(Rule::SubsetOf(QUALIFICATIONS))
            .rule(Rule::MinSelected(1)),
        FieldSpec::new("certificationFile", "Certification document", FieldKind::File)
            .rule(Rule::FileType(CERTIFICATE_TYPES))
            .rule(Rule::MaxFileSize(CERTIFICATE_MAX_BYTES)),
        FieldSpec::new("practiceType", "Practice type", FieldKind::Choice)
            .rule(Rule::OneOf(PRACTICE_TYPES)),
        FieldSpec::text("clinicName", "Clinic name")
            .rule(Rule::MinLength(2))
            .rule(Rule::MaxLength(100)),
        FieldSpec::text("clinicAddress", "Clinic address")
            .rule(Rule::MinLength(5))
            .rule(Rule::MaxLength(200)),
        FieldSpec::text("clinicPhone", "Clinic phone").rule(Rule::Phone),
        FieldSpec::text("clinicInvitationCode", "Clinic invitation code").rule(Rule::Code),
        FieldSpec::text("hospitalName", "Hospital name")
            .rule(Rule::MinLength(2))
            .rule(Rule::MaxLength(100)),
        FieldSpec::new("consultationFee", "Consultation fee", FieldKind::Number)
            .optional()
            .rule(Rule::NumberRange {
                min: 0.0,
                max: 10_000.0,
            }),
    ]);

    let steps = vec![
        StepDef::new("Account").fields(ACCOUNT_FIELDS),
        StepDef::new("Personal details").fields(PERSONAL_FIELDS),
        StepDef::new("Professional details").fields([
            "specialty",
            "licenseNumber",
            "yearsOfExperience",
            "qualifications",
            "certificationFile",
        ]),
        StepDef::new("Practice")
            .fields(["practiceType", "consultationFee"])
            .when(
                Predicate::Equals("practiceType", "private_clinic"),
                ["clinicName", "clinicAddress", "clinicPhone"],
            )
            .when(
                Predicate::Equals("practiceType", "existing_clinic"),
                ["clinicInvitationCode"],
            )
            .when(Predicate::Equals("practiceType", "hospital"), ["hospitalName"])
            .gated(
                GateKind::ClinicInvitation,
                "clinicInvitationCode",
                Some(Predicate::Equals("practiceType", "existing_clinic")),
            ),
    ];

    WizardDefinition::new(Role::Doctor, "email", fields, steps)
}
