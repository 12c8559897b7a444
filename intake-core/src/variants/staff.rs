use crate::error::Result;
use crate::field::FieldKind;
use crate::gate::GateKind;
use crate::rules::{FieldSpec, Rule};
use crate::steps::{Predicate, StepDef, WizardDefinition};

use super::{ACCOUNT_FIELDS, PERSONAL_FIELDS, Role, account_fields, personal_fields};

pub const STAFF_ROLES: &[&str] = &[
    "nurse",
    "receptionist",
    "lab_technician",
    "pharmacist",
    "administrator",
    "other",
];

pub(super) fn definition() -> Result<WizardDefinition> {
    let mut fields = account_fields();
    fields.extend(personal_fields(18, 100));
    fields.extend([
        FieldSpec::new("staffRole", "Staff role", FieldKind::Choice).rule(Rule::OneOf(STAFF_ROLES)),
        FieldSpec::text("customRole", "Role title")
            .rule(Rule::MinLength(2))
            .rule(Rule::MaxLength(50)),
        FieldSpec::text("department", "Department")
            .optional()
            .rule(Rule::MaxLength(100)),
        FieldSpec::text("invitationCode", "Invitation code").rule(Rule::Code),
    ]);

    let steps = vec![
        StepDef::new("Account").fields(ACCOUNT_FIELDS),
        StepDef::new("Personal details").fields(PERSONAL_FIELDS),
        StepDef::new("Role")
            .fields(["staffRole", "department", "invitationCode"])
            .when(Predicate::Equals("staffRole", "other"), ["customRole"])
            .gated(GateKind::StaffInvitation, "invitationCode", None),
    ];

    WizardDefinition::new(Role::Staff, "email", fields, steps)
}
