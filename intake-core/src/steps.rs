//! Step definition table.
//!
//! A [`WizardDefinition`] is immutable configuration: the ordered steps, the
//! fields each step governs, the branch predicates that switch conditional
//! fields on, and which step is guarded by an external verification gate.
//! Required-field sets are always computed fresh from a [`Snapshot`]; nothing
//! here caches them.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{IntakeError, Result};
use crate::field::Snapshot;
use crate::gate::GateKind;
use crate::rules::FieldSpec;
use crate::variants::Role;

/// Branch selector evaluated against the current snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals(&'static str, &'static str),
}

impl Predicate {
    pub fn holds(&self, snapshot: &Snapshot) -> bool {
        match self {
            Predicate::Equals(field, expected) => snapshot.str(field) == Some(*expected),
        }
    }

    /// Field whose value the predicate reads.
    pub fn subject(&self) -> &'static str {
        match self {
            Predicate::Equals(field, _) => *field,
        }
    }
}

/// Fields that become required while `when` holds.
#[derive(Debug, Clone)]
pub struct Conditional {
    pub when: Predicate,
    pub fields: Vec<&'static str>,
}

/// Binds an external verification gate to the field holding its input.
#[derive(Debug, Clone)]
pub struct GateBinding {
    pub gate: GateKind,
    pub field: &'static str,
    /// The gate only guards the step while this holds.
    pub when: Option<Predicate>,
}

impl GateBinding {
    pub fn applies(&self, snapshot: &Snapshot) -> bool {
        self.when.as_ref().is_none_or(|p| p.holds(snapshot))
    }
}

#[derive(Debug, Clone)]
pub struct StepDef {
    pub label: &'static str,
    pub fields: Vec<&'static str>,
    pub conditionals: Vec<Conditional>,
    pub gate: Option<GateBinding>,
}

impl StepDef {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            fields: Vec::new(),
            conditionals: Vec::new(),
            gate: None,
        }
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = &'static str>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn when(
        mut self,
        predicate: Predicate,
        fields: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        self.conditionals.push(Conditional {
            when: predicate,
            fields: fields.into_iter().collect(),
        });
        self
    }

    pub fn gated(mut self, gate: GateKind, field: &'static str, when: Option<Predicate>) -> Self {
        self.gate = Some(GateBinding { gate, field, when });
        self
    }

    /// Every field this step can ever govern, active or not.
    pub fn declared_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields
            .iter()
            .copied()
            .chain(self.conditionals.iter().flat_map(|c| c.fields.iter().copied()))
    }
}

/// Immutable description of one wizard variant.
#[derive(Debug, Clone)]
pub struct WizardDefinition {
    role: Role,
    steps: Vec<StepDef>,
    fields: BTreeMap<&'static str, FieldSpec>,
    owners: BTreeMap<&'static str, usize>,
    identifier: &'static str,
}

impl WizardDefinition {
    /// Build and check a definition. `identifier` names the field handed to
    /// the routing layer after a successful registration.
    pub fn new(
        role: Role,
        identifier: &'static str,
        fields: Vec<FieldSpec>,
        steps: Vec<StepDef>,
    ) -> Result<Self> {
        let mut table = BTreeMap::new();
        for spec in fields {
            if table.insert(spec.name, spec).is_some() {
                return Err(IntakeError::definition("field declared twice"));
            }
        }

        let mut owners = BTreeMap::new();
        for (idx, step) in steps.iter().enumerate() {
            for field in step.declared_fields() {
                if owners.insert(field, idx + 1).is_some() {
                    return Err(IntakeError::definition(format!(
                        "field '{}' is governed by more than one step",
                        field
                    )));
                }
            }
        }

        let definition = Self {
            role,
            steps,
            fields: table,
            owners,
            identifier,
        };
        definition.check()?;
        Ok(definition)
    }

    fn check(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(IntakeError::definition("a wizard needs at least one step"));
        }

        for name in self.owners.keys() {
            if !self.fields.contains_key(name) {
                return Err(IntakeError::definition(format!(
                    "step references undeclared field '{}'",
                    name
                )));
            }
        }

        for (name, spec) in &self.fields {
            if !self.owners.contains_key(name) {
                return Err(IntakeError::definition(format!(
                    "field '{}' is not governed by any step",
                    name
                )));
            }
            for dep in spec.depends_on() {
                if !self.fields.contains_key(dep) {
                    return Err(IntakeError::definition(format!(
                        "field '{}' depends on undeclared field '{}'",
                        name, dep
                    )));
                }
            }
        }

        for (idx, step) in self.steps.iter().enumerate() {
            for cond in &step.conditionals {
                if !self.fields.contains_key(cond.when.subject()) {
                    return Err(IntakeError::definition(format!(
                        "step {} branches on undeclared field '{}'",
                        idx + 1,
                        cond.when.subject()
                    )));
                }
            }
            if let Some(binding) = &step.gate
                && self.owners.get(binding.field) != Some(&(idx + 1))
            {
                return Err(IntakeError::definition(format!(
                    "gate field '{}' does not belong to step {}",
                    binding.field,
                    idx + 1
                )));
            }
        }

        if !self.fields.contains_key(self.identifier) {
            return Err(IntakeError::definition(format!(
                "identifier field '{}' is not declared",
                self.identifier
            )));
        }

        Ok(())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn identifier(&self) -> &'static str {
        self.identifier
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Step by 1-based index.
    pub fn step(&self, index: usize) -> Option<&StepDef> {
        index.checked_sub(1).and_then(|i| self.steps.get(i))
    }

    pub fn steps(&self) -> impl Iterator<Item = (usize, &StepDef)> {
        self.steps.iter().enumerate().map(|(i, s)| (i + 1, s))
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn field_specs(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.values()
    }

    /// Step that governs `field`.
    pub fn owner_step(&self, field: &str) -> Option<usize> {
        self.owners.get(field).copied()
    }

    /// Fields required by `step` given the snapshot: the unconditional ones
    /// plus every conditional group whose predicate currently holds.
    pub fn fields_for(&self, step: usize, snapshot: &Snapshot) -> BTreeSet<&'static str> {
        let Some(def) = self.step(step) else {
            return BTreeSet::new();
        };
        let mut required: BTreeSet<&'static str> = def.fields.iter().copied().collect();
        for cond in &def.conditionals {
            if cond.when.holds(snapshot) {
                required.extend(cond.fields.iter().copied());
            }
        }
        required
    }

    /// Whether `field` is part of the required set of its step right now.
    pub fn is_active(&self, field: &str, snapshot: &Snapshot) -> bool {
        self.owner_step(field)
            .is_some_and(|step| self.fields_for(step, snapshot).contains(field))
    }

    /// Union of the required sets of every step.
    pub fn active_fields(&self, snapshot: &Snapshot) -> BTreeSet<&'static str> {
        (1..=self.step_count())
            .flat_map(|step| self.fields_for(step, snapshot))
            .collect()
    }

    /// True iff every field currently required by `step` passes `is_valid`.
    pub fn is_step_complete(
        &self,
        step: usize,
        snapshot: &Snapshot,
        is_valid: impl Fn(&'static str) -> bool,
    ) -> bool {
        self.fields_for(step, snapshot).into_iter().all(is_valid)
    }

    /// The gate guarding `step`, if its binding applies to the snapshot.
    pub fn gate_for(&self, step: usize, snapshot: &Snapshot) -> Option<&GateBinding> {
        self.step(step)
            .and_then(|s| s.gate.as_ref())
            .filter(|binding| binding.applies(snapshot))
    }

    /// Locate a gate binding and the step it guards.
    pub fn gate_binding(&self, gate: GateKind) -> Option<(usize, &GateBinding)> {
        self.steps().find_map(|(idx, step)| {
            step.gate
                .as_ref()
                .filter(|b| b.gate == gate)
                .map(|b| (idx, b))
        })
    }

    pub fn gates(&self) -> impl Iterator<Item = GateKind> + '_ {
        self.steps.iter().filter_map(|s| s.gate.as_ref().map(|b| b.gate))
    }

    /// Fields that must be re-validated after `changed` is edited: rules that
    /// read it and conditional groups that branch on it.
    pub fn dependents(&self, changed: &str) -> BTreeSet<&'static str> {
        let mut out = BTreeSet::new();
        for spec in self.fields.values() {
            if spec.depends_on().any(|d| d == changed) {
                out.insert(spec.name);
            }
        }
        for step in &self.steps {
            for cond in &step.conditionals {
                if cond.when.subject() == changed {
                    out.extend(cond.fields.iter().copied());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldKind, FieldTable, FieldValue, Validity, WizardField};
    use crate::rules::Rule;

    const KINDS: &[&str] = &["a", "b"];

    fn sample() -> WizardDefinition {
        WizardDefinition::new(
            Role::Staff,
            "email",
            vec![
                FieldSpec::text("email", "Email").rule(Rule::Email),
                FieldSpec::new("kind", "Kind", FieldKind::Choice).rule(Rule::OneOf(KINDS)),
                FieldSpec::text("detail", "Detail"),
                FieldSpec::text("code", "Code").rule(Rule::Code),
            ],
            vec![
                StepDef::new("Account").fields(["email"]),
                StepDef::new("Kind")
                    .fields(["kind"])
                    .when(Predicate::Equals("kind", "b"), ["detail"])
                    .gated(GateKind::StaffInvitation, "code", None)
                    .when(Predicate::Equals("kind", "a"), ["code"]),
            ],
        )
        .unwrap()
    }

    fn snapshot_with_kind(kind: &str) -> Snapshot {
        [("kind", FieldValue::choice(kind))].into_iter().collect()
    }

    #[test]
    fn test_fields_for_expands_conditionals() {
        let def = sample();
        let b = def.fields_for(2, &snapshot_with_kind("b"));
        assert!(b.contains("kind") && b.contains("detail") && !b.contains("code"));

        let a = def.fields_for(2, &snapshot_with_kind("a"));
        assert!(a.contains("code") && !a.contains("detail"));

        let none = def.fields_for(2, &Snapshot::default());
        assert_eq!(none.into_iter().collect::<Vec<_>>(), vec!["kind"]);
    }

    #[test]
    fn test_fields_for_out_of_range() {
        let def = sample();
        assert!(def.fields_for(0, &Snapshot::default()).is_empty());
        assert!(def.fields_for(3, &Snapshot::default()).is_empty());
    }

    #[test]
    fn test_inactive_invalid_field_does_not_block() {
        let def = sample();
        let mut table = FieldTable::new();
        let mut kind = WizardField::new(FieldKind::Choice);
        kind.value = Some(FieldValue::choice("a"));
        kind.validity = Validity::Valid;
        table.insert("kind", kind);
        let mut code = WizardField::new(FieldKind::Text);
        code.value = Some(FieldValue::text("ABCD"));
        code.validity = Validity::Valid;
        table.insert("code", code);
        let mut detail = WizardField::new(FieldKind::Text);
        detail.validity = Validity::invalid("Detail is required");
        table.insert("detail", detail);

        let snapshot = table.snapshot();
        let is_valid = |name: &str| table.validity(name).is_some_and(|v| v.is_valid());
        assert!(def.is_step_complete(2, &snapshot, is_valid));

        table.insert("kind", {
            let mut kind = WizardField::new(FieldKind::Choice);
            kind.value = Some(FieldValue::choice("b"));
            kind.validity = Validity::Valid;
            kind
        });
        let snapshot = table.snapshot();
        let is_valid = |name: &str| table.validity(name).is_some_and(|v| v.is_valid());
        assert!(!def.is_step_complete(2, &snapshot, is_valid));
    }

    #[test]
    fn test_duplicate_ownership_rejected() {
        let result = WizardDefinition::new(
            Role::Staff,
            "email",
            vec![FieldSpec::text("email", "Email")],
            vec![
                StepDef::new("One").fields(["email"]),
                StepDef::new("Two").fields(["email"]),
            ],
        );
        assert!(matches!(result, Err(IntakeError::Definition { .. })));
    }

    #[test]
    fn test_undeclared_field_rejected() {
        let result = WizardDefinition::new(
            Role::Staff,
            "email",
            vec![FieldSpec::text("email", "Email")],
            vec![StepDef::new("One").fields(["email", "ghost"])],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_gate_field_must_belong_to_step() {
        let result = WizardDefinition::new(
            Role::Staff,
            "email",
            vec![
                FieldSpec::text("email", "Email"),
                FieldSpec::text("code", "Code"),
            ],
            vec![
                StepDef::new("One").fields(["email"]).gated(
                    GateKind::StaffInvitation,
                    "code",
                    None,
                ),
                StepDef::new("Two").fields(["code"]),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_dependents_include_branch_fields() {
        let def = sample();
        let deps = def.dependents("kind");
        assert!(deps.contains("detail"));
        assert!(deps.contains("code"));
        assert!(def.dependents("email").is_empty());
    }

    #[test]
    fn test_gate_binding_lookup() {
        let def = sample();
        let (step, binding) = def.gate_binding(GateKind::StaffInvitation).unwrap();
        assert_eq!(step, 2);
        assert_eq!(binding.field, "code");
        assert!(def.gate_binding(GateKind::ClinicInvitation).is_none());
    }
}
