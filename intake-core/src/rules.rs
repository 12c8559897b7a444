//! Field validation ruleset.
//!
//! Every declared field carries a [`FieldSpec`]: its kind, whether it may be
//! left empty, whether it is sent to the backend, and an ordered list of
//! [`Rule`]s. [`evaluate`] is pure: the same spec, value and context always
//! produce the same [`Validity`].

use chrono::{Datelike, NaiveDate};
use std::collections::BTreeSet;

use crate::field::{FieldKind, FieldValue, Snapshot, Validity};

pub const PASSWORD_MIN_LENGTH: usize = 8;
pub const CODE_MIN_LENGTH: usize = 4;
pub const CODE_MAX_LENGTH: usize = 32;
pub const PHONE_MIN_DIGITS: usize = 7;
pub const PHONE_MAX_DIGITS: usize = 15;

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    MinLength(usize),
    MaxLength(usize),
    Email,
    Phone,
    Password,
    /// Invitation or licence style code: letters and digits only.
    Code,
    NumberRange { min: f64, max: f64 },
    /// Inclusive bounds on the age derived from a date of birth.
    AgeBetween { min: i32, max: i32 },
    OneOf(&'static [&'static str]),
    SubsetOf(&'static [&'static str]),
    MinSelected(usize),
    MustInclude {
        option: &'static str,
        message: &'static str,
    },
    /// Equality with a sibling field; only checked once both were touched.
    Matches {
        field: &'static str,
        message: &'static str,
    },
    FileType(&'static [&'static str]),
    MaxFileSize(usize),
}

impl Rule {
    /// Sibling field this rule reads, if any.
    pub fn depends_on(&self) -> Option<&'static str> {
        match self {
            Rule::Matches { field, .. } => Some(*field),
            _ => None,
        }
    }
}

/// Declaration of one wizard field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub optional: bool,
    /// `false` for fields that only exist client side (e.g. confirmations).
    pub in_payload: bool,
    /// Sent without trimming; the backend must see exactly what was validated.
    pub verbatim: bool,
    pub rules: Vec<Rule>,
}

impl FieldSpec {
    pub fn new(name: &'static str, label: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            label,
            kind,
            optional: false,
            in_payload: true,
            verbatim: false,
            rules: Vec::new(),
        }
    }

    pub fn text(name: &'static str, label: &'static str) -> Self {
        Self::new(name, label, FieldKind::Text)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn client_only(mut self) -> Self {
        self.in_payload = false;
        self
    }

    pub fn verbatim(mut self) -> Self {
        self.verbatim = true;
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn depends_on(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().filter_map(Rule::depends_on)
    }
}

/// Inputs a rule may read besides the field's own value.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub snapshot: &'a Snapshot,
    pub touched: &'a BTreeSet<&'static str>,
    pub today: NaiveDate,
}

/// Validate one field value against its spec.
pub fn evaluate(spec: &FieldSpec, value: Option<&FieldValue>, ctx: &RuleContext<'_>) -> Validity {
    let value = match value {
        Some(v) if !v.is_blank() => v,
        _ if spec.optional => return Validity::Valid,
        _ => return Validity::invalid(format!("{} is required", spec.label)),
    };

    if value.kind() != spec.kind {
        return Validity::invalid(format!(
            "{} must be a {} value",
            spec.label,
            spec.kind.as_str()
        ));
    }

    for rule in &spec.rules {
        if let Err(reason) = check_rule(spec, rule, value, ctx) {
            return Validity::Invalid(reason);
        }
    }

    Validity::Valid
}

fn check_rule(
    spec: &FieldSpec,
    rule: &Rule,
    value: &FieldValue,
    ctx: &RuleContext<'_>,
) -> Result<(), String> {
    let label = spec.label;
    match (rule, value) {
        (Rule::MinLength(min), FieldValue::Text(s)) => {
            if s.trim().chars().count() < *min {
                return Err(format!("{} must be at least {} characters", label, min));
            }
        }
        (Rule::MaxLength(max), FieldValue::Text(s)) => {
            if s.trim().chars().count() > *max {
                return Err(format!("{} must be at most {} characters", label, max));
            }
        }
        (Rule::Email, FieldValue::Text(s)) => {
            if !is_email(s.trim()) {
                return Err("Enter a valid email address".to_string());
            }
        }
        (Rule::Phone, FieldValue::Text(s)) => {
            if !is_phone(s.trim()) {
                return Err(format!("{} must be a valid phone number", label));
            }
        }
        (Rule::Password, FieldValue::Text(s)) => check_password(s)?,
        (Rule::Code, FieldValue::Text(s)) => {
            let s = s.trim();
            let len = s.chars().count();
            if !(CODE_MIN_LENGTH..=CODE_MAX_LENGTH).contains(&len)
                || !s.chars().all(|c| c.is_ascii_alphanumeric())
            {
                return Err(format!(
                    "{} must be {}-{} letters or digits",
                    label, CODE_MIN_LENGTH, CODE_MAX_LENGTH
                ));
            }
        }
        (Rule::NumberRange { min, max }, FieldValue::Number(n)) => {
            if n < min || n > max {
                return Err(format!("{} must be between {} and {}", label, min, max));
            }
        }
        (Rule::AgeBetween { min, max }, FieldValue::Date(dob)) => {
            if *dob > ctx.today {
                return Err("Date of birth cannot be in the future".to_string());
            }
            let age = age_on(*dob, ctx.today);
            if age < *min {
                return Err(format!("You must be at least {} years old", min));
            }
            if age > *max {
                return Err(format!("Age cannot be more than {} years", max));
            }
        }
        (Rule::OneOf(options), FieldValue::Choice(s)) => {
            if !options.contains(&s.as_str()) {
                return Err(format!("Select a valid {}", label.to_lowercase()));
            }
        }
        (Rule::SubsetOf(options), FieldValue::Choices(set)) => {
            if let Some(unknown) = set.iter().find(|s| !options.contains(&s.as_str())) {
                return Err(format!("'{}' is not a valid option for {}", unknown, label));
            }
        }
        (Rule::MinSelected(min), FieldValue::Choices(set)) => {
            if set.len() < *min {
                return Err(format!("Select at least {} {}", min, label.to_lowercase()));
            }
        }
        (Rule::MustInclude { option, message }, FieldValue::Choices(set)) => {
            if !set.contains(*option) {
                return Err(message.to_string());
            }
        }
        (Rule::Matches { field, message }, _) => {
            if ctx.touched.contains(spec.name)
                && ctx.touched.contains(field)
                && ctx.snapshot.get(field) != Some(value)
            {
                return Err(message.to_string());
            }
        }
        (Rule::FileType(accepted), FieldValue::File(file)) => {
            if !accepted.contains(&file.content_type.as_str()) {
                return Err(format!(
                    "{} must be one of: {}",
                    label,
                    accepted.join(", ")
                ));
            }
        }
        (Rule::MaxFileSize(limit), FieldValue::File(file)) => {
            if file.size > *limit {
                return Err(format!(
                    "{} must be smaller than {} MB",
                    label,
                    limit / (1024 * 1024)
                ));
            }
        }
        // Rule does not apply to this value kind.
        _ => {}
    }
    Ok(())
}

/// Whole years between `dob` and `today`, counting a year only once the
/// birthday has been reached.
pub fn age_on(dob: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    age
}

fn is_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

fn is_phone(s: &str) -> bool {
    let body = s.strip_prefix('+').unwrap_or(s);
    let mut digits = 0;
    for c in body.chars() {
        match c {
            '0'..='9' => digits += 1,
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => return false,
        }
    }
    (PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS).contains(&digits)
}

fn check_password(s: &str) -> Result<(), String> {
    if s.chars().count() < PASSWORD_MIN_LENGTH {
        return Err(format!(
            "Password must be at least {} characters",
            PASSWORD_MIN_LENGTH
        ));
    }
    if !s.chars().any(|c| c.is_ascii_lowercase()) {
        return Err("Password must contain a lowercase letter".to_string());
    }
    if !s.chars().any(|c| c.is_ascii_uppercase()) {
        return Err("Password must contain an uppercase letter".to_string());
    }
    if !s.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain a number".to_string());
    }
    Ok(())
}
