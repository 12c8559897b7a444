//! Field model shared by every wizard variant.
//!
//! A [`WizardField`] pairs a typed value with its last validation result.
//! The [`FieldTable`] owns one entry per declared field for the lifetime of
//! a single registration attempt, and [`Snapshot`] is the read-only view of
//! the set values used by cross-field rules and branch predicates.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Semantic type of an input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Date,
    Choice,
    ChoiceSet,
    File,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Date => "date",
            FieldKind::Choice => "choice",
            FieldKind::ChoiceSet => "choice_set",
            FieldKind::File => "file",
        }
    }
}

/// A file picked by the user, held in memory until the submission uploads it.
/// Clones share the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub name: String,
    pub content_type: String,
    #[serde(skip)]
    pub bytes: Arc<[u8]>,
    pub size: usize,
}

impl FileRef {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
            size,
        }
    }
}

/// Typed value of a field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Choice(String),
    Choices(BTreeSet<String>),
    File(FileRef),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn choice(value: impl Into<String>) -> Self {
        FieldValue::Choice(value.into())
    }

    pub fn choices<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldValue::Choices(values.into_iter().map(Into::into).collect())
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Date(_) => FieldKind::Date,
            FieldValue::Choice(_) => FieldKind::Choice,
            FieldValue::Choices(_) => FieldKind::ChoiceSet,
            FieldValue::File(_) => FieldKind::File,
        }
    }

    /// Blank values count as "not provided" for presence checks.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Text(s) | FieldValue::Choice(s) => s.trim().is_empty(),
            FieldValue::Choices(set) => set.is_empty(),
            FieldValue::File(file) => file.size == 0,
            FieldValue::Number(n) => n.is_nan(),
            FieldValue::Date(_) => false,
        }
    }

    /// String form of text-like values (text or single choice).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Choice(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Convert a client-supplied JSON value into a typed value for `kind`.
    ///
    /// `null`, `""` and `[]` clear the field. A value of the wrong shape
    /// yields the human-readable reason the field is invalid.
    pub fn from_json(kind: FieldKind, value: &Value) -> Result<Option<FieldValue>, String> {
        match value {
            Value::Null => return Ok(None),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::Array(items) if items.is_empty() => return Ok(None),
            _ => {}
        }

        match kind {
            FieldKind::Text => value
                .as_str()
                .map(|s| Some(FieldValue::Text(s.to_string())))
                .ok_or_else(|| "Expected text".to_string()),
            FieldKind::Choice => value
                .as_str()
                .map(|s| Some(FieldValue::Choice(s.to_string())))
                .ok_or_else(|| "Expected a single option".to_string()),
            FieldKind::Number => {
                let parsed = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                parsed
                    .filter(|n| n.is_finite())
                    .map(|n| Some(FieldValue::Number(n)))
                    .ok_or_else(|| "Expected a number".to_string())
            }
            FieldKind::Date => value
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
                .map(|d| Some(FieldValue::Date(d)))
                .ok_or_else(|| "Expected a date in YYYY-MM-DD format".to_string()),
            FieldKind::ChoiceSet => {
                let items = value
                    .as_array()
                    .ok_or_else(|| "Expected a list of options".to_string())?;
                let mut set = BTreeSet::new();
                for item in items {
                    let s = item
                        .as_str()
                        .ok_or_else(|| "Expected a list of options".to_string())?;
                    set.insert(s.to_string());
                }
                Ok(Some(FieldValue::Choices(set)))
            }
            FieldKind::File => Err("Files must be attached as uploads".to_string()),
        }
    }

    /// JSON form sent to the registration backend. Files have no inline form.
    pub fn to_payload_json(&self) -> Option<Value> {
        match self {
            FieldValue::Text(s) => Some(Value::String(s.trim().to_string())),
            FieldValue::Choice(s) => Some(Value::String(s.clone())),
            FieldValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    Some(Value::from(*n as i64))
                } else {
                    serde_json::Number::from_f64(*n).map(Value::Number)
                }
            }
            FieldValue::Date(d) => Some(Value::String(d.format("%Y-%m-%d").to_string())),
            FieldValue::Choices(set) => Some(Value::Array(
                set.iter().cloned().map(Value::String).collect(),
            )),
            FieldValue::File(_) => None,
        }
    }

    /// Payload form that keeps text exactly as typed, for secrets.
    pub fn to_verbatim_json(&self) -> Option<Value> {
        match self {
            FieldValue::Text(s) => Some(Value::String(s.clone())),
            other => other.to_payload_json(),
        }
    }
}

/// Result of the most recent validation of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Validity {
    Unvalidated,
    Valid,
    Invalid(String),
}

impl Validity {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Validity::Invalid(reason.into())
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Validity::Invalid(reason) => Some(reason.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WizardField {
    pub kind: FieldKind,
    pub value: Option<FieldValue>,
    pub validity: Validity,
    pub touched: bool,
}

impl WizardField {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            value: None,
            validity: Validity::Unvalidated,
            touched: false,
        }
    }
}

/// All fields of one wizard instance, keyed by field name.
#[derive(Debug, Clone, Default)]
pub struct FieldTable {
    entries: BTreeMap<&'static str, WizardField>,
}

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, name: &'static str, field: WizardField) {
        self.entries.insert(name, field);
    }

    pub fn get(&self, name: &str) -> Option<&WizardField> {
        self.entries.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut WizardField> {
        self.entries.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &WizardField)> {
        self.entries.iter().map(|(name, field)| (*name, field))
    }

    pub fn validity(&self, name: &str) -> Option<&Validity> {
        self.entries.get(name).map(|f| &f.validity)
    }

    /// Names of fields the user has interacted with.
    pub fn touched(&self) -> BTreeSet<&'static str> {
        self.entries
            .iter()
            .filter(|(_, f)| f.touched)
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot(
            self.entries
                .iter()
                .filter_map(|(name, f)| f.value.clone().map(|v| (*name, v)))
                .collect(),
        )
    }
}

/// Read-only view of every set field value at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot(BTreeMap<&'static str, FieldValue>);

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.0.iter().map(|(name, value)| (*name, value))
    }
}

impl FromIterator<(&'static str, FieldValue)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (&'static str, FieldValue)>>(iter: T) -> Self {
        Snapshot(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_clears_on_empty() {
        assert_eq!(FieldValue::from_json(FieldKind::Text, &json!(null)), Ok(None));
        assert_eq!(FieldValue::from_json(FieldKind::Text, &json!("  ")), Ok(None));
        assert_eq!(FieldValue::from_json(FieldKind::ChoiceSet, &json!([])), Ok(None));
    }

    #[test]
    fn test_from_json_number_accepts_numeric_strings() {
        assert_eq!(
            FieldValue::from_json(FieldKind::Number, &json!("12")),
            Ok(Some(FieldValue::Number(12.0)))
        );
        assert!(FieldValue::from_json(FieldKind::Number, &json!("twelve")).is_err());
    }

    #[test]
    fn test_from_json_date_format() {
        let parsed = FieldValue::from_json(FieldKind::Date, &json!("1990-04-01")).unwrap();
        assert_eq!(
            parsed,
            Some(FieldValue::Date(NaiveDate::from_ymd_opt(1990, 4, 1).unwrap()))
        );

        let err = FieldValue::from_json(FieldKind::Date, &json!("01/04/1990")).unwrap_err();
        assert!(err.contains("YYYY-MM-DD"));
    }

    #[test]
    fn test_from_json_rejects_inline_files() {
        assert!(FieldValue::from_json(FieldKind::File, &json!({"name": "a.pdf"})).is_err());
    }

    #[test]
    fn test_payload_json_shapes() {
        assert_eq!(FieldValue::Number(7.0).to_payload_json(), Some(json!(7)));
        assert_eq!(FieldValue::Number(7.5).to_payload_json(), Some(json!(7.5)));
        assert_eq!(
            FieldValue::text("  Jane ").to_payload_json(),
            Some(json!("Jane"))
        );
        assert_eq!(
            FieldValue::choices(["b", "a"]).to_payload_json(),
            Some(json!(["a", "b"]))
        );
        let file = FieldValue::File(FileRef::new("c.pdf", "application/pdf", vec![1, 2]));
        assert_eq!(file.to_payload_json(), None);
    }

    #[test]
    fn test_file_clones_share_content() {
        let file = FileRef::new("license.pdf", "application/pdf", vec![7; 1024]);
        let value = FieldValue::File(file.clone());
        let mut table = FieldTable::new();
        let mut field = WizardField::new(FieldKind::File);
        field.value = Some(value);
        table.insert("certificationFile", field);

        let snapshot = table.snapshot();
        match snapshot.get("certificationFile") {
            Some(FieldValue::File(copy)) => {
                assert!(Arc::ptr_eq(&copy.bytes, &file.bytes));
                assert_eq!(copy.size, 1024);
            }
            other => panic!("expected a file, got {:?}", other),
        }
    }

    #[test]
    fn test_verbatim_json_keeps_whitespace() {
        assert_eq!(
            FieldValue::text(" Abcdef1 ").to_verbatim_json(),
            Some(json!(" Abcdef1 "))
        );
        assert_eq!(
            FieldValue::choice("cardiology").to_verbatim_json(),
            Some(json!("cardiology"))
        );
    }

    #[test]
    fn test_snapshot_skips_unset_fields() {
        let mut table = FieldTable::new();
        let mut email = WizardField::new(FieldKind::Text);
        email.value = Some(FieldValue::text("a@b.co"));
        table.insert("email", email);
        table.insert("phone", WizardField::new(FieldKind::Text));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.str("email"), Some("a@b.co"));
        assert!(snapshot.get("phone").is_none());
    }
}
