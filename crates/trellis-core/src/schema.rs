use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RunError;
use crate::node::NodeId;

/// Declared element type for a node's output, checked against every produced
/// value at run time. Nodes without a declaration skip validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    /// Accepts the inner type or null.
    Nullable(Box<ElementType>),
    /// Accepts any of the listed alternatives.
    OneOf(Vec<ElementType>),
}

impl ElementType {
    /// Returns `true` if `value` satisfies this declaration.
    pub fn admits(&self, value: &Value) -> bool {
        match self {
            ElementType::Null => value.is_null(),
            ElementType::Bool => value.is_boolean(),
            ElementType::Number => value.is_number(),
            ElementType::String => value.is_string(),
            ElementType::Array => value.is_array(),
            ElementType::Object => value.is_object(),
            ElementType::Nullable(inner) => value.is_null() || inner.admits(value),
            ElementType::OneOf(options) => options.iter().any(|option| option.admits(value)),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Null => f.write_str("null"),
            ElementType::Bool => f.write_str("bool"),
            ElementType::Number => f.write_str("number"),
            ElementType::String => f.write_str("string"),
            ElementType::Array => f.write_str("array"),
            ElementType::Object => f.write_str("object"),
            ElementType::Nullable(inner) => write!(f, "{inner}?"),
            ElementType::OneOf(options) => {
                for (idx, option) in options.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{option}")?;
                }
                Ok(())
            }
        }
    }
}

/// Kind label for a concrete JSON value, used in mismatch reports.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check one produced value against an optional declaration.
pub(crate) fn check(
    id: &NodeId,
    declared: Option<&ElementType>,
    value: &Value,
) -> Result<(), RunError> {
    match declared {
        Some(element_type) if !element_type.admits(value) => Err(RunError::TypeMismatch {
            id: id.clone(),
            expected: element_type.clone(),
            actual: value_kind(value),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scalar_kinds_admit_matching_values_only() {
        assert!(ElementType::String.admits(&json!("x")));
        assert!(!ElementType::String.admits(&json!(1)));
        assert!(ElementType::Number.admits(&json!(1.5)));
        assert!(!ElementType::Number.admits(&json!(null)));
        assert!(ElementType::Object.admits(&json!({"a": 1})));
        assert!(!ElementType::Object.admits(&json!([1])));
    }

    #[test]
    fn nullable_accepts_null_and_inner() {
        let declared = ElementType::Nullable(Box::new(ElementType::String));
        assert!(declared.admits(&json!(null)));
        assert!(declared.admits(&json!("x")));
        assert!(!declared.admits(&json!(2)));
    }

    #[test]
    fn one_of_accepts_any_alternative() {
        let declared = ElementType::OneOf(vec![ElementType::Number, ElementType::String]);
        assert!(declared.admits(&json!(3)));
        assert!(declared.admits(&json!("x")));
        assert!(!declared.admits(&json!([])));
        assert_eq!(declared.to_string(), "number | string");
    }

    #[test]
    fn check_reports_declared_and_actual_kinds() {
        let id = NodeId::new("emitter");
        let err = check(&id, Some(&ElementType::String), &json!(5)).unwrap_err();
        match err {
            RunError::TypeMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, ElementType::String);
                assert_eq!(actual, "number");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_declaration_disables_validation() {
        let id = NodeId::new("emitter");
        assert!(check(&id, None, &json!([1, 2, 3])).is_ok());
    }
}
