// =============================================================================
// MOONWIRE v1.0 - Param Schemas
// =============================================================================
//
// Request validation at the RPC boundary. Schemas are plain data (field
// name, kind, required flag) checked by one generic validator, so every
// method rejects malformed params the same way: with the full list of
// violations, before any engine code runs.
//
// =============================================================================

use serde_json::Value;

use crate::types::{Address, Bytes32, EngineError, Identifier};

// =============================================================================
// Schema Model
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Bool,
    /// Unsigned integer (JSON number)
    Uint,
    /// Token amount: decimal string (preferred) or JSON number
    Amount,
    /// 0x-prefixed 20-byte hex
    HexAddress,
    /// 0x-prefixed 32-byte hex
    HexBytes32,
    /// 33-byte peer identifier hex
    Identifier,
    Object,
}

#[derive(Clone, Copy, Debug)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl Field {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Field {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Field {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Schema {
    pub name: &'static str,
    pub fields: &'static [Field],
}

impl Schema {
    /// Check `params` against this schema; collects every violation rather
    /// than stopping at the first.
    pub fn check(&self, params: &Value) -> Result<(), Vec<String>> {
        let object = match params {
            Value::Object(object) => object,
            Value::Null if self.fields.iter().all(|f| !f.required) => {
                return Ok(());
            }
            other => {
                return Err(vec![format!(
                    "params must be an object, got {}",
                    kind_name(other)
                )])
            }
        };

        let mut violations = Vec::new();
        for field in self.fields {
            match object.get(field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        violations.push(format!("missing required field {:?}", field.name));
                    }
                }
                Some(value) => {
                    if let Err(reason) = check_kind(field.kind, value) {
                        violations.push(format!("field {:?}: {}", field.name, reason));
                    }
                }
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Validate into the engine error shape used at the RPC boundary.
    pub fn validate(&self, params: &Value) -> Result<(), EngineError> {
        self.check(params).map_err(|violations| {
            EngineError::validation(format!(
                "invalid params for {}: {}",
                self.name,
                violations.join("; ")
            ))
        })
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_kind(kind: FieldKind, value: &Value) -> Result<(), String> {
    match kind {
        FieldKind::Str => value
            .as_str()
            .map(|_| ())
            .ok_or_else(|| format!("expected string, got {}", kind_name(value))),
        FieldKind::Bool => value
            .as_bool()
            .map(|_| ())
            .ok_or_else(|| format!("expected bool, got {}", kind_name(value))),
        FieldKind::Uint => value
            .as_u64()
            .map(|_| ())
            .ok_or_else(|| format!("expected unsigned integer, got {}", kind_name(value))),
        FieldKind::Amount => parse_amount(value).map(|_| ()),
        FieldKind::HexAddress => match value.as_str() {
            Some(raw) => Address::from_hex(raw).map(|_| ()),
            None => Err(format!("expected hex string, got {}", kind_name(value))),
        },
        FieldKind::HexBytes32 => match value.as_str() {
            Some(raw) => Bytes32::from_hex(raw).map(|_| ()),
            None => Err(format!("expected hex string, got {}", kind_name(value))),
        },
        FieldKind::Identifier => match value.as_str() {
            Some(raw) => Identifier::from_hex(raw).map(|_| ()),
            None => Err(format!("expected identifier hex, got {}", kind_name(value))),
        },
        FieldKind::Object => match value {
            Value::Object(_) => Ok(()),
            other => Err(format!("expected object, got {}", kind_name(other))),
        },
    }
}

fn parse_amount(value: &Value) -> Result<u128, String> {
    match value {
        Value::String(raw) => raw
            .parse::<u128>()
            .map_err(|e| format!("invalid amount {:?}: {}", raw, e)),
        Value::Number(number) => number
            .as_u64()
            .map(|n| n as u128)
            .ok_or_else(|| format!("invalid amount {}", number)),
        other => Err(format!("expected amount, got {}", kind_name(other))),
    }
}

// =============================================================================
// Typed Extractors
// =============================================================================
//
// Dispatch reads validated params through these; a missing optional comes
// back as None, a missing required field as a validation error (belt and
// suspenders around the schema check).

pub fn get_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, EngineError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::validation(format!("missing field {:?}", name)))
}

pub fn get_bool(params: &Value, name: &str) -> Option<bool> {
    params.get(name).and_then(|v| v.as_bool())
}

pub fn get_u64(params: &Value, name: &str) -> Option<u64> {
    params.get(name).and_then(|v| v.as_u64())
}

pub fn get_amount(params: &Value, name: &str) -> Result<u128, EngineError> {
    let value = params
        .get(name)
        .ok_or_else(|| EngineError::validation(format!("missing field {:?}", name)))?;
    parse_amount(value).map_err(EngineError::validation)
}

pub fn get_opt_amount(params: &Value, name: &str) -> Result<Option<u128>, EngineError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_amount(value)
            .map(Some)
            .map_err(EngineError::validation),
    }
}

pub fn get_address(params: &Value, name: &str) -> Result<Address, EngineError> {
    Address::from_hex(get_str(params, name)?)
        .map_err(|e| EngineError::validation(format!("field {:?}: {}", name, e)))
}

pub fn get_opt_address(params: &Value, name: &str) -> Result<Option<Address>, EngineError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => get_address(params, name).map(Some),
    }
}

pub fn get_bytes32(params: &Value, name: &str) -> Result<Bytes32, EngineError> {
    Bytes32::from_hex(get_str(params, name)?)
        .map_err(|e| EngineError::validation(format!("field {:?}: {}", name, e)))
}

pub fn get_identifier(params: &Value, name: &str) -> Result<Identifier, EngineError> {
    Identifier::from_hex(get_str(params, name)?)
        .map_err(|e| EngineError::validation(format!("field {:?}: {}", name, e)))
}

pub fn get_opt_identifier(params: &Value, name: &str) -> Result<Option<Identifier>, EngineError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => get_identifier(params, name).map(Some),
    }
}

pub fn get_object(params: &Value, name: &str) -> Value {
    params.get(name).cloned().unwrap_or(Value::Null)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEST_SCHEMA: Schema = Schema {
        name: "test_method",
        fields: &[
            Field::required("channel_address", FieldKind::HexAddress),
            Field::required("amount", FieldKind::Amount),
            Field::optional("timeout", FieldKind::Uint),
            Field::optional("meta", FieldKind::Object),
        ],
    };

    #[test]
    fn test_valid_params_pass() {
        let params = json!({
            "channel_address": Address::from_bytes([1; 20]),
            "amount": "100",
            "timeout": 600,
        });
        TEST_SCHEMA.check(&params).unwrap();
    }

    #[test]
    fn test_amount_accepts_number_or_string() {
        for amount in [json!("250"), json!(250)] {
            let params = json!({
                "channel_address": Address::from_bytes([1; 20]),
                "amount": amount,
            });
            TEST_SCHEMA.check(&params).unwrap();
        }
    }

    #[test]
    fn test_collects_all_violations() {
        let params = json!({
            "amount": "not-a-number",
            "timeout": "also-wrong",
        });
        let violations = TEST_SCHEMA.check(&params).unwrap_err();
        assert_eq!(violations.len(), 3);
        assert!(violations
            .iter()
            .any(|v| v.contains("channel_address")));
    }

    #[test]
    fn test_rejects_non_object_params() {
        assert!(TEST_SCHEMA.check(&json!([1, 2, 3])).is_err());
        // null only passes when nothing is required
        assert!(TEST_SCHEMA.check(&Value::Null).is_err());

        const OPTIONAL_ONLY: Schema = Schema {
            name: "optional_only",
            fields: &[Field::optional("timeout", FieldKind::Uint)],
        };
        OPTIONAL_ONLY.check(&Value::Null).unwrap();
    }

    #[test]
    fn test_bad_hex_rejected() {
        let params = json!({
            "channel_address": "0x1234",
            "amount": "1",
        });
        let violations = TEST_SCHEMA.check(&params).unwrap_err();
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_validate_formats_engine_error() {
        let err = TEST_SCHEMA.validate(&json!({})).unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::Validation);
        assert!(err.message.contains("test_method"));
    }

    #[test]
    fn test_extractors() {
        let params = json!({
            "amount": "42",
            "flag": true,
            "id": Bytes32::from_bytes([2; 32]),
        });
        assert_eq!(get_amount(&params, "amount").unwrap(), 42);
        assert_eq!(get_opt_amount(&params, "missing").unwrap(), None);
        assert_eq!(get_bool(&params, "flag"), Some(true));
        assert_eq!(
            get_bytes32(&params, "id").unwrap(),
            Bytes32::from_bytes([2; 32])
        );
        assert!(get_address(&params, "missing").is_err());
    }
}
