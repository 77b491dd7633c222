//! Tool descriptors and argument schema validation.
//!
//! Tool schemas are object-typed with enumerated string options only — no
//! union or polymorphic fields at the top level, which keeps the wire format
//! stable across provider translations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the policy layer treats a tool before execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPolicy {
    #[default]
    Allow,
    Deny,
    RequiresApproval,
}

/// Declares a tool to the registry and to model providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// Object-typed JSON schema: `{"type":"object","properties":{...},"required":[...]}`.
    pub schema: Value,
    /// Whether invoking this tool mutates state outside the session.
    #[serde(default)]
    pub side_effects: bool,
    #[serde(default)]
    pub requires_approval: bool,
}

impl ToolDescriptor {
    /// Validate an invocation's arguments against this descriptor's schema.
    ///
    /// Checks: top-level object shape, required properties, primitive types,
    /// and enum membership for enumerated strings. Unknown properties are
    /// rejected — tools must see exactly what their schema declares.
    pub fn validate_args(&self, args: &Value) -> Result<(), String> {
        let obj = args
            .as_object()
            .ok_or_else(|| "arguments must be a JSON object".to_string())?;

        let props = self
            .schema
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if let Some(required) = self.schema.get("required").and_then(Value::as_array) {
            for req in required {
                let name = req.as_str().unwrap_or_default();
                if !obj.contains_key(name) {
                    return Err(format!("missing required property `{name}`"));
                }
            }
        }

        for (key, value) in obj {
            let Some(prop) = props.get(key) else {
                return Err(format!("unknown property `{key}`"));
            };
            let declared = prop.get("type").and_then(Value::as_str).unwrap_or("string");
            let ok = match declared {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                other => return Err(format!("unsupported schema type `{other}` for `{key}`")),
            };
            if !ok {
                return Err(format!("property `{key}` must be a {declared}"));
            }
            if let Some(options) = prop.get("enum").and_then(Value::as_array) {
                if !options.contains(value) {
                    return Err(format!("property `{key}` not in allowed options"));
                }
            }
        }

        Ok(())
    }
}
