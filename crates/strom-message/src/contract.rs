// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One parameter of a callable function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterContract {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for this parameter's value.
    pub schema: Value,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl ParameterContract {
    pub fn new(name: impl Into<String>, schema: Value, is_required: bool) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema,
            is_required,
            default_value: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// The declarative surface of a callable function: what the model sees.
///
/// `class_name` is set for functions sourced from a structured tool server
/// (an MCP-style provider); natural functions leave it empty.  The two are
/// distinguished by conflict-resolution policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionContract {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_description: Option<String>,
}

impl FunctionContract {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            namespace: None,
            class_name: None,
            parameters: Vec::new(),
            return_type: None,
            return_description: None,
        }
    }

    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterContract) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Combined JSON Schema for the whole argument object.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required: Vec<Value> = Vec::new();
        for p in &self.parameters {
            let mut schema = p.schema.clone();
            if !p.description.is_empty() {
                if let Value::Object(obj) = &mut schema {
                    obj.entry("description".to_string())
                        .or_insert_with(|| Value::from(p.description.clone()));
                }
            }
            properties.insert(p.name.clone(), schema);
            if p.is_required {
                required.push(Value::from(p.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Render this contract as a Markdown block for prompt injection.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("## {}\n\n", self.name);
        if !self.description.is_empty() {
            out.push_str(&self.description);
            out.push_str("\n\n");
        }
        let schema = self.parameters_schema();
        out.push_str("Parameters (JSON Schema):\n\n```json\n");
        out.push_str(&serde_json::to_string_pretty(&schema).unwrap_or_default());
        out.push_str("\n```\n");
        if let Some(rd) = &self.return_description {
            out.push_str(&format!("\nReturns: {rd}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_contract() -> FunctionContract {
        FunctionContract::new("get_weather", "Get current weather for a location")
            .with_parameter(
                ParameterContract::new("location", json!({"type": "string"}), true)
                    .with_description("City and state"),
            )
            .with_parameter(ParameterContract::new(
                "unit",
                json!({"type": "string", "enum": ["c", "f"]}),
                false,
            ))
    }

    #[test]
    fn parameters_schema_collects_properties_and_required() {
        let schema = weather_contract().parameters_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["location"]["type"], "string");
        assert_eq!(
            schema["properties"]["location"]["description"],
            "City and state"
        );
        assert_eq!(schema["required"], json!(["location"]));
    }

    #[test]
    fn parameter_description_does_not_override_schema_description() {
        let c = FunctionContract::new("f", "").with_parameter(
            ParameterContract::new(
                "x",
                json!({"type": "string", "description": "from schema"}),
                true,
            )
            .with_description("from contract"),
        );
        assert_eq!(
            c.parameters_schema()["properties"]["x"]["description"],
            "from schema"
        );
    }

    #[test]
    fn markdown_contains_name_description_and_schema() {
        let md = weather_contract().to_markdown();
        assert!(md.starts_with("## get_weather"));
        assert!(md.contains("Get current weather"));
        assert!(md.contains("```json"));
        assert!(md.contains("\"location\""));
    }

    #[test]
    fn round_trips_through_json() {
        let c = weather_contract().with_class_name("weather-server");
        let s = serde_json::to_string(&c).unwrap();
        let back: FunctionContract = serde_json::from_str(&s).unwrap();
        assert_eq!(back, c);
    }
}
