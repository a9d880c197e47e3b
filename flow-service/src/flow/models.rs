// Flow Data Models
// Pipeline definitions (Flows) and their processing steps (Models), with schema migration

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Logical port seeded with the arriving study when a flow instance is created
pub const SOURCE_PORT: &str = "src";

/// Logical port whose binding marks a flow instance as finished
pub const DESTINATION_PORT: &str = "dst";

/// Schema version written by this crate
pub const CURRENT_SCHEMA: u32 = 2;

/// Highest priority a flow may declare
pub const MAX_FLOW_PRIORITY: u8 = 4;

/// One containerized processing step (a node of the flow DAG)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Human readable model name
    pub name: String,

    /// Input mounts: mount name -> logical port
    #[serde(default)]
    pub input_ports: BTreeMap<String, String>,

    /// Output mounts: mount name -> logical port
    #[serde(default)]
    pub output_ports: BTreeMap<String, String>,

    /// Static mounts: mount name -> blob uid, never part of the graph
    #[serde(default)]
    pub static_ports: BTreeMap<String, String>,

    /// Container image, command, resources. Passed through to the executor untouched.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub execution: Value,

    /// Route to the GPU worker pool instead of the CPU pool
    #[serde(default)]
    pub gpu: bool,
}

impl Model {
    /// Logical ports this model consumes
    pub fn input_port_names(&self) -> BTreeSet<&str> {
        self.input_ports.values().map(String::as_str).collect()
    }

    /// Logical ports this model produces
    pub fn output_port_names(&self) -> BTreeSet<&str> {
        self.output_ports.values().map(String::as_str).collect()
    }

    pub fn consumes(&self, port: &str) -> bool {
        self.input_ports.values().any(|p| p == port)
    }

    pub fn produces(&self, port: &str) -> bool {
        self.output_ports.values().any(|p| p == port)
    }

    /// The model's only input is the arriving study. Such models are
    /// dispatched at the flow's declared priority.
    pub fn reads_only_source(&self) -> bool {
        let inputs = self.input_port_names();
        inputs.len() == 1 && inputs.contains(SOURCE_PORT)
    }
}

/// A pipeline definition: an ordered list of models wired by port names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Schema version of this document
    #[serde(default = "current_schema")]
    pub schema: u32,

    /// Flow name
    pub name: String,

    /// Free-form definition version
    #[serde(default)]
    pub version: String,

    /// Broker priority for the flow's entry jobs (0-4)
    #[serde(default)]
    pub priority: u8,

    /// Processing steps, addressed by index
    #[serde(default)]
    pub models: Vec<Model>,

    /// Attribute matching rules, evaluated by the external matcher
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub triggers: Value,

    /// Where results are forwarded once the flow finishes
    #[serde(default)]
    pub destinations: Vec<Value>,
}

fn current_schema() -> u32 {
    CURRENT_SCHEMA
}

impl Flow {
    /// Get a model by index
    pub fn model(&self, index: usize) -> Option<&Model> {
        self.models.get(index)
    }

    /// All logical input port names across the flow
    pub fn input_port_names(&self) -> BTreeSet<&str> {
        self.models
            .iter()
            .flat_map(|m| m.input_ports.values().map(String::as_str))
            .collect()
    }

    /// All logical output port names across the flow
    pub fn output_port_names(&self) -> BTreeSet<&str> {
        self.models
            .iter()
            .flat_map(|m| m.output_ports.values().map(String::as_str))
            .collect()
    }
}

// =============================================================================
// Schema 1 (legacy) documents
// =============================================================================

/// Legacy model: list-shaped ports, image and command inline
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyModel {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub statics: BTreeMap<String, String>,
    pub image: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub device: LegacyDevice,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyDevice {
    #[default]
    Cpu,
    Gpu,
}

/// Legacy flow document (no `schema` key, or `schema: 1`)
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyFlow {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub models: Vec<LegacyModel>,
    #[serde(default)]
    pub triggers: Value,
    #[serde(default)]
    pub destinations: Vec<Value>,
}

impl LegacyModel {
    fn migrate(self) -> Model {
        let mut execution = serde_json::Map::new();
        if let Some(image) = self.image {
            execution.insert("image".to_string(), Value::String(image));
        }
        if let Some(command) = self.command {
            execution.insert("command".to_string(), Value::String(command));
        }

        Model {
            name: self.name,
            input_ports: self.inputs.into_iter().map(|p| (p.clone(), p)).collect(),
            output_ports: self.outputs.into_iter().map(|p| (p.clone(), p)).collect(),
            static_ports: self.statics,
            execution: if execution.is_empty() {
                Value::Null
            } else {
                Value::Object(execution)
            },
            gpu: self.device == LegacyDevice::Gpu,
        }
    }
}

impl LegacyFlow {
    /// Upgrade to the current schema
    pub fn migrate(self) -> Flow {
        Flow {
            schema: CURRENT_SCHEMA,
            name: self.name,
            version: self.version,
            priority: self.priority,
            models: self.models.into_iter().map(LegacyModel::migrate).collect(),
            triggers: self.triggers,
            destinations: self.destinations,
        }
    }
}

/// Errors decoding a flow document of any schema
#[derive(Debug, Error)]
pub enum FlowDecodeError {
    #[error("unsupported flow schema version {0}")]
    UnsupportedSchema(u64),

    #[error("invalid flow document: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Read the schema number of an untyped document; a missing key means schema 1
pub fn schema_of(value: &Value) -> Result<u64, FlowDecodeError> {
    match value.get("schema") {
        None | Some(Value::Null) => Ok(1),
        Some(v) => v.as_u64().ok_or_else(|| {
            FlowDecodeError::Invalid(serde::de::Error::custom(format!(
                "schema must be an unsigned integer, found {}",
                v
            )))
        }),
    }
}

/// Decode a flow document of any known schema into the current model
pub fn flow_from_value(value: Value) -> Result<Flow, FlowDecodeError> {
    match schema_of(&value)? {
        1 => Ok(serde_json::from_value::<LegacyFlow>(value)?.migrate()),
        2 => Ok(serde_json::from_value::<Flow>(value)?),
        other => Err(FlowDecodeError::UnsupportedSchema(other)),
    }
}

/// Serde adapter for fields holding a flow of any schema
pub fn deserialize_versioned<'de, D>(deserializer: D) -> Result<Flow, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    flow_from_value(value).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_current_schema_roundtrip_keeps_ports() {
        let doc = json!({
            "schema": 2,
            "name": "ct-lung",
            "priority": 2,
            "models": [{
                "name": "segment",
                "input_ports": {"in": "src"},
                "output_ports": {"out": "dst"},
                "execution": {"image": "seg:1.0"},
                "gpu": true
            }]
        });

        let flow = flow_from_value(doc).unwrap();
        assert_eq!(flow.schema, CURRENT_SCHEMA);
        assert_eq!(flow.priority, 2);
        assert!(flow.models[0].gpu);
        assert!(flow.models[0].consumes("src"));
        assert!(flow.models[0].produces("dst"));
    }

    #[test]
    fn test_missing_schema_is_legacy() {
        let doc = json!({
            "name": "old",
            "models": [{
                "name": "m1",
                "inputs": ["src"],
                "outputs": ["dst"],
                "image": "old:3",
                "command": "run.sh",
                "device": "gpu"
            }]
        });

        let flow = flow_from_value(doc).unwrap();
        assert_eq!(flow.schema, CURRENT_SCHEMA);
        let model = &flow.models[0];
        assert_eq!(model.input_ports.get("src"), Some(&"src".to_string()));
        assert_eq!(model.output_ports.get("dst"), Some(&"dst".to_string()));
        assert_eq!(model.execution["image"], "old:3");
        assert_eq!(model.execution["command"], "run.sh");
        assert!(model.gpu);
    }

    #[test]
    fn test_unknown_schema_rejected() {
        let err = flow_from_value(json!({"schema": 9, "name": "x"})).unwrap_err();
        assert!(matches!(err, FlowDecodeError::UnsupportedSchema(9)));
    }

    #[test]
    fn test_port_name_sets_ignore_static_ports() {
        let flow = flow_from_value(json!({
            "schema": 2,
            "name": "f",
            "models": [{
                "name": "m",
                "input_ports": {"a": "src"},
                "output_ports": {"b": "dst"},
                "static_ports": {"atlas": "blob-atlas"}
            }]
        }))
        .unwrap();

        assert_eq!(flow.input_port_names().into_iter().collect::<Vec<_>>(), vec!["src"]);
        assert_eq!(flow.output_port_names().into_iter().collect::<Vec<_>>(), vec!["dst"]);
        assert!(flow.models[0].reads_only_source());
    }

    #[test]
    fn test_reads_only_source() {
        let flow = flow_from_value(json!({
            "schema": 2,
            "name": "f",
            "models": [
                {"name": "a", "input_ports": {"x": "src", "y": "src"}, "output_ports": {"o": "A"}},
                {"name": "b", "input_ports": {"x": "src", "y": "A"}, "output_ports": {"o": "B"}},
                {"name": "c", "output_ports": {"o": "C"}}
            ]
        }))
        .unwrap();

        // Two mounts of the same port still read only src
        assert!(flow.models[0].reads_only_source());
        assert!(!flow.models[1].reads_only_source());
        assert!(!flow.models[2].reads_only_source());
    }
}
