// Flow Parser
// Loads flow definitions from YAML or JSON, migrating legacy schemas on the way in

use crate::flow::error::{ParseError, ParseErrorKind, ParseResult};
use crate::flow::graph::{FlowValidator, GraphError, ValidatedFlow};
use crate::flow::models::{schema_of, Flow, FlowDecodeError, LegacyFlow};

use std::fmt;
use std::path::Path;

/// Parser for flow definition documents
pub struct FlowParser;

impl FlowParser {
    /// Parse a flow from a YAML (or JSON) string
    pub fn parse_str(source: &str) -> ParseResult<Flow> {
        let raw: serde_json::Value = serde_yaml::from_str(source)
            .map_err(|e| ParseError::from_yaml_error(&e, source))?;

        // Parse again into the typed schema so field errors keep their location
        match schema_of(&raw) {
            Ok(1) => serde_yaml::from_str::<LegacyFlow>(source)
                .map(LegacyFlow::migrate)
                .map_err(|e| ParseError::from_yaml_error(&e, source)),
            Ok(2) => serde_yaml::from_str::<Flow>(source)
                .map_err(|e| ParseError::from_yaml_error(&e, source)),
            Ok(other) => Err(ParseError::new(
                FlowDecodeError::UnsupportedSchema(other).to_string(),
                ParseErrorKind::UnsupportedSchema,
            )
            .with_suggestion("supported schema versions are 1 and 2")),
            Err(e) => Err(ParseError::new(e.to_string(), ParseErrorKind::InvalidSchema)),
        }
    }

    /// Parse a flow from a file
    pub fn parse_file(path: impl AsRef<Path>) -> ParseResult<Flow> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            ParseError::new(
                format!("failed to read {}: {}", path.display(), e),
                ParseErrorKind::Io,
            )
        })?;
        Self::parse_str(&source)
    }

    /// Parse and validate a flow file in one step
    pub fn load_file(path: impl AsRef<Path>) -> Result<ValidatedFlow, LoadError> {
        let flow = Self::parse_file(path).map_err(LoadError::Parse)?;
        FlowValidator::validate(flow).map_err(LoadError::Invalid)
    }
}

/// Failure loading a flow file: either unreadable or structurally invalid
#[derive(Debug, Clone)]
pub enum LoadError {
    Parse(ParseError),
    Invalid(GraphError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Parse(e) => write!(f, "{}", e),
            LoadError::Invalid(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LoadError {}
