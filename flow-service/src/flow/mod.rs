// Flow definition module
// Flow/Model types, schema migration, parsing, and DAG validation

pub mod error;
pub mod graph;
pub mod models;
pub mod parser;

pub use error::{ParseError, ParseErrorKind, ParseResult};
pub use graph::{FlowGraph, FlowValidator, GraphError, GraphErrorKind, PortEdge, ValidatedFlow};
pub use models::{
    Flow, FlowDecodeError, Model, CURRENT_SCHEMA, DESTINATION_PORT, MAX_FLOW_PRIORITY,
    SOURCE_PORT,
};
pub use parser::{FlowParser, LoadError};
