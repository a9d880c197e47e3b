// Flow parse error types with helpful error messages
// Provides line/column info, a source excerpt, and suggestions for common mistakes

use std::fmt;

/// Detailed parse error with location and context
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// Surrounding source lines
    pub context: String,
    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
    /// The kind of error
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML/JSON syntax error
    Syntax,
    /// Wrong types, missing fields
    InvalidSchema,
    /// `schema` names a version this build does not know
    UnsupportedSchema,
    /// File could not be read
    Io,
}

impl ParseError {
    pub fn new(message: impl Into<String>, kind: ParseErrorKind) -> Self {
        Self {
            message: message.into(),
            line: 0,
            column: 0,
            context: String::new(),
            suggestion: None,
            kind,
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    fn with_suggestion_opt(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }

    /// Attach the lines around the error location
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column + 7) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Build from a serde_yaml error, pointing into `source`
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let msg = err.to_string();
        let kind = if msg.contains("missing field")
            || msg.contains("unknown field")
            || msg.contains("invalid type")
        {
            ParseErrorKind::InvalidSchema
        } else {
            ParseErrorKind::Syntax
        };

        ParseError::new(format_yaml_error_message(&msg), kind)
            .at(line, column)
            .with_source_context(source, 2)
            .with_suggestion_opt(suggest_fix(&msg, source, line))
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        if self.line > 0 {
            writeln!(f, "  --> line {}:{}", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Result type for flow parsing
pub type ParseResult<T> = Result<T, ParseError>;

/// Trim serde_yaml's message down to the part a flow author cares about
fn format_yaml_error_message(msg: &str) -> String {
    if let Some(field) = extract_between(msg, "missing field `", "`") {
        return format!("missing required field '{}'", field);
    }

    if let Some(field) = extract_between(msg, "unknown field `", "`") {
        return format!("unknown field '{}'", field);
    }

    if msg.contains("invalid type") {
        if let (Some(expected), Some(found)) = (
            extract_between(msg, "expected ", " at"),
            extract_between(msg, "invalid type: ", ","),
        ) {
            return format!("expected {}, but found {}", expected, found);
        }
    }

    // serde_yaml appends " at line X column Y"; the location is reported separately
    match msg.find(" at line ") {
        Some(idx) => msg[..idx].to_string(),
        None => msg.to_string(),
    }
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

/// Suggest fixes for common flow authoring mistakes
fn suggest_fix(msg: &str, source: &str, line: usize) -> Option<String> {
    let error_line = source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or("")
        .to_lowercase();

    if msg.contains("missing field `name`") {
        return Some("every flow and every model needs a 'name'".to_string());
    }

    if msg.contains("invalid type") && error_line.contains("_ports") {
        return Some(
            "schema 2 ports are maps of mount name to port, e.g. `input_ports: {in: src}`"
                .to_string(),
        );
    }

    if msg.contains("invalid type") && (error_line.contains("inputs") || error_line.contains("outputs")) {
        return Some("schema 1 ports are lists, e.g. `inputs: [src]`".to_string());
    }

    if error_line.starts_with('\t') {
        return Some("YAML does not allow tabs for indentation. Replace tabs with spaces.".to_string());
    }

    let typo_suggestions = [
        ("inputports", "input_ports"),
        ("outputports", "output_ports"),
        ("staticports", "static_ports"),
        ("device: gpu", "gpu: true (schema 2)"),
    ];

    let compact = error_line.replace(['-', ' '], "");
    for (typo, correct) in typo_suggestions {
        if compact.contains(&typo.replace(' ', "")) {
            return Some(format!("did you mean '{}'?", correct));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("missing required field 'name'", ParseErrorKind::InvalidSchema)
            .at(3, 5)
            .with_suggestion("every flow and every model needs a 'name'");

        let output = format!("{}", err);
        assert!(output.contains("missing required field"));
        assert!(output.contains("line 3:5"));
        assert!(output.contains("help:"));
    }

    #[test]
    fn test_display_without_location() {
        let err = ParseError::new("unsupported flow schema version 7", ParseErrorKind::UnsupportedSchema);
        let output = format!("{}", err);
        assert!(!output.contains("-->"));
    }

    #[test]
    fn test_source_context_marks_line() {
        let source = "schema: 2\nname: ct\nmodels:\n  - name: seg\n    input_ports: [src]\n";
        let err = ParseError::new("bad ports", ParseErrorKind::InvalidSchema)
            .at(5, 5)
            .with_source_context(source, 1);

        assert!(err.context.contains(">    5 |"));
        assert!(err.context.contains("input_ports"));
    }

    #[test]
    fn test_extract_between() {
        let msg = "models[0]: missing field `name` at line 4 column 5";
        assert_eq!(
            extract_between(msg, "missing field `", "`"),
            Some("name".to_string())
        );
        assert_eq!(format_yaml_error_message(msg), "missing required field 'name'");
    }

    #[test]
    fn test_location_suffix_trimmed() {
        assert_eq!(
            format_yaml_error_message("did not find expected key at line 2 column 1"),
            "did not find expected key"
        );
    }
}
