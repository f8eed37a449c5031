//! Builder for ordered R statement sequences.
//!
//! Handlers bind each argument and output path to a named variable and then
//! call the analysis function with those variables. Order matters: the final
//! call refers to every variable assigned before it.

use std::path::Path;

/// Quotes a value as an R string literal.
pub fn quote_r_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Accumulates statements in evaluation order.
#[derive(Debug, Clone, Default)]
pub struct StatementBuilder {
    statements: Vec<String>,
}

impl StatementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `library(package)`
    pub fn library(mut self, package: &str) -> Self {
        self.statements.push(format!("library({})", package));
        self
    }

    /// `name="value"`
    pub fn assign_str(mut self, name: &str, value: &str) -> Self {
        self.statements
            .push(format!("{}={}", name, quote_r_string(value)));
        self
    }

    /// `name="path"`
    pub fn assign_path(self, name: &str, path: &Path) -> Self {
        let value = path.to_string_lossy();
        self.assign_str(name, &value)
    }

    /// `name=value` for a finite number.
    pub fn assign_num(mut self, name: &str, value: f64) -> Self {
        debug_assert!(value.is_finite(), "R numeric literal must be finite");
        self.statements.push(format!("{}={}", name, value));
        self
    }

    /// `result<-function(arg1,arg2,...)`
    pub fn call(mut self, result: &str, function: &str, args: &[&str]) -> Self {
        self.statements
            .push(format!("{}<-{}({})", result, function, args.join(",")));
        self
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn build(self) -> Vec<String> {
        self.statements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_r_string() {
        assert_eq!(quote_r_string("abc"), "\"abc\"");
        assert_eq!(quote_r_string("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote_r_string("C:\\data"), "\"C:\\\\data\"");
        assert_eq!(quote_r_string("line\nbreak"), "\"line\\nbreak\"");
    }

    #[test]
    fn test_statement_sequence_order() {
        let statements = StatementBuilder::new()
            .library("pals")
            .assign_str("userName", "u")
            .assign_path("obsCSV", Path::new("/tmp/in/x.csv"))
            .assign_num("longitude", 135.0)
            .assign_num("latitude", -35.25)
            .call("result", "convertCSV2NetCDF", &["obsCSV", "userName"])
            .build();

        assert_eq!(
            statements,
            vec![
                "library(pals)",
                "userName=\"u\"",
                "obsCSV=\"/tmp/in/x.csv\"",
                "longitude=135",
                "latitude=-35.25",
                "result<-convertCSV2NetCDF(obsCSV,userName)",
            ]
        );
    }

    #[test]
    fn test_injection_stays_inside_literal() {
        let statements = StatementBuilder::new()
            .assign_str("dataSetName", "x\"); system(\"rm -rf /")
            .build();
        assert_eq!(
            statements,
            vec!["dataSetName=\"x\\\"); system(\\\"rm -rf /\""]
        );
    }

    #[test]
    fn test_len_and_empty() {
        let builder = StatementBuilder::new();
        assert!(builder.is_empty());
        let builder = builder.library("pals");
        assert_eq!(builder.len(), 1);
    }
}
