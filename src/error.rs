//! Error taxonomy for compiling and running scraping scripts.

use std::fmt;
use thiserror::Error;

/// A source-position diagnostic produced while transforming a script.
///
/// Lines are 1-based, columns 0-based. `file` is `None` for the entry source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub file: Option<String>,
    pub line: usize,
    pub column: usize,
    pub text: String,
}

impl Diagnostic {
    pub fn new(line: usize, column: usize, text: impl Into<String>) -> Self {
        Self {
            file: None,
            line,
            column,
            text: text.into(),
        }
    }

    pub(crate) fn in_file(mut self, file: Option<String>) -> Self {
        self.file = file;
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}:", file)?;
        }
        write!(f, "{}:{}: {}", self.line, self.column, self.text)
    }
}

fn join_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Everything that can go wrong between script source and extraction result.
#[derive(Debug, Error)]
pub enum Error {
    /// The source transformer rejected the script. Never empty.
    #[error("{}", join_diagnostics(.0))]
    Transform(Vec<Diagnostic>),

    #[error("default export is not defined")]
    MissingDefaultExport,

    /// Top-level script code threw while being evaluated.
    #[error("running user script: {0}")]
    Evaluation(String),

    #[error("invalid page url '{url}': {source}")]
    BaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The extraction function threw.
    #[error("{0}")]
    Execution(String),

    /// The extraction result has no JSON representation.
    #[error("serializing result: {0}")]
    Serialization(String),

    /// The sandbox runtime itself failed (isolate setup, thread gone).
    #[error("sandbox runtime: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The transform diagnostics, if this is a transform error.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            Self::Transform(diagnostics) => diagnostics,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let entry = Diagnostic::new(3, 7, "Expected ';'");
        assert_eq!(entry.to_string(), "3:7: Expected ';'");

        let nested = Diagnostic::new(1, 0, "Unexpected eof").in_file(Some("lib/util.js".into()));
        assert_eq!(nested.to_string(), "lib/util.js:1:0: Unexpected eof");
    }

    #[test]
    fn test_transform_error_lists_every_diagnostic() {
        let err = Error::Transform(vec![
            Diagnostic::new(1, 2, "first"),
            Diagnostic::new(4, 0, "second"),
        ]);
        assert_eq!(err.to_string(), "1:2: first\n4:0: second");
        assert_eq!(err.diagnostics().len(), 2);
        assert!(Error::MissingDefaultExport.diagnostics().is_empty());
    }
}
