//! Assembler diagnostics.

use std::fmt;

/// Classification of a compile failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A token that cannot be parsed in its context.
    Syntax,
    /// A well-formed statement whose meaning is illegal.
    Semantic,
    /// File access, size or recursion-depth failures.
    Resource,
}

/// One diagnostic with its source position.
#[derive(Debug, Clone)]
pub struct AsmError {
    pub kind: ErrorKind,
    pub message: String,
    /// Source unit identifier the line came from.
    pub file: String,
    /// 1-based line number.
    pub line: u32,
    /// Chain of INCLUDE identifiers leading to `file`, outermost first.
    pub include_chain: Vec<String>,
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Semantic => "semantic",
            ErrorKind::Resource => "resource",
        };
        write!(f, "{}:{}: {} error: {}", self.file, self.line, kind, self.message)?;
        for via in self.include_chain.iter().rev() {
            write!(f, "\n  included from {via}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AsmError {}

/// Every diagnostic a failed `compile` produced, in source order.
#[derive(Debug, Clone)]
pub struct Errors(pub Vec<AsmError>);

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, error) in self.0.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}
