//! Shared error utilities used across the compilation pipeline.
//!
//! Diagnostics are kept lightweight on purpose – parser errors point at the
//! offending byte of the space-stripped expression with a caret, the
//! remaining kinds carry just enough context to name the culprit.

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Snafu)]
pub enum CompileError {
  /// Structurally broken input: unbalanced parentheses, an argument list
  /// without a terminator, stray bytes inside a numeric literal.
  #[snafu(display("{expr_line}\n{marker} {message}"))]
  Malformed {
    expr_line: String,
    marker: String,
    message: String,
  },

  /// A variable or function name with no entry in the symbol table.
  #[snafu(display("unknown name '{name}'"))]
  NameNotFound { name: String },

  /// A decimal literal that does not fit in 32 bits.
  #[snafu(display("constant '{literal}' does not fit in 32 bits"))]
  ConstantOverflow { literal: String },

  /// A register/instruction combination outside the encoding tables.
  /// Reaching this from the public API indicates a bug.
  #[snafu(display("internal consistency violation: {message}"))]
  InternalConsistency { message: String },
}

impl CompileError {
  /// Construct a malformed-input error anchored at a byte offset in the
  /// (space-stripped) expression.
  pub fn at(expr: &str, loc: usize, message: impl Into<String>) -> Self {
    let expr_line = format!("'{expr}'");
    let safe_loc = loc.min(expr.len());
    let char_offset = expr[..safe_loc].chars().count() + 1; // account for opening quote
    let marker = format!("{}^", " ".repeat(char_offset));
    Self::Malformed {
      expr_line,
      marker,
      message: message.into(),
    }
  }

  pub fn name_not_found(name: impl Into<String>) -> Self {
    Self::NameNotFound { name: name.into() }
  }

  pub fn overflow(literal: impl Into<String>) -> Self {
    Self::ConstantOverflow {
      literal: literal.into(),
    }
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::InternalConsistency {
      message: message.into(),
    }
  }
}
