//! Recursive-descent parser producing the expression AST.
//!
//! Unlike a token-based front-end, this parser works directly on the
//! space-stripped byte string and descends on half-open index ranges
//! `[l, r)`. That keeps the operator-splitting rules (lowest precedence
//! wins, rightmost among equals, unary signs absorbed via an empty left
//! operand) expressible as plain cursor arithmetic.

use crate::error::{CompileError, CompileResult};
use log::debug;
use std::num::IntErrorKind;

/// Binary operators recognised by the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
}

impl BinaryOp {
  fn from_byte(byte: u8) -> Option<Self> {
    match byte {
      b'+' => Some(Self::Add),
      b'-' => Some(Self::Sub),
      b'*' => Some(Self::Mul),
      _ => None,
    }
  }

  /// Split priority: additive operators bind loosest and are preferred as
  /// the split point, so the tree keeps them closest to the root.
  fn precedence(self) -> u8 {
    match self {
      Self::Add | Self::Sub => 0,
      Self::Mul => 1,
    }
  }
}

/// Expression tree handed to the code generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AstNode {
  /// Integer literal, stored as its hexadecimal text form `"0x<hex>"`.
  Constant { text: String },
  /// Named global whose address is resolved at emission time.
  Variable { name: String },
  Binary {
    op: BinaryOp,
    lhs: Box<AstNode>,
    rhs: Box<AstNode>,
  },
  /// Call with arguments in source order; always at least one.
  Call { name: String, args: Vec<AstNode> },
}

impl AstNode {
  pub fn constant(value: u32) -> Self {
    Self::Constant {
      text: format!("{value:#x}"),
    }
  }

  /// The materialized operand for an empty range, e.g. the left side of a
  /// leading minus.
  pub fn zero() -> Self {
    Self::constant(0)
  }

  pub fn variable(name: impl Into<String>) -> Self {
    Self::Variable { name: name.into() }
  }

  pub fn binary(op: BinaryOp, lhs: AstNode, rhs: AstNode) -> Self {
    Self::Binary {
      op,
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
    }
  }

  pub fn call(name: impl Into<String>, args: Vec<AstNode>) -> Self {
    Self::Call {
      name: name.into(),
      args,
    }
  }

  /// Number of nodes in the tree, root included.
  pub fn node_count(&self) -> usize {
    match self {
      Self::Constant { .. } | Self::Variable { .. } => 1,
      Self::Binary { lhs, rhs, .. } => 1 + lhs.node_count() + rhs.node_count(),
      Self::Call { args, .. } => 1 + args.iter().map(AstNode::node_count).sum::<usize>(),
    }
  }
}

/// Parse an expression into its AST.
///
/// Space characters (0x20) are removed up front; every other byte,
/// tabs and newlines included, participates in the grammar. Inputs are
/// expected to be well-formed; the parser reports structural damage but
/// makes no attempt at recovery.
pub fn parse(expression: &str) -> CompileResult<AstNode> {
  let stripped: String = expression.chars().filter(|&c| c != ' ').collect();
  let parser = RangeParser { text: stripped };
  let root = parser.parse_range(0, parser.text.len())?;
  debug!(
    "parsed {} bytes into a {}-node tree",
    parser.text.len(),
    root.node_count()
  );
  Ok(root)
}

/// Descent state: the stripped expression, shared by every range.
struct RangeParser {
  text: String,
}

impl RangeParser {
  fn bytes(&self) -> &[u8] {
    self.text.as_bytes()
  }

  fn parse_range(&self, l: usize, r: usize) -> CompileResult<AstNode> {
    let (l, r) = self.strip_outer_parens(l, r);

    if let Some((op, pos)) = self.find_split(l, r) {
      let lhs = self.parse_range(l, pos)?;
      let rhs = self.parse_range(pos + 1, r)?;
      return Ok(AstNode::binary(op, lhs, rhs));
    }

    self.parse_leaf(l, r)
  }

  /// Remove balanced wrapping parentheses. A pair only counts as wrapping
  /// when the region between them keeps a non-negative balance, which is
  /// what distinguishes `((a+b))` from `(a+b)*(c+d)`.
  fn strip_outer_parens(&self, mut l: usize, mut r: usize) -> (usize, usize) {
    let bytes = self.bytes();
    while l < r
      && bytes[l] == b'('
      && bytes[r - 1] == b')'
      && self.balance_stays_non_negative(l + 1, r - 1)
    {
      l += 1;
      r -= 1;
    }
    (l, r)
  }

  fn balance_stays_non_negative(&self, l: usize, r: usize) -> bool {
    let mut balance: i64 = 0;
    for &byte in &self.bytes()[l..r] {
      match byte {
        b'(' => balance += 1,
        b')' => balance -= 1,
        _ => {}
      }
      if balance < 0 {
        return false;
      }
    }
    true
  }

  /// Locate the operator this range splits at: scan left to right at
  /// parenthesis depth 0, keep the lowest-precedence operator seen and
  /// prefer a later one on ties. After each discovered operator the cursor
  /// jumps past any immediately following run of `*`/`+`/`-` (and the byte
  /// after the run), which is how stacked unary signs like `5*-+-3` stay
  /// attached to their operand instead of becoming split points.
  fn find_split(&self, l: usize, r: usize) -> Option<(BinaryOp, usize)> {
    let bytes = self.bytes();
    let mut found: Option<(BinaryOp, usize)> = None;
    let mut depth: i64 = 0;
    let mut i = l;

    while i < r {
      match bytes[i] {
        b'(' => depth += 1,
        b')' => depth -= 1,
        _ => {}
      }

      if depth == 0 {
        if let Some(op) = BinaryOp::from_byte(bytes[i]) {
          match found {
            None => found = Some((op, i)),
            Some((best, _)) if op.precedence() <= best.precedence() => found = Some((op, i)),
            Some(_) => {}
          }
          i += 1;
          while i < r && matches!(bytes[i], b'*' | b'+' | b'-') {
            i += 1;
          }
        }
      }

      i += 1;
    }

    found
  }

  /// Classify a range with no split point. Order matters: a leading digit
  /// makes a constant, a `(` anywhere makes a call, anything else is a
  /// variable name. The empty range materializes as the constant zero.
  fn parse_leaf(&self, l: usize, r: usize) -> CompileResult<AstNode> {
    if r <= l {
      return Ok(AstNode::zero());
    }

    let bytes = self.bytes();
    if bytes[l].is_ascii_digit() {
      return self.parse_constant(l, r);
    }
    if bytes[l..r].contains(&b'(') {
      return self.parse_call(l, r);
    }

    Ok(AstNode::variable(&self.text[l..r]))
  }

  /// Decimal literal, re-encoded as lowercase hexadecimal text.
  fn parse_constant(&self, l: usize, r: usize) -> CompileResult<AstNode> {
    let literal = &self.text[l..r];
    match literal.parse::<u32>() {
      Ok(value) => Ok(AstNode::constant(value)),
      Err(err) if *err.kind() == IntErrorKind::PosOverflow => Err(CompileError::overflow(literal)),
      Err(_) => Err(CompileError::at(
        &self.text,
        l,
        format!("invalid constant '{literal}'"),
      )),
    }
  }

  fn parse_call(&self, l: usize, r: usize) -> CompileResult<AstNode> {
    let bytes = self.bytes();
    let open = l + bytes[l..r].iter().position(|&b| b == b'(').unwrap_or(0);
    let name = &self.text[l..open];

    let mut args = Vec::new();
    for (arg_l, arg_r) in self.argument_ranges(open, r)? {
      args.push(self.parse_range(arg_l, arg_r)?);
    }

    Ok(AstNode::call(name, args))
  }

  /// Slice the argument list into top-level comma-separated sub-ranges.
  /// A comma only separates at depth 0 (counting from just inside the
  /// opening parenthesis); the `)` that takes the depth to -1 closes the
  /// list. Running off the range without seeing it is a structural error.
  fn argument_ranges(&self, open: usize, r: usize) -> CompileResult<Vec<(usize, usize)>> {
    let bytes = self.bytes();
    let mut ranges = Vec::new();
    let mut arg_l = open + 1;
    let mut cursor = arg_l;

    while cursor < r {
      let mut balance: i64 = 0;
      loop {
        if cursor >= r {
          return Err(CompileError::at(
            &self.text,
            r,
            "function arguments are missing a closing ')'",
          ));
        }
        let byte = bytes[cursor];
        if byte == b',' && balance == 0 {
          break;
        }
        match byte {
          b'(' => balance += 1,
          b')' => balance -= 1,
          _ => {}
        }
        if balance == -1 && byte == b')' {
          ranges.push((arg_l, cursor));
          return Ok(ranges);
        }
        cursor += 1;
      }
      ranges.push((arg_l, cursor));
      cursor += 1;
      arg_l = cursor;
    }

    Err(CompileError::at(
      &self.text,
      r,
      "function arguments are missing a closing ')'",
    ))
  }
}
