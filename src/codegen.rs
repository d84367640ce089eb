//! Code generation: lower the parsed AST into raw A32 machine words.
//!
//! The emitter is a stack machine on the target's full descending stack:
//! every sub-expression leaves its 32-bit result on top of the stack and
//! parents consume operands by popping. Lowering happens in two stages:
//! the tree walk appends neutral intermediate instructions, then a
//! translation pass maps each of them onto fixed instruction encodings.
//! Keeping the walk encoding-agnostic confines all architectural knowledge
//! to the tables in [`encode`].

use crate::error::{CompileError, CompileResult};
use crate::parser::{AstNode, BinaryOp};
use log::{debug, trace};
use std::collections::HashMap;

/// Functions receive their arguments in r0-r3, so calls beyond four
/// arguments cannot be lowered.
const MAX_CALL_ARGS: usize = 4;

/// Registers the emitter knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
  R0,
  R1,
  R2,
  R3,
  R4,
  Lr,
  Pc,
}

impl Reg {
  /// Register holding the i-th call argument.
  fn argument(index: usize) -> Option<Reg> {
    match index {
      0 => Some(Reg::R0),
      1 => Some(Reg::R1),
      2 => Some(Reg::R2),
      3 => Some(Reg::R3),
      _ => None,
    }
  }

  /// Encoding field value for the general-purpose registers.
  fn number(self) -> Option<u32> {
    match self {
      Reg::R0 => Some(0),
      Reg::R1 => Some(1),
      Reg::R2 => Some(2),
      Reg::R3 => Some(3),
      Reg::R4 => Some(4),
      Reg::Lr | Reg::Pc => None,
    }
  }

  fn name(self) -> &'static str {
    match self {
      Reg::R0 => "r0",
      Reg::R1 => "r1",
      Reg::R2 => "r2",
      Reg::R3 => "r3",
      Reg::R4 => "r4",
      Reg::Lr => "lr",
      Reg::Pc => "pc",
    }
  }
}

/// Intermediate operations produced by the tree walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
  Add,
  Sub,
  Mul,
  Blx,
  /// Load a 32-bit immediate embedded right after the instruction:
  /// `ldr rX, [pc]`, a branch over the next word, then the word itself.
  LdrFromNext,
  /// Dereference: `ldr rX, [rX]`.
  LdrReg,
  PushReg,
  PushMultReg,
  PopReg,
  PopMultReg,
  /// Carrier for the literal word; emits nothing by itself, the payload
  /// is consumed by the preceding `LdrFromNext`.
  WordDecl,
}

/// One intermediate instruction: operation, up to two registers, and an
/// optional textual payload (a `0x…` literal or a decimal address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
  pub op: Opcode,
  pub reg_a: Option<Reg>,
  pub reg_b: Option<Reg>,
  pub payload: Option<String>,
}

impl Inst {
  pub fn new(op: Opcode, reg_a: Option<Reg>, reg_b: Option<Reg>, payload: Option<String>) -> Self {
    Self {
      op,
      reg_a,
      reg_b,
      payload,
    }
  }
}

/// Name→address directory for variables and functions. Duplicate inserts
/// overwrite, so the last writer wins.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
  map: HashMap<String, u32>,
}

impl SymbolTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, name: impl Into<String>, address: u32) {
    self.map.insert(name.into(), address);
  }

  pub fn resolve(&self, name: &str) -> Option<u32> {
    self.map.get(name).copied()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }
}

impl<S: Into<String>> FromIterator<(S, u32)> for SymbolTable {
  fn from_iter<T: IntoIterator<Item = (S, u32)>>(iter: T) -> Self {
    let mut table = Self::new();
    for (name, address) in iter {
      table.insert(name, address);
    }
    table
  }
}

/// Compile a tree into the final word stream.
pub fn generate(ast: &AstNode, symbols: &SymbolTable) -> CompileResult<Vec<u32>> {
  let insts = lower(ast, symbols)?;
  let words = encode(&insts)?;
  debug!(
    "emitted {} intermediate instructions, {} words",
    insts.len(),
    words.len()
  );
  Ok(words)
}

/// Walk the tree in post-order and produce the intermediate instruction
/// list, prologue and epilogue included.
pub fn lower(ast: &AstNode, symbols: &SymbolTable) -> CompileResult<Vec<Inst>> {
  let mut emitter = Emitter {
    insts: Vec::new(),
    symbols,
  };

  emitter.prologue();
  emitter.emit_node(ast)?;
  emitter.epilogue();

  Ok(emitter.insts)
}

struct Emitter<'a> {
  insts: Vec<Inst>,
  symbols: &'a SymbolTable,
}

impl Emitter<'_> {
  /// lr is preserved across the internal blx calls, r4 is the scratch
  /// register those calls go through; both are restored on exit.
  fn prologue(&mut self) {
    self.push_inst(Inst::new(Opcode::PushReg, Some(Reg::Lr), None, None));
    self.push_inst(Inst::new(Opcode::PushReg, Some(Reg::R4), None, None));
  }

  /// The result is on top of the stack; move it to r0 and return.
  fn epilogue(&mut self) {
    self.push_inst(Inst::new(Opcode::PopReg, Some(Reg::R0), None, None));
    self.push_inst(Inst::new(Opcode::PopMultReg, Some(Reg::R4), Some(Reg::Pc), None));
  }

  fn push_inst(&mut self, inst: Inst) {
    trace!("lowered {inst:?}");
    self.insts.push(inst);
  }

  fn emit_node(&mut self, node: &AstNode) -> CompileResult<()> {
    match node {
      AstNode::Constant { text } => self.emit_constant(text),
      AstNode::Variable { name } => self.emit_variable(name)?,
      AstNode::Binary { op, lhs, rhs } => {
        self.emit_node(lhs)?;
        self.emit_node(rhs)?;
        self.emit_binary(*op);
      }
      AstNode::Call { name, args } => self.emit_call(name, args)?,
    }
    Ok(())
  }

  /// ldr r0, [pc]; b over the word; .word literal; push {r0}
  fn emit_constant(&mut self, text: &str) {
    self.push_inst(Inst::new(
      Opcode::LdrFromNext,
      Some(Reg::R0),
      None,
      Some(text.to_string()),
    ));
    self.push_inst(Inst::new(Opcode::WordDecl, None, None, Some(text.to_string())));
    self.push_inst(Inst::new(Opcode::PushReg, Some(Reg::R0), None, None));
  }

  /// Same as a constant, but the embedded word is the variable's address
  /// and the value is read through it before the push.
  fn emit_variable(&mut self, name: &str) -> CompileResult<()> {
    let address = self.resolve(name)?;

    self.push_inst(Inst::new(
      Opcode::LdrFromNext,
      Some(Reg::R0),
      None,
      Some(address.clone()),
    ));
    self.push_inst(Inst::new(Opcode::WordDecl, None, None, Some(address)));
    self.push_inst(Inst::new(Opcode::LdrReg, Some(Reg::R0), Some(Reg::R0), None));
    self.push_inst(Inst::new(Opcode::PushReg, Some(Reg::R0), None, None));
    Ok(())
  }

  /// pop {r0-r1}; op r0, r1, r0; push {r0}
  ///
  /// Operands were pushed left first, so the multi-pop restores the left
  /// operand into r0 and the right into r1; `op r0, r1, r0` then computes
  /// left OP right. Getting this order wrong only shows up for sub and mul.
  fn emit_binary(&mut self, op: BinaryOp) {
    let opcode = match op {
      BinaryOp::Add => Opcode::Add,
      BinaryOp::Sub => Opcode::Sub,
      BinaryOp::Mul => Opcode::Mul,
    };

    self.push_inst(Inst::new(Opcode::PopMultReg, Some(Reg::R0), Some(Reg::R1), None));
    self.push_inst(Inst::new(opcode, Some(Reg::R0), Some(Reg::R1), None));
    self.push_inst(Inst::new(Opcode::PushReg, Some(Reg::R0), None, None));
  }

  /// Arguments are evaluated in source order, then popped highest register
  /// first so the first argument lands in r0, matching the register-argument
  /// convention. The callee address goes through r4.
  fn emit_call(&mut self, name: &str, args: &[AstNode]) -> CompileResult<()> {
    for arg in args {
      self.emit_node(arg)?;
    }

    if args.len() > MAX_CALL_ARGS {
      return Err(CompileError::internal(format!(
        "call to '{name}' has {} arguments, at most {MAX_CALL_ARGS} are supported",
        args.len()
      )));
    }
    let address = self.resolve(name)?;

    for index in (0..args.len()).rev() {
      let reg = Reg::argument(index)
        .ok_or_else(|| CompileError::internal(format!("no argument register for index {index}")))?;
      self.push_inst(Inst::new(Opcode::PopReg, Some(reg), None, None));
    }

    self.push_inst(Inst::new(
      Opcode::LdrFromNext,
      Some(Reg::R4),
      None,
      Some(address.clone()),
    ));
    self.push_inst(Inst::new(Opcode::WordDecl, None, None, Some(address)));
    self.push_inst(Inst::new(Opcode::Blx, Some(Reg::R4), None, None));
    self.push_inst(Inst::new(Opcode::PushReg, Some(Reg::R0), None, None));
    Ok(())
  }

  fn resolve(&self, name: &str) -> CompileResult<String> {
    self
      .symbols
      .resolve(name)
      .map(|address| address.to_string())
      .ok_or_else(|| CompileError::name_not_found(name))
  }
}

/// Translate intermediate instructions into raw words. Every encoding is
/// fixed; any operand combination outside the tables below is a bug in the
/// lowering, not in the input.
pub fn encode(insts: &[Inst]) -> CompileResult<Vec<u32>> {
  let mut words = Vec::new();

  for inst in insts {
    match inst.op {
      Opcode::Add => words.push(data_processing(0x4, inst)?),
      Opcode::Sub => words.push(data_processing(0x2, inst)?),

      Opcode::Mul => {
        let rd = reg_number(inst.reg_a, inst)?;
        let rm = reg_number(inst.reg_b, inst)?;
        words.push((0xe << 28) | (rd << 16) | (rd << 8) | (0x9 << 4) | rm);
      }

      Opcode::Blx => match inst.reg_a {
        Some(Reg::R4) => words.push(0xe12f_ff34),
        _ => return Err(unencodable(inst)),
      },

      Opcode::LdrFromNext => {
        match inst.reg_a {
          Some(Reg::R0) => words.push(0xe59f_0000), // ldr r0, [pc]
          Some(Reg::R4) => words.push(0xe59f_4000), // ldr r4, [pc]
          _ => return Err(unencodable(inst)),
        }
        words.push(0xea00_0000); // b over the embedded word
        words.push(payload_word(inst)?);
      }

      Opcode::LdrReg => match inst.reg_a {
        Some(Reg::R0) => words.push(0xe590_0000), // ldr r0, [r0]
        Some(Reg::R4) => words.push(0xe594_4000), // ldr r4, [r4]
        _ => return Err(unencodable(inst)),
      },

      Opcode::PushReg => match inst.reg_a {
        Some(Reg::R0) => words.push(0xe52d_0004),
        Some(Reg::R1) => words.push(0xe52d_1004),
        Some(Reg::R2) => words.push(0xe52d_2004),
        Some(Reg::R3) => words.push(0xe52d_3004),
        Some(Reg::R4) => words.push(0xe52d_4004),
        Some(Reg::Lr) => words.push(0xe52d_e004),
        _ => return Err(unencodable(inst)),
      },

      Opcode::PushMultReg => match inst.reg_b {
        Some(Reg::R1) => words.push(0xe92d_0003), // push {r0-r1}
        Some(Reg::R2) => words.push(0xe92d_0007), // push {r0-r2}
        Some(Reg::R3) => words.push(0xe92d_000f), // push {r0-r3}
        _ => return Err(unencodable(inst)),
      },

      Opcode::PopReg => match inst.reg_a {
        Some(Reg::R0) => words.push(0xe49d_0004),
        Some(Reg::R1) => words.push(0xe49d_1004),
        Some(Reg::R2) => words.push(0xe49d_2004),
        Some(Reg::R3) => words.push(0xe49d_3004),
        Some(Reg::R4) => words.push(0xe49d_4004),
        _ => return Err(unencodable(inst)),
      },

      Opcode::PopMultReg => match (inst.reg_a, inst.reg_b) {
        (_, Some(Reg::R1)) => words.push(0xe8bd_0003), // pop {r0-r1}
        (_, Some(Reg::R2)) => words.push(0xe8bd_0007), // pop {r0-r2}
        (_, Some(Reg::R3)) => words.push(0xe8bd_000f), // pop {r0-r3}
        (Some(Reg::R4), Some(Reg::Pc)) => words.push(0xe8bd_8010), // pop {r4, pc}
        _ => return Err(unencodable(inst)),
      },

      Opcode::WordDecl => {} // embedded by the preceding LdrFromNext
    }
  }

  Ok(words)
}

/// add/sub shape: `op rd, rn, rd` with S=0, condition AL.
fn data_processing(op_bits: u32, inst: &Inst) -> CompileResult<u32> {
  let rd = reg_number(inst.reg_a, inst)?;
  let rn = reg_number(inst.reg_b, inst)?;
  Ok((0xe << 28) | (op_bits << 21) | (rn << 16) | (rd << 12) | rd)
}

fn reg_number(reg: Option<Reg>, inst: &Inst) -> CompileResult<u32> {
  reg.and_then(Reg::number).ok_or_else(|| unencodable(inst))
}

/// Decode a payload string, accepting both `0x…` literals and decimal
/// addresses.
fn payload_word(inst: &Inst) -> CompileResult<u32> {
  let payload = inst.payload.as_deref().ok_or_else(|| unencodable(inst))?;
  let parsed = match payload.strip_prefix("0x").or_else(|| payload.strip_prefix("0X")) {
    Some(hex) => u32::from_str_radix(hex, 16),
    None => payload.parse::<u32>(),
  };
  parsed.map_err(|_| CompileError::internal(format!("bad literal payload '{payload}'")))
}

fn unencodable(inst: &Inst) -> CompileError {
  CompileError::internal(format!("no encoding for {inst:?}"))
}

/// Render the intermediate list as an assembly listing, one line per
/// emitted word so the text lines up with the binary.
pub fn listing(insts: &[Inst]) -> String {
  let mut asm = String::new();

  for inst in insts {
    let reg_a = inst.reg_a.map(Reg::name).unwrap_or("?");
    let reg_b = inst.reg_b.map(Reg::name).unwrap_or("?");

    match inst.op {
      Opcode::Add => asm.push_str(&format!("    add {reg_a}, {reg_b}, {reg_a}\n")),
      Opcode::Sub => asm.push_str(&format!("    sub {reg_a}, {reg_b}, {reg_a}\n")),
      Opcode::Mul => asm.push_str(&format!("    mul {reg_a}, {reg_b}, {reg_a}\n")),
      Opcode::Blx => asm.push_str(&format!("    blx {reg_a}\n")),
      Opcode::LdrFromNext => {
        asm.push_str(&format!("    ldr {reg_a}, [pc]\n"));
        asm.push_str("    b . + 8\n");
      }
      Opcode::LdrReg => asm.push_str(&format!("    ldr {reg_a}, [{reg_b}]\n")),
      Opcode::PushReg => asm.push_str(&format!("    push {{{reg_a}}}\n")),
      Opcode::PushMultReg => asm.push_str(&format!("    push {{r0-{reg_b}}}\n")),
      Opcode::PopReg => asm.push_str(&format!("    pop {{{reg_a}}}\n")),
      Opcode::PopMultReg => {
        if inst.reg_b == Some(Reg::Pc) {
          asm.push_str(&format!("    pop {{{reg_a}, pc}}\n"));
        } else {
          asm.push_str(&format!("    pop {{r0-{reg_b}}}\n"));
        }
      }
      Opcode::WordDecl => {
        let word = payload_word(inst).unwrap_or(0);
        asm.push_str(&format!("    .word {word:#x}\n"));
      }
    }
  }

  asm
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::parser::parse;

  const PROLOGUE: [u32; 2] = [0xe52d_e004, 0xe52d_4004];
  const EPILOGUE: [u32; 2] = [0xe49d_0004, 0xe8bd_8010];

  fn compile(expression: &str, symbols: &SymbolTable) -> Vec<u32> {
    generate(&parse(expression).unwrap(), symbols).unwrap()
  }

  #[test]
  fn prologue_and_epilogue_frame_every_program() {
    let words = compile("1", &SymbolTable::new());
    assert_eq!(&words[..2], &PROLOGUE);
    assert_eq!(&words[words.len() - 2..], &EPILOGUE);
  }

  #[test]
  fn constant_emits_a_three_word_literal_pool() {
    let words = compile("42", &SymbolTable::new());
    assert_eq!(
      words,
      vec![
        0xe52d_e004, // push {lr}
        0xe52d_4004, // push {r4}
        0xe59f_0000, // ldr r0, [pc]
        0xea00_0000, // b . + 8
        0x0000_002a, // .word 42
        0xe52d_0004, // push {r0}
        0xe49d_0004, // pop {r0}
        0xe8bd_8010, // pop {r4, pc}
      ]
    );
  }

  #[test]
  fn addition_pops_both_operands_and_adds() {
    let words = compile("2+3", &SymbolTable::new());
    assert_eq!(
      words,
      vec![
        0xe52d_e004,
        0xe52d_4004,
        0xe59f_0000,
        0xea00_0000,
        0x0000_0002,
        0xe52d_0004,
        0xe59f_0000,
        0xea00_0000,
        0x0000_0003,
        0xe52d_0004,
        0xe8bd_0003, // pop {r0-r1}
        0xe081_0000, // add r0, r1, r0
        0xe52d_0004, // push {r0}
        0xe49d_0004,
        0xe8bd_8010,
      ]
    );
  }

  #[test]
  fn subtraction_and_product_use_their_own_encodings() {
    let sub = compile("5-3", &SymbolTable::new());
    assert!(sub.contains(&0xe041_0000)); // sub r0, r1, r0

    let mul = compile("5*3", &SymbolTable::new());
    assert!(mul.contains(&0xe000_0091)); // mul r0, r1, r0
  }

  #[test]
  fn variable_loads_address_then_dereferences() {
    let symbols: SymbolTable = [("x", 0x2000_0010u32)].into_iter().collect();
    let words = compile("x", &symbols);
    assert_eq!(
      &words[2..7],
      &[
        0xe59f_0000, // ldr r0, [pc]
        0xea00_0000,
        0x2000_0010, // the variable's address
        0xe590_0000, // ldr r0, [r0]
        0xe52d_0004, // push {r0}
      ]
    );
  }

  #[test]
  fn call_pops_arguments_into_registers_in_reverse() {
    let symbols: SymbolTable = [("add", 0x0001_0000u32)].into_iter().collect();
    let words = compile("add(2,3)", &symbols);
    // After both argument pushes: pop {r1} first, then pop {r0}, so the
    // first source argument ends up in r0.
    let tail = &words[words.len() - 9..];
    assert_eq!(
      tail,
      &[
        0xe49d_1004, // pop {r1}
        0xe49d_0004, // pop {r0}
        0xe59f_4000, // ldr r4, [pc]
        0xea00_0000,
        0x0001_0000, // callee address
        0xe12f_ff34, // blx r4
        0xe52d_0004, // push {r0}
        0xe49d_0004,
        0xe8bd_8010,
      ]
    );
  }

  #[test]
  fn four_argument_call_uses_r0_through_r3() {
    let symbols: SymbolTable = [("f", 4096u32)].into_iter().collect();
    let insts = lower(&parse("f(1,2,3,4)").unwrap(), &symbols).unwrap();
    let pops: Vec<&Inst> = insts.iter().filter(|i| i.op == Opcode::PopReg).collect();
    // One epilogue pop plus the four argument pops, highest register first.
    assert_eq!(pops.len(), 5);
    assert_eq!(pops[0].reg_a, Some(Reg::R3));
    assert_eq!(pops[1].reg_a, Some(Reg::R2));
    assert_eq!(pops[2].reg_a, Some(Reg::R1));
    assert_eq!(pops[3].reg_a, Some(Reg::R0));
  }

  #[test]
  fn five_argument_call_is_rejected() {
    let symbols: SymbolTable = [("f", 4096u32)].into_iter().collect();
    let result = generate(&parse("f(1,2,3,4,5)").unwrap(), &symbols);
    assert!(matches!(
      result,
      Err(CompileError::InternalConsistency { .. })
    ));
  }

  #[test]
  fn unknown_variable_is_reported() {
    let result = generate(&parse("x+1").unwrap(), &SymbolTable::new());
    assert!(matches!(result, Err(CompileError::NameNotFound { .. })));
  }

  #[test]
  fn unknown_function_is_reported() {
    let result = generate(&parse("f(1)").unwrap(), &SymbolTable::new());
    assert!(matches!(result, Err(CompileError::NameNotFound { .. })));
  }

  #[test]
  fn duplicate_symbols_last_writer_wins() {
    let mut symbols = SymbolTable::new();
    symbols.insert("x", 1);
    symbols.insert("x", 2);
    assert_eq!(symbols.resolve("x"), Some(2));
  }

  #[test]
  fn emission_is_deterministic() {
    let symbols: SymbolTable = [("x", 64u32), ("f", 128u32)].into_iter().collect();
    let tree = parse("f(x*2,x)-7").unwrap();
    assert_eq!(
      generate(&tree, &symbols).unwrap(),
      generate(&tree, &symbols).unwrap()
    );
  }

  #[test]
  fn push_mult_encodings_match_the_table() {
    for (top, word) in [(Reg::R1, 0xe92d_0003), (Reg::R2, 0xe92d_0007), (Reg::R3, 0xe92d_000f)] {
      let inst = Inst::new(Opcode::PushMultReg, Some(Reg::R0), Some(top), None);
      assert_eq!(encode(&[inst]).unwrap(), vec![word]);
    }
  }

  #[test]
  fn out_of_table_combinations_are_internal_errors() {
    let bad = [
      Inst::new(Opcode::Blx, Some(Reg::R0), None, None),
      Inst::new(Opcode::LdrFromNext, Some(Reg::R1), None, Some("0x1".into())),
      Inst::new(Opcode::PopReg, Some(Reg::Lr), None, None),
      Inst::new(Opcode::PopMultReg, Some(Reg::R0), Some(Reg::R4), None),
      Inst::new(Opcode::Add, Some(Reg::Pc), Some(Reg::R1), None),
    ];
    for inst in bad {
      assert!(matches!(
        encode(&[inst]),
        Err(CompileError::InternalConsistency { .. })
      ));
    }
  }

  #[test]
  fn missing_payload_is_an_internal_error() {
    let inst = Inst::new(Opcode::LdrFromNext, Some(Reg::R0), None, None);
    assert!(matches!(
      encode(&[inst]),
      Err(CompileError::InternalConsistency { .. })
    ));
  }

  #[test]
  fn listing_lines_up_with_the_word_stream() {
    let symbols: SymbolTable = [("x", 8u32)].into_iter().collect();
    let insts = lower(&parse("x+1").unwrap(), &symbols).unwrap();
    let text = listing(&insts);
    let words = encode(&insts).unwrap();
    assert_eq!(text.lines().count(), words.len());
    assert!(text.contains("ldr r0, [r0]"));
    assert!(text.contains("add r0, r1, r0"));
    assert!(text.contains(".word 0x8"));
  }
}
