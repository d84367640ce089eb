//! C-ABI boundary for embedding the compiler in non-Rust hosts.
//!
//! The host hands over a NUL-terminated expression, a null-sentinel array
//! of `{name, pointer}` records, and a writable 4-byte-aligned buffer. On
//! success the emitted words are stored sequentially into the buffer and
//! the word count comes back; on failure a negative code identifies the
//! error kind and the buffer contents must not be executed.

use crate::codegen::SymbolTable;
use crate::error::CompileError;
use std::ffi::{c_char, c_int, c_void, CStr};

/// One extern record. An array of these is terminated by a record whose
/// fields are both null; ingestion also stops early if either field is
/// null on its own.
#[repr(C)]
pub struct Symbol {
  pub name: *const c_char,
  pub pointer: *const c_void,
}

pub const ERR_MALFORMED: c_int = -1;
pub const ERR_NAME_NOT_FOUND: c_int = -2;
pub const ERR_CONSTANT_OVERFLOW: c_int = -3;
pub const ERR_INTERNAL: c_int = -4;
/// Null or non-UTF-8 input pointers, before compilation even starts.
pub const ERR_INVALID_INPUT: c_int = -5;

/// Compile `expression` against `externs` and write the emitted words to
/// `out_buffer`.
///
/// Returns the number of words written, or a negative error code. The
/// caller guarantees the buffer is large enough, and remains responsible
/// for page protection and instruction-cache maintenance.
///
/// # Safety
///
/// `expression` must point to a NUL-terminated string, `externs` must be
/// null or point to a properly terminated record array with NUL-terminated
/// names, and `out_buffer` must be 4-byte aligned with room for the whole
/// program.
#[no_mangle]
pub unsafe extern "C" fn jit_compile_expression_to_arm(
  expression: *const c_char,
  externs: *const Symbol,
  out_buffer: *mut u32,
) -> c_int {
  if expression.is_null() || out_buffer.is_null() {
    return ERR_INVALID_INPUT;
  }
  let Ok(expression) = CStr::from_ptr(expression).to_str() else {
    return ERR_INVALID_INPUT;
  };

  let mut symbols = SymbolTable::new();
  if !externs.is_null() {
    let mut current = externs;
    while !(*current).name.is_null() && !(*current).pointer.is_null() {
      let Ok(name) = CStr::from_ptr((*current).name).to_str() else {
        return ERR_INVALID_INPUT;
      };
      // Addresses are 32-bit on the only target the output runs on.
      symbols.insert(name, (*current).pointer as usize as u32);
      current = current.add(1);
    }
  }

  match crate::compile_expression(expression, &symbols) {
    Ok(words) => {
      for (index, word) in words.iter().enumerate() {
        out_buffer.add(index).write(*word);
      }
      words.len() as c_int
    }
    Err(err) => error_code(&err),
  }
}

fn error_code(err: &CompileError) -> c_int {
  match err {
    CompileError::Malformed { .. } => ERR_MALFORMED,
    CompileError::NameNotFound { .. } => ERR_NAME_NOT_FOUND,
    CompileError::ConstantOverflow { .. } => ERR_CONSTANT_OVERFLOW,
    CompileError::InternalConsistency { .. } => ERR_INTERNAL,
  }
}
