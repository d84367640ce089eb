use std::process;

use clap::Parser;
use log::LevelFilter;

use exprjit::SymbolTable;

#[derive(Parser, Debug)]
#[command(
  name = "exprjit",
  about = "Compile an integer arithmetic expression to A32 machine code"
)]
struct Args {
  /// Turn on verbose logging.
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  /// Output format: raw words or an assembly listing.
  #[arg(long, value_enum, default_value_t = Emit::Hex)]
  emit: Emit,

  /// Symbol definition `name=address` (decimal or 0x-prefixed), repeatable.
  #[arg(long = "sym", value_name = "NAME=ADDR")]
  symbols: Vec<String>,

  /// The expression to compile.
  expression: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Emit {
  Hex,
  Asm,
}

fn main() {
  let args = Args::parse();
  configure_logging(args.verbose);

  match run(&args) {
    Ok(output) => print!("{output}"),
    Err(err) => {
      eprintln!("{err}");
      process::exit(1);
    }
  }
}

fn run(args: &Args) -> Result<String, String> {
  let mut symbols = SymbolTable::new();
  for definition in &args.symbols {
    let (name, address) = parse_symbol(definition)?;
    symbols.insert(name, address);
  }

  match args.emit {
    Emit::Hex => {
      let words =
        exprjit::compile_expression(&args.expression, &symbols).map_err(|e| e.to_string())?;
      Ok(words.iter().map(|word| format!("{word:#010x}\n")).collect())
    }
    Emit::Asm => {
      exprjit::generate_listing(&args.expression, &symbols).map_err(|e| e.to_string())
    }
  }
}

fn parse_symbol(definition: &str) -> Result<(&str, u32), String> {
  let (name, address) = definition
    .split_once('=')
    .ok_or_else(|| format!("expected NAME=ADDR, got '{definition}'"))?;

  let parsed = match address.strip_prefix("0x").or_else(|| address.strip_prefix("0X")) {
    Some(hex) => u32::from_str_radix(hex, 16),
    None => address.parse::<u32>(),
  };

  parsed
    .map(|address| (name, address))
    .map_err(|_| format!("bad address in '{definition}'"))
}

fn configure_logging(verbosity: u8) {
  let level = match verbosity {
    0 => LevelFilter::Error,
    1 => LevelFilter::Warn,
    2 => LevelFilter::Info,
    3 => LevelFilter::Debug,
    _ => LevelFilter::Trace,
  };
  env_logger::Builder::new().filter_level(level).init();
}
