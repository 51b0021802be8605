#![deny(clippy::pedantic)]
#![deny(clippy::cargo)]

use std::thread;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clio::Input;
use dexopt_analysis::driver::{analyze_program, AnalysisConfig};
use dexopt_ir::program::Program;
use itertools::Itertools;
use log::debug;
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Args)]
struct AnalyzeArgs {
    /// Program dump to analyse (JSON)
    program: Input,
    /// Common parent class; instances of its proper descendants are tracked
    #[arg(long)]
    root: String,
    /// Restrict the run to methods with this name
    #[arg(long)]
    method: Option<String>,
    /// `Owner::name` call target treated as non-leaking; may be repeated
    #[arg(long = "safe-escape")]
    safe_escapes: Vec<String>,
    /// Worker threads; defaults to the available parallelism
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run the instance-tracking analysis and print the resulting table
    Analyze(AnalyzeArgs),
    /// Print basic statistics about a program dump
    Inspect { program: Input },
}

fn load_program(input: Input) -> Result<Program> {
    let program: Program = serde_json::from_reader(input)?;
    program.validate()?;
    debug!(
        "loaded program: {} class(es), {} method(s)",
        program.classes.len(),
        program.methods.len()
    );
    Ok(program)
}

fn analyze(args: AnalyzeArgs) -> Result<()> {
    let program = load_program(args.program)?;
    let num_threads = args
        .threads
        .unwrap_or_else(|| thread::available_parallelism().map_or(1, usize::from));
    let config = AnalysisConfig {
        root: args.root,
        safe_escapes: args.safe_escapes,
        method_filter: args.method,
        num_threads,
    };
    let index = analyze_program(&program, &config)?;
    print!("{}", index.debug_show_table(&program));
    for (ty, inits) in index.type_to_inits() {
        println!(
            "{}: {} construction record(s)",
            program.class(*ty).name,
            inits.count
        );
    }
    Ok(())
}

fn inspect(input: Input) -> Result<()> {
    let program = load_program(input)?;
    let with_code = program.methods.iter().filter(|m| m.code.is_some()).count();
    let blocks: usize = program
        .methods
        .iter()
        .filter_map(|m| m.code.as_ref())
        .map(|cfg| cfg.blocks.len())
        .sum();
    let insns: usize = program
        .methods
        .iter()
        .filter_map(|m| m.code.as_ref())
        .map(|cfg| cfg.insns.len())
        .sum();
    println!(
        "{} class(es), {} method(s) ({with_code} with code), {blocks} block(s), {insns} instruction(s)",
        program.classes.len(),
        program.methods.len(),
    );
    let roots = program
        .classes
        .iter()
        .filter(|c| c.superclass.is_none())
        .map(|c| c.name.as_str())
        .sorted()
        .join(", ");
    println!("hierarchy roots: {roots}");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();
    match cli.command {
        Command::Analyze(args) => analyze(args),
        Command::Inspect { program } => inspect(program),
    }
}
