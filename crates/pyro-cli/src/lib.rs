//! pyro-cli — a thin embedding host around `pyro-core`/`pyro-compiler`/
//! `pyro-vm`/`pyro-stdlib`.
//!
//! This mirrors the teacher's `vitte-cli::run()` shape (parse args, build
//! the language's runtime pieces, report errors) but is deliberately not a
//! feature-complete CLI: no REPL, no bytecode cache/disassembler, no
//! `build`/`test` subcommands — running a single Pyro source file is the
//! whole job (see `SPEC_FULL.md` §1 Non-goals).

use std::io::Read as _;
use std::path::PathBuf;

use clap::Parser;
use pyro_compiler::Compiler;
use pyro_vm::Vm;

/// Runs a Pyro source file.
#[derive(Debug, Parser)]
#[command(name = "pyro", version, about = "Pyro language runtime")]
struct Cli {
    /// Path to the `.pyro` source file to run.
    script: PathBuf,

    /// Extra directory to search when resolving `import` statements.
    /// May be given more than once.
    #[arg(short = 'I', long = "import-root")]
    import_roots: Vec<PathBuf>,

    /// Arguments passed through to the script as `$args`.
    #[arg(last = true)]
    args: Vec<String>,
}

/// Parses CLI arguments, compiles, and runs the requested script.
/// Matches `vitte_cli::run()`'s signature and error-reporting contract: a
/// returned `Err` is printed by `main()` and turns into exit code 1.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut source = String::new();
    std::fs::File::open(&cli.script)
        .map_err(|e| anyhow::anyhow!("cannot open {}: {e}", cli.script.display()))?
        .read_to_string(&mut source)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", cli.script.display()))?;

    let mut vm = Vm::new();
    pyro_stdlib::install(&mut vm);

    for root in cli.import_roots {
        vm.append_import_root(root);
    }
    if let Some(parent) = cli.script.parent() {
        vm.append_import_root(parent.to_path_buf());
    }
    for arg in cli.args {
        vm.append_arg(arg);
    }

    let source_name = cli.script.display().to_string();
    let fn_obj = Compiler::compile(&source, &source_name, &mut vm.heap, &mut vm.strings).map_err(|e| anyhow::anyhow!("{e}"))?;

    match vm.run_script(fn_obj) {
        Ok(_) => {
            let code = vm.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("{e}")),
    }
}
