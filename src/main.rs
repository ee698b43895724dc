/// axiom CLI
///
/// Runs a script through `Context::eval` and prints its completion value,
/// or renders a compile-time diagnostic / thrown exception on failure.
use axiom::conf::EngineConfig;
use axiom::runtime::EvalError;
use axiom::Context;
use clap::Parser as ClapParser;
use miette::Result;
use std::path::PathBuf;

#[derive(ClapParser)]
#[command(name = "axiom", version = "0.1.0", about = "Run a JavaScript-like script")]
struct Cli {
    /// Script to execute
    path: PathBuf,

    /// Enable verbose engine tracing (bytecode dispatch, GC cycles)
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let source = std::fs::read_to_string(&cli.path)
        .map_err(|e| miette::miette!("cannot read '{}': {}", cli.path.display(), e))?;

    let config = EngineConfig::default().with_debug(cli.debug);
    let mut ctx = Context::new(config);

    let source_name = cli.path.display().to_string();
    match ctx.eval(&source) {
        Ok(value) => {
            let rendered = ctx.stringify(&value);
            println!("{}", rendered);
            Ok(())
        }
        Err(err @ EvalError::Compile(_)) => match err.to_diagnostic(&source_name, &source) {
            Some(d) => Err(miette::miette!("{}", d.render())),
            None => unreachable!("EvalError::Compile always renders a diagnostic"),
        },
        Err(EvalError::Thrown(v)) => {
            let rendered = ctx.stringify(&v);
            Err(miette::miette!("uncaught exception: {}", rendered))
        }
        Err(EvalError::Runtime(e)) => Err(miette::miette!("{}", e)),
    }
}
