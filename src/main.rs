use std::io;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use rsprovision::cli::{self, Commands};
use rsprovision::executor::RealCommandExecutor;
use tracing::error;

fn run(args: cli::Cli) -> Result<()> {
    match &args.command {
        Commands::Apply(opts) => {
            rsprovision::init_logging(opts.log_level)?;
            let executor = Arc::new(RealCommandExecutor {
                dry_run: opts.dry_run,
            });
            rsprovision::run_apply(opts, executor)?;
        }
        Commands::Validate(opts) => {
            rsprovision::init_logging(opts.log_level)?;
            rsprovision::run_validate(opts)?;
        }
        Commands::List(opts) => {
            rsprovision::init_logging(opts.log_level)?;
            rsprovision::run_list(opts, &mut io::stdout().lock())?;
        }
        Commands::Completions(opts) => {
            rsprovision::generate_completions(opts.shell, &mut io::stdout().lock());
        }
    }
    Ok(())
}

fn main() {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(2);
        }
    };

    if let Err(e) = run(args) {
        error!("{:#}", e);
        process::exit(1);
    }
}
