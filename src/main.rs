use clap::Parser;
use oncoseg::SegResult;
use oncoseg::cli::{Cli, Command, ShutdownController, modes_listing, tools_report};
use oncoseg::segmenter::FslFast;

fn main() {
    oncoseg::logging::init();

    if let Err(e) = ShutdownController::install(None) {
        tracing::warn!("failed to install Ctrl+C handler: {e}");
    }

    if let Err(error) = run() {
        if ShutdownController::is_shutting_down() {
            eprintln!("interrupted");
            std::process::exit(ShutdownController::signal_exit_code());
        }
        eprintln!("error: {error}");
        std::process::exit(1);
    }

    if ShutdownController::is_shutting_down() {
        std::process::exit(ShutdownController::signal_exit_code());
    }
}

fn run() -> SegResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let pipeline = args.to_pipeline_run()?;
            let report = pipeline.run()?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for compartment in &report.compartments {
                    println!("{}\t{}", compartment.name, compartment.path.display());
                }
                if let Some(cleanup) = &report.cleanup
                    && !cleanup.failures.is_empty()
                {
                    eprintln!(
                        "warning: {} interim file(s) could not be removed",
                        cleanup.failures.len()
                    );
                }
            }
            Ok(())
        }
        Command::Modes => {
            for line in modes_listing() {
                println!("{line}");
            }
            Ok(())
        }
        Command::CheckTools => {
            let report = tools_report(&FslFast::from_env());
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
