use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

const EXIT_SUCCESS: u8 = 0;
const EXIT_BAD_ARGS: u8 = 1;
const EXIT_ERROR: u8 = 2;

/// ksh2kson chart converter.
///
/// Converts a KSH chart to KSON and writes it to stdout.
#[derive(Parser)]
#[command(name = "ksh2kson", version)]
struct Args {
    /// Input .ksh file; reads stdin when omitted
    input: Option<PathBuf>,
}

fn main() -> ExitCode {
    simple_logger::init_with_level(log::Level::Warn).ok();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_BAD_ARGS);
        }
    };

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let mut chart = match &args.input {
        Some(path) => kson_chart::ksh::load_chart_from_path(path),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            kson_chart::ksh::load_chart(&buf)
        }
    };
    for warning in &chart.warnings {
        log::warn!("{warning}");
    }
    if let Some(error) = chart.error {
        eprintln!("Error: {error}");
        return Ok(ExitCode::from(EXIT_ERROR));
    }

    chart.editor.app_name = "ksh2kson".to_owned();
    chart.editor.app_version = env!("CARGO_PKG_VERSION").to_owned();

    if let Err(error) = kson_chart::kson::save_chart(io::stdout().lock(), &chart) {
        eprintln!("Error: {error}");
        return Ok(ExitCode::from(EXIT_ERROR));
    }

    Ok(ExitCode::from(EXIT_SUCCESS))
}
