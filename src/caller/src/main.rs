//! This crate defines the command line interface of the slicer.
//! General documentation about the slicer is contained in the [`slicer_lib`] crate.

use anyhow::Context;
use anyhow::Error;
use clap::error::ErrorKind;
use clap::Parser;
use slicer_lib::analysis::pointer_analysis::Config;
use slicer_lib::frontend::slice_program;
use slicer_lib::intermediate_representation::Program;
use slicer_lib::utils::log::{print_all_messages, LogLevel, LogMessage};
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(version, about)]
/// Slice a module with respect to a slicing criterion.
/// The sliced module is written next to the input with the suffix `.sliced`.
struct CmdlineArgs {
    /// The slicing criterion: the name of a called procedure.
    /// The special name `ret` slices with respect to the return
    /// of the entry procedure.
    #[arg(short = 'c', long = "crit", visible_alias = "slice")]
    criterion: String,

    /// The path to the module to slice, in JSON form.
    #[arg(value_parser = check_file_existence)]
    module: String,

    /// Procedures that are never pruned, whatever the slice contains.
    /// Can be given multiple times.
    #[arg(long)]
    untouched: Vec<String>,

    /// The saturation ceiling for the field-sensitivity of the pointer analysis.
    #[arg(long, default_value_t = 64)]
    max_offset: u64,

    /// Track invalidated pointers to the locals of returned-from procedures.
    #[arg(long)]
    invalidate_nodes: bool,

    /// Do not print log messages.
    #[arg(long, short)]
    quiet: bool,

    /// Print additional debug log messages.
    #[arg(long, short, conflicts_with("quiet"))]
    verbose: bool,
}

fn main() {
    let cmdline_args = match CmdlineArgs::try_parse() {
        Ok(args) => args,
        Err(error) => {
            let code = match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = error.print();
            std::process::exit(code);
        }
    };
    if let Err(error) = run_slicer(&cmdline_args) {
        eprintln!("ERROR: {error}");
        std::process::exit(1);
    }
}

/// Return `Ok(file_path)` only if `file_path` points to an existing file.
fn check_file_existence(file_path: &str) -> Result<String, String> {
    if std::fs::metadata(file_path)
        .map_err(|err| format!("{err}"))?
        .is_file()
    {
        Ok(file_path.to_string())
    } else {
        Err(format!("{file_path} is not a file."))
    }
}

/// The path of the output module: the input path with the suffix `.sliced`.
fn sliced_path(module: &str) -> PathBuf {
    Path::new(module).with_extension("sliced")
}

/// Parse the module, slice it and write the result.
fn run_slicer(args: &CmdlineArgs) -> Result<(), Error> {
    let file = std::io::BufReader::new(
        std::fs::File::open(&args.module).context("Opening the module failed")?,
    );
    let program: Program =
        serde_json::from_reader(file).context("Parsing of the module failed")?;

    let config = Config {
        max_offset: args.max_offset,
        invalidate_nodes: args.invalidate_nodes,
    };
    let results = slice_program(&program, &args.criterion, config, &args.untouched)?;

    let out_path = sliced_path(&args.module);
    let output =
        serde_json::to_string_pretty(&results.program).context("Serializing the slice failed")?;
    std::fs::write(&out_path, output).context("Writing the sliced module failed")?;

    if !args.quiet {
        let mut logs = results.logs;
        if !args.verbose {
            logs.retain(|log| log.level != LogLevel::Debug);
        }
        logs.push(LogMessage::new_info(format!(
            "Saving sliced module to: {}",
            out_path.display()
        )));
        print_all_messages(logs, results.warnings);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliced_path_replaces_the_extension() {
        assert_eq!(
            sliced_path("dir/module.json"),
            PathBuf::from("dir/module.sliced")
        );
        assert_eq!(sliced_path("module"), PathBuf::from("module.sliced"));
    }
}
