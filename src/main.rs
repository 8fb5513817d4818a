// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// CLI entrypoint for relas.

use std::io::{IsTerminal, Read, Write};

use clap::Parser;
use tracing::Level;

use relas::assembler;
use relas::cli::Cli;
use relas::core::diagnostics::{Diagnostic, Diagnostics, ErrorKind, FatalError};
use relas::core::object::Object;
use relas::core::{instruction_set, objfile, Settings};
use relas::linker::{self, LinkOutput};
use relas::output;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("relas: {err}");
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .compact()
        .without_time()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<i32, FatalError> {
    if cli.object_only && cli.output.is_some() && cli.inputs.len() > 1 {
        return Err(FatalError::io(
            "Cannot use --output with multiple inputs in object mode",
        ));
    }

    let settings = cli.settings();
    let mut diags = Diagnostics::new();

    let objects = if cli.link_only {
        load_objects(cli, &mut diags)?
    } else {
        assemble_inputs(cli, &settings, &mut diags)?
    };

    let symbols_json = cli
        .symbols
        .as_ref()
        .map(|_| output::symbols_payload(&objects).to_string());

    if cli.object_only {
        if diags.error_count() == 0 {
            for (input, object) in cli.inputs.iter().zip(&objects) {
                write_output(&cli.object_destination(input), &objfile::serialize(object))?;
            }
        }
    } else {
        let linked = linker::link(objects, &settings, &mut diags);
        if diags.error_count() == 0 {
            let bytes = match linked {
                LinkOutput::Image(bytes) => bytes,
                LinkOutput::Object(object) => objfile::serialize(&object),
            };
            write_output(&cli.output_destination(), &bytes)?;
        }
    }

    if diags.error_count() == 0 {
        if let (Some(path), Some(json)) = (&cli.symbols, symbols_json) {
            std::fs::write(path, json).map_err(|err| {
                FatalError::io(format!("Unable to write '{}': {err}", path.display()))
            })?;
        }
    }

    report_diagnostics(&diags);
    Ok(diags.error_count().min(255) as i32)
}

fn assemble_inputs(
    cli: &Cli,
    settings: &Settings,
    diags: &mut Diagnostics,
) -> Result<Vec<Object>, FatalError> {
    let set = instruction_set::load_for_arch(&cli.arch, &cli.table_dir)?;
    let mut objects = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let source = read_source(input)?;
        objects.push(assembler::assemble(&source, input, &set, settings, diags)?);
    }
    Ok(objects)
}

fn load_objects(cli: &Cli, diags: &mut Diagnostics) -> Result<Vec<Object>, FatalError> {
    let mut objects = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let bytes = read_bytes(input)?;
        match objfile::deserialize(&bytes, input) {
            Ok(object) => objects.push(object),
            // A corrupt object is recoverable: skip it, keep diagnosing.
            Err(err) => diags.push(
                Diagnostic::error(ErrorKind::Format, err.message).with_location(input, 0),
            ),
        }
    }
    Ok(objects)
}

fn read_source(input: &str) -> Result<String, FatalError> {
    if input == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .map_err(|err| FatalError::io(format!("Unable to read standard input: {err}")))?;
        return Ok(source);
    }
    std::fs::read_to_string(input)
        .map_err(|err| FatalError::io(format!("Unable to open '{input}' for assembly: {err}")))
}

fn read_bytes(input: &str) -> Result<Vec<u8>, FatalError> {
    if input == "-" {
        let mut bytes = Vec::new();
        std::io::stdin()
            .read_to_end(&mut bytes)
            .map_err(|err| FatalError::io(format!("Unable to read standard input: {err}")))?;
        return Ok(bytes);
    }
    std::fs::read(input)
        .map_err(|err| FatalError::io(format!("Unable to open '{input}': {err}")))
}

fn write_output(destination: &str, bytes: &[u8]) -> Result<(), FatalError> {
    if destination == "-" {
        return std::io::stdout()
            .write_all(bytes)
            .map_err(|err| FatalError::io(format!("Unable to write standard output: {err}")));
    }
    std::fs::write(destination, bytes).map_err(|err| {
        FatalError::io(format!("Unable to open '{destination}' for output: {err}"))
    })
}

fn report_diagnostics(diags: &Diagnostics) {
    let use_color = std::io::stderr().is_terminal();
    for diag in diags {
        eprintln!("{}", diag.format_with_context(use_color));
    }
}
