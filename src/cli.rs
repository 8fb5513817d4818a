// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Command-line interface parsing and settings construction.

use std::env;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::core::Settings;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable appended to the include search path, after any
/// `-I` directories.
pub const INCLUDE_PATH_VAR: &str = "RELAS_PATH";

const LONG_ABOUT: &str = "\
Table-driven relocatable assembler and linker for Z80-family targets.

By default every input is assembled and the results are linked into a flat
binary image. Use -O/--object to stop after assembly and write relocatable
object modules, or -l/--link to treat the inputs as object modules and only
link them. `-` names standard input (as a source) or standard output (as
the destination).";

#[derive(Parser, Debug)]
#[command(
    name = "relas",
    version = VERSION,
    about = "Table-driven relocatable assembler and linker for Z80-family targets",
    long_about = LONG_ABOUT
)]
pub struct Cli {
    /// Input files: assembly sources, or object modules with --link.
    #[arg(value_name = "FILE", required = true)]
    pub inputs: Vec<String>,

    #[arg(
        short = 'o',
        long = "output",
        value_name = "FILE",
        long_help = "Output destination. Defaults to the first input with its \
                     extension replaced (.bin for images, .o for objects)."
    )]
    pub output: Option<String>,

    #[arg(
        short = 'O',
        long = "object",
        action = ArgAction::SetTrue,
        conflicts_with = "link_only",
        long_help = "Assemble only: write one relocatable object module per input."
    )]
    pub object_only: bool,

    #[arg(
        short = 'l',
        long = "link",
        action = ArgAction::SetTrue,
        long_help = "Link only: inputs are serialized object modules, not sources."
    )]
    pub link_only: bool,

    /// Target architecture: a table name resolved against --table-dir, or a
    /// literal path to a table file.
    #[arg(short = 'a', long = "arch", default_value = "z80")]
    pub arch: String,

    /// Directory searched for `<arch>.tab` instruction set tables.
    #[arg(long = "table-dir", value_name = "DIR", default_value = "tables")]
    pub table_dir: PathBuf,

    /// Add a directory to the include search path (ordered, first match wins).
    #[arg(short = 'I', long = "include", value_name = "DIR")]
    pub include: Vec<PathBuf>,

    #[arg(
        short = 'e',
        long = "export-explicit",
        action = ArgAction::SetTrue,
        long_help = "Only symbols declared with .export are visible to other \
                     objects. Without this flag every defined symbol is exported."
    )]
    pub explicit_export: bool,

    #[arg(
        short = 'n',
        long = "explicit-import",
        action = ArgAction::SetTrue,
        long_help = "Undefined symbol references are errors unless declared with \
                     .import. Without this flag they become implicit imports \
                     (with a warning)."
    )]
    pub explicit_import: bool,

    #[arg(
        short = 'r',
        long = "auto-relocate",
        action = ArgAction::SetTrue,
        long_help = "Place merged areas on 16-byte-aligned bases instead of \
                     packing them back to back."
    )]
    pub automatic_relocation: bool,

    #[arg(
        short = 'm',
        long = "merge-only",
        action = ArgAction::SetTrue,
        long_help = "Merge areas without assigning base addresses and write a \
                     further-linkable object module instead of an image."
    )]
    pub merge_only: bool,

    /// Treat value truncation during the link patch pass as an error.
    #[arg(long = "strict-overflow", action = ArgAction::SetTrue)]
    pub overflow_errors: bool,

    /// Write a JSON symbol listing to FILE after assembly.
    #[arg(short = 's', long = "symbols", value_name = "FILE")]
    pub symbols: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Build the immutable settings value handed to the assembler and
    /// linker. The include path is: the current directory, then every `-I`
    /// in order, then the colon-separated RELAS_PATH entries.
    pub fn settings(&self) -> Settings {
        let mut include_paths = vec![PathBuf::from(".")];
        include_paths.extend(self.include.iter().cloned());
        if let Ok(extra) = env::var(INCLUDE_PATH_VAR) {
            include_paths.extend(
                extra
                    .split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from),
            );
        }
        Settings {
            explicit_export: self.explicit_export,
            explicit_import: self.explicit_import,
            automatic_relocation: self.automatic_relocation,
            merge_only: self.merge_only,
            overflow_errors: self.overflow_errors,
            include_paths,
        }
    }

    /// The destination for the final linked output: `-o`, or the first
    /// input with its extension replaced.
    pub fn output_destination(&self) -> String {
        if let Some(output) = &self.output {
            return output.clone();
        }
        let extension = if self.merge_only { "o" } else { "bin" };
        derive_output_name(&self.inputs[0], extension)
    }

    /// The destination for one object module in `--object` mode.
    pub fn object_destination(&self, input: &str) -> String {
        if let Some(output) = &self.output {
            return output.clone();
        }
        derive_output_name(input, "o")
    }
}

/// Swap an input's extension, `a/boot.asm` -> `a/boot.bin`. Standard
/// input maps to standard output.
fn derive_output_name(input: &str, extension: &str) -> String {
    if input == "-" {
        return "-".to_string();
    }
    let path = PathBuf::from(input);
    path.with_extension(extension).to_string_lossy().into_owned()
}
