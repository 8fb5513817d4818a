// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Core data model: diagnostics, expressions, instruction tables, and the
//! object-module representation with its binary codec.

pub mod diagnostics;
pub mod expr;
pub mod instruction_set;
pub mod object;
pub mod objfile;

use std::path::PathBuf;

/// Toolchain configuration, constructed once by the caller and passed
/// explicitly into the assembler and linker entry points.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Only symbols declared `.export` are visible to other objects.
    pub explicit_export: bool,
    /// Undefined symbol references are errors unless declared `.import`.
    pub explicit_import: bool,
    /// Place merged areas on aligned bases instead of packing them.
    pub automatic_relocation: bool,
    /// Produce a further-linkable object instead of a final image.
    pub merge_only: bool,
    /// Escalate value truncation during the link patch pass to an error.
    pub overflow_errors: bool,
    /// Ordered include search path; first match wins.
    pub include_paths: Vec<PathBuf>,
}
