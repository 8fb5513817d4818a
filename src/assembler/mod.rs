// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! The assembler core: drives one compilation unit through its source
//! lines and produces a relocatable [`Object`] plus diagnostics.
//!
//! Each line is classified as label / directive / instruction. Instruction
//! operands are parsed into tagged shapes and matched against the loaded
//! instruction table in file order; the first structural match wins.
//! Operand expressions that cannot be evaluated yet become zero-filled
//! slots with a recorded [`LateImmediate`], patched later by the linker.
//! Assembly continues past recoverable errors to surface as many
//! diagnostics as possible in one run.

mod directives;

use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::core::diagnostics::{Diagnostic, Diagnostics, ErrorKind, FatalError, WarningKind};
use crate::core::expr::{self, Eval, Expr};
use crate::core::instruction_set::{InstructionSet, Operand, Slot, TemplateItem};
use crate::core::object::{Area, Endian, LateImmediate, Object, Symbol};
use crate::core::Settings;

/// Area used before any `.area` directive appears.
pub const DEFAULT_AREA: &str = "code";

const MAX_INCLUDE_DEPTH: usize = 64;

/// Assemble one compilation unit.
///
/// Recoverable problems are appended to `diags`; the returned object is
/// complete apart from its pending late immediates. `Err` is reserved for
/// the unrecoverable tier (an include that cannot be found or read).
#[instrument(skip_all, fields(file = %file_name))]
pub fn assemble(
    source: &str,
    file_name: &str,
    set: &InstructionSet,
    settings: &Settings,
    diags: &mut Diagnostics,
) -> Result<Object, FatalError> {
    let mut asm = Assembler::new(set, settings, diags, file_name);
    asm.run(source, file_name)?;
    let object = asm.finish();
    debug!(
        areas = object.areas.len(),
        pending = object.late_immediate_count(),
        "assembled unit"
    );
    Ok(object)
}

/// A recorded symbol reference from a deferred expression, kept for the
/// end-of-unit import pass.
struct SymbolRef {
    name: String,
    area: usize,
    file: String,
    line: u32,
    column: Option<usize>,
    source: String,
}

/// Location of an `.export`/`.import` declaration.
struct Decl {
    name: String,
    file: String,
    line: u32,
    source: String,
}

pub(crate) struct Assembler<'a> {
    set: &'a InstructionSet,
    settings: &'a Settings,
    diags: &'a mut Diagnostics,
    object: Object,
    current_area: usize,
    /// name -> (area index, symbol index) for every defined or imported symbol.
    symbols: HashMap<String, (usize, usize)>,
    exports: Vec<Decl>,
    imports: Vec<Decl>,
    refs: Vec<SymbolRef>,
    include_depth: usize,
    file: String,
    line: u32,
    source_line: String,
}

impl<'a> Assembler<'a> {
    fn new(
        set: &'a InstructionSet,
        settings: &'a Settings,
        diags: &'a mut Diagnostics,
        file_name: &str,
    ) -> Self {
        let mut object = Object::new(file_name, &set.arch);
        let current_area = object.area_index(DEFAULT_AREA);
        Self {
            set,
            settings,
            diags,
            object,
            current_area,
            symbols: HashMap::new(),
            exports: Vec::new(),
            imports: Vec::new(),
            refs: Vec::new(),
            include_depth: 0,
            file: file_name.to_string(),
            line: 0,
            source_line: String::new(),
        }
    }

    pub(crate) fn run(&mut self, source: &str, file_name: &str) -> Result<(), FatalError> {
        let saved_file = std::mem::replace(&mut self.file, file_name.to_string());
        let saved_line = self.line;

        for (idx, raw) in source.lines().enumerate() {
            let raw = raw.strip_suffix('\r').unwrap_or(raw);
            self.line = idx as u32 + 1;
            self.source_line = raw.to_string();
            self.process_line(raw)?;
        }

        self.file = saved_file;
        self.line = saved_line;
        Ok(())
    }

    fn process_line(&mut self, raw: &str) -> Result<(), FatalError> {
        let line = strip_comment(raw).trim();
        let line = match self.take_label(line) {
            Some(rest) => rest.trim(),
            None => return Ok(()),
        };
        if line.is_empty() {
            return Ok(());
        }

        let (word, args) = split_first_word(line);
        if let Some(name) = word.strip_prefix('.') {
            return self.directive(raw, &name.to_ascii_lowercase(), args);
        }
        if is_directive_word(word) {
            return self.directive(raw, &word.to_ascii_lowercase(), args);
        }

        // `name equ expr`, `name .equ expr`, `name = expr`
        let (next, rest) = split_first_word(args);
        if matches!(next.to_ascii_lowercase().as_str(), "equ" | ".equ") && is_ident(word) {
            self.equ(raw, word, rest);
            return Ok(());
        }
        if let Some(idx) = find_unquoted(line, '=') {
            let (lhs, rhs) = (line[..idx].trim(), line[idx + 1..].trim());
            if is_ident(lhs) {
                self.equ(raw, lhs, rhs);
                return Ok(());
            }
        }

        self.instruction(raw, word, args);
        Ok(())
    }

    /// Strip a leading `label:` and resolve it immediately to the current
    /// (area, offset) pair. Returns the remainder, or `None` for an empty
    /// line.
    fn take_label<'l>(&mut self, line: &'l str) -> Option<&'l str> {
        if line.is_empty() {
            return None;
        }
        let ident_len = line
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'.')
            .count();
        if ident_len == 0 || line.as_bytes().get(ident_len) != Some(&b':') {
            return Some(line);
        }
        let name = &line[..ident_len];
        if is_ident(name) {
            let offset = self.area().len();
            self.define(Symbol::label(name, offset));
        } else {
            self.error(
                ErrorKind::Syntax,
                format!("Invalid label name: {name}"),
                Some(1),
            );
        }
        Some(&line[ident_len + 1..])
    }

    fn instruction(&mut self, raw: &str, mnemonic: &str, operand_text: &str) {
        let mut operands = Vec::new();
        for fragment in split_operands(operand_text) {
            match self.classify_operand(raw, fragment) {
                Some(op) => operands.push(op),
                None => return,
            }
        }

        let set = self.set;
        if !set.has_mnemonic(mnemonic) {
            self.error(
                ErrorKind::UnknownMnemonic,
                format!("Unknown mnemonic: {mnemonic}"),
                column_in(raw, mnemonic),
            );
            return;
        }
        let pattern = match set.find_match(mnemonic, &operands) {
            Some(pattern) => pattern,
            None => {
                self.error(
                    ErrorKind::OperandMismatch,
                    format!("Operands do not match any form of {mnemonic}"),
                    column_in(raw, mnemonic),
                );
                return;
            }
        };

        let mut exprs = operands.iter().filter_map(Operand::expr).cloned();
        for item in &pattern.template {
            match item {
                TemplateItem::Byte(byte) => self.area_mut().emit_byte(*byte),
                TemplateItem::Slot(slot) => {
                    let expr = exprs.next().expect("loader enforces slot counts");
                    self.emit_slot(expr, *slot, None);
                }
            }
        }
    }

    /// Classify one operand fragment for matching. Registers and conditions
    /// are recognized from the loaded table's vocabulary; anything else is
    /// an expression. Pushes a diagnostic and returns `None` on bad syntax.
    fn classify_operand(&mut self, raw: &str, fragment: &str) -> Option<Operand> {
        let text = fragment.trim();
        if text.is_empty() {
            self.error(ErrorKind::Syntax, "Empty operand".to_string(), None);
            return None;
        }

        if let Some(inner) = indirect_body(text) {
            let inner = inner.trim();
            if self.set.is_register(inner) {
                return Some(Operand::IndirectRegister(inner.to_ascii_lowercase()));
            }
            return self
                .parse_operand_expr(raw, inner)
                .map(Operand::IndirectImmediate);
        }

        if is_ident(text) {
            if self.set.is_register(text) {
                return Some(Operand::Register(text.to_ascii_lowercase()));
            }
            if self.set.is_condition(text) {
                return Some(Operand::Condition(text.to_ascii_lowercase()));
            }
        }
        self.parse_operand_expr(raw, text).map(Operand::Immediate)
    }

    pub(crate) fn parse_operand_expr(&mut self, raw: &str, text: &str) -> Option<Expr> {
        match expr::parse(text) {
            Ok(expr) => Some(expr),
            Err(err) => {
                let column = column_in(raw, text).map(|base| base + err.column - 1);
                self.error(ErrorKind::Syntax, err.message, column);
                None
            }
        }
    }

    /// Encode one immediate slot. Resolved values are written now (with a
    /// truncation warning when they do not fit); deferred values reserve a
    /// zero-filled slot and record a late immediate. The write offset
    /// advances by the slot width either way.
    fn emit_slot(&mut self, expr: Expr, slot: Slot, column: Option<usize>) {
        let outcome = {
            let me = &*self;
            expr::evaluate(&expr, &|name| me.lookup_value(name))
        };
        match outcome {
            Ok(Eval::Resolved(value)) => {
                if !fits_slot(value, slot) {
                    self.warning(
                        WarningKind::ValueTruncated,
                        format!(
                            "Value {value} truncated to {} byte(s)",
                            slot.width
                        ),
                        column,
                    );
                }
                let bytes = encode_slot(value, slot);
                self.area_mut().emit(&bytes);
            }
            Ok(Eval::Deferred) => {
                self.record_refs(&expr, column);
                let area = self.current_area;
                let offset = self.object.areas[area].len();
                self.object.areas[area].emit_fill(slot.width as u32, 0);
                self.object.areas[area].add_late_immediate(LateImmediate {
                    offset,
                    width: slot.width,
                    endian: slot.endian,
                    signed: slot.signed,
                    expr,
                });
            }
            Err(err) => {
                self.error(ErrorKind::Syntax, err.message, column);
                // Keep the layout stable for later lines.
                self.area_mut().emit_fill(slot.width as u32, 0);
            }
        }
    }

    fn record_refs(&mut self, expr: &Expr, column: Option<usize>) {
        for name in expr.referenced_symbols() {
            self.refs.push(SymbolRef {
                name,
                area: self.current_area,
                file: self.file.clone(),
                line: self.line,
                column,
                source: self.source_line.clone(),
            });
        }
    }

    /// Define a symbol in the current area. Duplicate definitions are a
    /// hard error; the first definition stands.
    fn define(&mut self, symbol: Symbol) {
        if self.symbols.contains_key(&symbol.name) {
            self.error(
                ErrorKind::DuplicateSymbol,
                format!("Duplicate symbol definition: {}", symbol.name),
                None,
            );
            return;
        }
        let area = self.current_area;
        let index = self.object.areas[area].symbols.len();
        self.symbols.insert(symbol.name.clone(), (area, index));
        self.object.areas[area].symbols.push(symbol);
    }

    fn lookup_value(&self, name: &str) -> Option<i64> {
        let (area, index) = *self.symbols.get(name)?;
        self.object.areas[area].symbols[index].value
    }

    fn area(&self) -> &Area {
        &self.object.areas[self.current_area]
    }

    fn area_mut(&mut self) -> &mut Area {
        &mut self.object.areas[self.current_area]
    }

    fn error(&mut self, kind: ErrorKind, message: String, column: Option<usize>) {
        let diag = Diagnostic::error(kind, message)
            .with_location(&self.file, self.line)
            .with_column(column)
            .with_source(&self.source_line);
        self.diags.push(diag);
    }

    fn warning(&mut self, kind: WarningKind, message: String, column: Option<usize>) {
        let diag = Diagnostic::warning(kind, message)
            .with_location(&self.file, self.line)
            .with_column(column)
            .with_source(&self.source_line);
        self.diags.push(diag);
    }

    /// End-of-unit bookkeeping: apply export declarations, settle every
    /// name referenced by a deferred expression, and flag unused imports.
    fn finish(mut self) -> Object {
        let export_decls = std::mem::take(&mut self.exports);
        for decl in &export_decls {
            match self.symbols.get(&decl.name).copied() {
                Some((area, index)) => {
                    let symbol = &mut self.object.areas[area].symbols[index];
                    if symbol.imported {
                        self.diags.push(
                            Diagnostic::error(
                                ErrorKind::Syntax,
                                format!("Cannot export imported symbol: {}", decl.name),
                            )
                            .with_location(&decl.file, decl.line)
                            .with_source(&decl.source),
                        );
                    } else {
                        symbol.exported = true;
                    }
                }
                None => {
                    self.diags.push(
                        Diagnostic::error(
                            ErrorKind::UnresolvedSymbol,
                            format!("Exported symbol is not defined: {}", decl.name),
                        )
                        .with_location(&decl.file, decl.line)
                        .with_source(&decl.source),
                    );
                }
            }
        }
        if !self.settings.explicit_export {
            for area in &mut self.object.areas {
                for symbol in &mut area.symbols {
                    if !symbol.imported {
                        symbol.exported = true;
                    }
                }
            }
        }

        // References that never resolved locally become imports, or errors
        // under the explicit-import policy.
        let refs = std::mem::take(&mut self.refs);
        let mut settled: Vec<String> = Vec::new();
        for reference in &refs {
            if self.symbols.contains_key(&reference.name) {
                continue;
            }
            if settled.iter().any(|n| n == &reference.name) {
                continue;
            }
            settled.push(reference.name.clone());
            if self.settings.explicit_import {
                self.diags.push(
                    Diagnostic::error(
                        ErrorKind::UnresolvedSymbol,
                        format!("Undefined symbol: {}", reference.name),
                    )
                    .with_location(&reference.file, reference.line)
                    .with_column(reference.column)
                    .with_source(&reference.source),
                );
            } else {
                self.diags.push(
                    Diagnostic::warning(
                        WarningKind::ImplicitImport,
                        format!("Undefined symbol '{}' treated as import", reference.name),
                    )
                    .with_location(&reference.file, reference.line)
                    .with_column(reference.column)
                    .with_source(&reference.source),
                );
                let area = reference.area;
                let index = self.object.areas[area].symbols.len();
                self.symbols
                    .insert(reference.name.clone(), (area, index));
                self.object.areas[area]
                    .symbols
                    .push(Symbol::import(&reference.name));
            }
        }

        let import_decls = std::mem::take(&mut self.imports);
        for decl in &import_decls {
            if !refs.iter().any(|r| r.name == decl.name) {
                self.diags.push(
                    Diagnostic::warning(
                        WarningKind::UnusedSymbol,
                        format!("Imported symbol is never referenced: {}", decl.name),
                    )
                    .with_location(&decl.file, decl.line)
                    .with_source(&decl.source),
                );
            }
        }

        self.object
    }
}

/// Range check for a value against a slot's width and signedness. Negative
/// values down to the signed minimum are accepted for unsigned slots, the
/// usual assembler convenience. The linker's patch pass applies the same
/// rule.
pub(crate) fn fits_slot(value: i64, slot: Slot) -> bool {
    let bits = slot.width as u32 * 8;
    if bits >= 64 {
        return true;
    }
    let min = -(1i128 << (bits - 1));
    let max = if slot.signed {
        (1i128 << (bits - 1)) - 1
    } else {
        (1i128 << bits) - 1
    };
    (min..=max).contains(&(value as i128))
}

/// Encode the low-order bytes of a value at the slot's width/endianness.
pub(crate) fn encode_slot(value: i64, slot: Slot) -> Vec<u8> {
    let width = slot.width as usize;
    let raw = (value as u64).to_le_bytes();
    let mut bytes: Vec<u8> = raw[..width].to_vec();
    if slot.endian == Endian::Big {
        bytes.reverse();
    }
    bytes
}

/// Truncate at the first `;` that is not inside a string literal.
fn strip_comment(line: &str) -> &str {
    match find_unquoted(line, ';') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Find a byte outside any double-quoted string literal.
fn find_unquoted(line: &str, needle: char) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == needle && !in_string => return Some(idx),
            _ => {}
        }
    }
    None
}

/// Split on commas at paren depth zero, outside string literals.
fn split_operands(text: &str) -> Vec<&str> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0usize;
    for (idx, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => depth = depth.saturating_sub(1),
            ',' if !in_string && depth == 0 => {
                parts.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// If the fragment is one parenthesized group, return its body.
/// `(hl)` and `(label + 1)` qualify; `(2 + 3) * 4` does not.
fn indirect_body(text: &str) -> Option<&str> {
    if !text.starts_with('(') || !text.ends_with(')') {
        return None;
    }
    let mut depth = 0usize;
    for (idx, ch) in text.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return (idx == text.len() - 1).then(|| &text[1..idx]);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_first_word(text: &str) -> (&str, &str) {
    let text = text.trim();
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (text, ""),
    }
}

fn is_ident(text: &str) -> bool {
    let mut bytes = text.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' || b == b'.' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
}

fn is_directive_word(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "area"
            | "org"
            | "equ"
            | "export"
            | "import"
            | "include"
            | "db"
            | "byte"
            | "dw"
            | "word"
            | "ds"
            | "block"
            | "ascii"
            | "asciz"
            | "asciiz"
    )
}

/// 1-based column of `fragment` within `line`, when `fragment` is a
/// subslice of it.
fn column_in(line: &str, fragment: &str) -> Option<usize> {
    let line_start = line.as_ptr() as usize;
    let frag_start = fragment.as_ptr() as usize;
    let line_end = line_start + line.len();
    let frag_end = frag_start + fragment.len();
    if frag_start >= line_start && frag_end <= line_end {
        Some(frag_start - line_start + 1)
    } else {
        None
    }
}
