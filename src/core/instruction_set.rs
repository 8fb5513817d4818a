// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Instruction set tables: the loader and the operand-shape matcher.
//!
//! An architecture is described by a line-oriented text table. Declaration
//! lines name the register and condition-code vocabularies; every other
//! significant line is one encoding pattern:
//!
//! ```text
//! arch z80
//! reg a b c d e h l bc de hl sp af ix iy
//! cond nz z nc c po pe p m
//! ld a,@      : 3e @1
//! ld bc,@     : 01 @2le
//! jp nz,@     : c2 @2le
//! ld a,(hl)   : 7e
//! ```
//!
//! The template on the right of `:` is a sequence of fixed opcode bytes
//! (two hex digits) and immediate slots (`@<width>[le|be][s]`). Each `@` or
//! `(@)` operand consumes one slot, left to right. File order is preserved
//! within a mnemonic's bucket and is the tie-break order when several
//! patterns match.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::diagnostics::FatalError;
use crate::core::expr::Expr;
use crate::core::object::Endian;

/// An immediate slot in an encoding template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub width: u8,
    pub endian: Endian,
    pub signed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateItem {
    Byte(u8),
    Slot(Slot),
}

/// The structural shape of one operand position in a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Register(String),
    Condition(String),
    IndirectRegister(String),
    Immediate,
    IndirectImmediate,
}

/// One mnemonic/operand-shapes/encoding triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub mnemonic: String,
    pub shapes: Vec<Shape>,
    pub template: Vec<TemplateItem>,
}

impl Pattern {
    /// Structural match of parsed operands against this pattern's shapes.
    pub fn matches(&self, operands: &[Operand]) -> bool {
        if operands.len() != self.shapes.len() {
            return false;
        }
        self.shapes
            .iter()
            .zip(operands)
            .all(|(shape, operand)| shape_matches(shape, operand))
    }

    /// Total encoded size in bytes.
    pub fn size(&self) -> u32 {
        self.template
            .iter()
            .map(|item| match item {
                TemplateItem::Byte(_) => 1,
                TemplateItem::Slot(slot) => slot.width as u32,
            })
            .sum()
    }
}

fn shape_matches(shape: &Shape, operand: &Operand) -> bool {
    match (shape, operand) {
        (Shape::Register(want), Operand::Register(have)) => want == have,
        (Shape::Condition(want), Operand::Condition(have)) => want == have,
        // `c` tokenizes as a register; a condition shape accepts it by name.
        (Shape::Condition(want), Operand::Register(have)) => want == have,
        (Shape::IndirectRegister(want), Operand::IndirectRegister(have)) => want == have,
        (Shape::Immediate, Operand::Immediate(_)) => true,
        (Shape::IndirectImmediate, Operand::IndirectImmediate(_)) => true,
        _ => false,
    }
}

/// A parsed instruction operand, classified for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Register(String),
    Condition(String),
    IndirectRegister(String),
    Immediate(Expr),
    IndirectImmediate(Expr),
}

impl Operand {
    /// The expression carried by an immediate-class operand.
    pub fn expr(&self) -> Option<&Expr> {
        match self {
            Self::Immediate(expr) | Self::IndirectImmediate(expr) => Some(expr),
            _ => None,
        }
    }
}

/// A loaded architecture description.
#[derive(Debug, Clone)]
pub struct InstructionSet {
    pub arch: String,
    registers: HashSet<String>,
    conditions: HashSet<String>,
    patterns: HashMap<String, Vec<Pattern>>,
}

impl InstructionSet {
    pub fn is_register(&self, name: &str) -> bool {
        self.registers.contains(&name.to_ascii_lowercase())
    }

    pub fn is_condition(&self, name: &str) -> bool {
        self.conditions.contains(&name.to_ascii_lowercase())
    }

    pub fn has_mnemonic(&self, mnemonic: &str) -> bool {
        self.patterns.contains_key(&mnemonic.to_ascii_lowercase())
    }

    /// Candidate patterns for a mnemonic, in table file order.
    pub fn candidates(&self, mnemonic: &str) -> &[Pattern] {
        self.patterns
            .get(&mnemonic.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First candidate whose shape list matches, in table order.
    pub fn find_match(&self, mnemonic: &str, operands: &[Operand]) -> Option<&Pattern> {
        self.candidates(mnemonic)
            .iter()
            .find(|pattern| pattern.matches(operands))
    }
}

/// A malformed table description, carrying the offending line.
#[derive(Debug, Clone)]
pub struct TableError {
    pub line_number: u32,
    pub line: String,
    pub message: String,
}

impl TableError {
    fn new(line_number: u32, line: &str, message: impl Into<String>) -> Self {
        Self {
            line_number,
            line: line.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}: {}", self.line_number, self.message, self.line)
    }
}

impl std::error::Error for TableError {}

/// Parse a table description into an indexed instruction set.
pub fn load(source: &str) -> Result<InstructionSet, TableError> {
    let mut arch: Option<String> = None;
    let mut registers: HashSet<String> = HashSet::new();
    let mut conditions: HashSet<String> = HashSet::new();
    let mut patterns: HashMap<String, Vec<Pattern>> = HashMap::new();

    for (idx, raw) in source.lines().enumerate() {
        let line_number = idx as u32 + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (line, ""),
        };

        match keyword {
            "arch" => {
                if rest.is_empty() {
                    return Err(TableError::new(line_number, raw, "Missing architecture name"));
                }
                if arch.is_some() {
                    return Err(TableError::new(line_number, raw, "Duplicate arch declaration"));
                }
                arch = Some(rest.to_string());
            }
            "reg" => {
                registers.extend(rest.split_whitespace().map(str::to_ascii_lowercase));
            }
            "cond" => {
                conditions.extend(rest.split_whitespace().map(str::to_ascii_lowercase));
            }
            _ => {
                let pattern = parse_pattern(line_number, raw, line, &registers, &conditions)?;
                patterns
                    .entry(pattern.mnemonic.clone())
                    .or_default()
                    .push(pattern);
            }
        }
    }

    let arch = arch.ok_or_else(|| TableError::new(0, "", "Missing arch declaration"))?;
    Ok(InstructionSet {
        arch,
        registers,
        conditions,
        patterns,
    })
}

fn parse_pattern(
    line_number: u32,
    raw: &str,
    line: &str,
    registers: &HashSet<String>,
    conditions: &HashSet<String>,
) -> Result<Pattern, TableError> {
    let (head, tail) = line
        .split_once(':')
        .ok_or_else(|| TableError::new(line_number, raw, "Missing ':' template separator"))?;

    let head = head.trim();
    let (mnemonic, operand_text) = match head.split_once(char::is_whitespace) {
        Some((m, rest)) => (m, rest.trim()),
        None => (head, ""),
    };
    if mnemonic.is_empty() {
        return Err(TableError::new(line_number, raw, "Missing mnemonic"));
    }

    let mut shapes = Vec::new();
    if !operand_text.is_empty() {
        for token in operand_text.split(',') {
            let token = token.trim().to_ascii_lowercase();
            if token.is_empty() {
                return Err(TableError::new(line_number, raw, "Empty operand shape"));
            }
            shapes.push(parse_shape(line_number, raw, &token, registers, conditions)?);
        }
    }

    let mut template = Vec::new();
    for token in tail.split_whitespace() {
        template.push(parse_template_item(line_number, raw, token)?);
    }
    if template.is_empty() {
        return Err(TableError::new(line_number, raw, "Empty encoding template"));
    }

    let immediates = shapes
        .iter()
        .filter(|s| matches!(s, Shape::Immediate | Shape::IndirectImmediate))
        .count();
    let slots = template
        .iter()
        .filter(|item| matches!(item, TemplateItem::Slot(_)))
        .count();
    if immediates != slots {
        return Err(TableError::new(
            line_number,
            raw,
            format!("{immediates} immediate operand(s) but {slots} template slot(s)"),
        ));
    }

    Ok(Pattern {
        mnemonic: mnemonic.to_ascii_lowercase(),
        shapes,
        template,
    })
}

fn parse_shape(
    line_number: u32,
    raw: &str,
    token: &str,
    registers: &HashSet<String>,
    conditions: &HashSet<String>,
) -> Result<Shape, TableError> {
    if token == "@" {
        return Ok(Shape::Immediate);
    }
    if token == "(@)" {
        return Ok(Shape::IndirectImmediate);
    }
    if let Some(inner) = token.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        let inner = inner.trim();
        if registers.contains(inner) {
            return Ok(Shape::IndirectRegister(inner.to_string()));
        }
        return Err(TableError::new(
            line_number,
            raw,
            format!("Unknown indirect operand shape: ({inner})"),
        ));
    }
    if registers.contains(token) {
        return Ok(Shape::Register(token.to_string()));
    }
    if conditions.contains(token) {
        return Ok(Shape::Condition(token.to_string()));
    }
    Err(TableError::new(
        line_number,
        raw,
        format!("Unknown operand shape: {token}"),
    ))
}

fn parse_template_item(line_number: u32, raw: &str, token: &str) -> Result<TemplateItem, TableError> {
    if let Some(marker) = token.strip_prefix('@') {
        return parse_slot(marker)
            .map(TemplateItem::Slot)
            .ok_or_else(|| {
                TableError::new(line_number, raw, format!("Unknown slot marker: @{marker}"))
            });
    }
    if token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit()) {
        let byte = u8::from_str_radix(token, 16).expect("hex digits checked");
        return Ok(TemplateItem::Byte(byte));
    }
    Err(TableError::new(
        line_number,
        raw,
        format!("Bad byte literal: {token}"),
    ))
}

fn parse_slot(marker: &str) -> Option<Slot> {
    let digits: String = marker.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let width: u8 = digits.parse().ok()?;
    if width == 0 || width > 8 {
        return None;
    }
    let mut rest = &marker[digits.len()..];
    let mut endian = Endian::Little;
    if let Some(tail) = rest.strip_prefix("le") {
        rest = tail;
    } else if let Some(tail) = rest.strip_prefix("be") {
        endian = Endian::Big;
        rest = tail;
    }
    let mut signed = false;
    if let Some(tail) = rest.strip_prefix('s') {
        signed = true;
        rest = tail;
    }
    if !rest.is_empty() {
        return None;
    }
    Some(Slot {
        width,
        endian,
        signed,
    })
}

/// Locate an architecture table: the name as a literal path first, then
/// `<search_dir>/<arch>.tab`.
pub fn find_table(arch: &str, search_dir: &Path) -> Result<PathBuf, FatalError> {
    let literal = PathBuf::from(arch);
    if literal.is_file() {
        return Ok(literal);
    }
    let fallback = search_dir.join(format!("{arch}.tab"));
    if fallback.is_file() {
        return Ok(fallback);
    }
    Err(FatalError::io(format!("Unknown architecture: {arch}")))
}

/// Load the instruction set for an architecture name. Any failure here is
/// unrecoverable for the run.
pub fn load_for_arch(arch: &str, search_dir: &Path) -> Result<InstructionSet, FatalError> {
    let path = find_table(arch, search_dir)?;
    let source = std::fs::read_to_string(&path).map_err(|err| {
        FatalError::io(format!(
            "Unable to read instruction set '{}': {err}",
            path.display()
        ))
    })?;
    load(&source).map_err(|err| {
        FatalError::io(format!(
            "Malformed instruction set '{}': {err}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr;

    const TABLE: &str = "\
# test table
arch z80
reg a b c hl sp
cond nz z nc c

nop         : 00
ld a,@      : 3e @1
ld hl,@     : 21 @2le
ld a,(hl)   : 7e
ld a,(@)    : 3a @2le
jp @        : c3 @2le
jp c,@      : da @2le
jp nz,@     : c2 @2le
djnz @      : 10 @1s
";

    fn set() -> InstructionSet {
        load(TABLE).unwrap()
    }

    fn imm(text: &str) -> Operand {
        Operand::Immediate(expr::parse(text).unwrap())
    }

    #[test]
    fn loads_arch_and_vocabulary() {
        let set = set();
        assert_eq!(set.arch, "z80");
        assert!(set.is_register("A"));
        assert!(set.is_register("hl"));
        assert!(!set.is_register("nz"));
        assert!(set.is_condition("nz"));
        assert!(set.is_condition("c"));
    }

    #[test]
    fn candidates_preserve_file_order() {
        let set = set();
        let ld = set.candidates("ld");
        assert_eq!(ld.len(), 4);
        assert_eq!(ld[0].shapes[1], Shape::Immediate);
        assert_eq!(ld[2].shapes[1], Shape::IndirectRegister("hl".into()));
        assert_eq!(ld[3].shapes[1], Shape::IndirectImmediate);
    }

    #[test]
    fn matching_picks_first_structural_fit() {
        let set = set();
        let pattern = set
            .find_match("ld", &[Operand::Register("a".into()), imm("0x2a")])
            .unwrap();
        assert_eq!(pattern.template[0], TemplateItem::Byte(0x3e));

        let pattern = set
            .find_match(
                "ld",
                &[
                    Operand::Register("a".into()),
                    Operand::IndirectRegister("hl".into()),
                ],
            )
            .unwrap();
        assert_eq!(pattern.template[0], TemplateItem::Byte(0x7e));

        let pattern = set
            .find_match(
                "ld",
                &[
                    Operand::Register("a".into()),
                    Operand::IndirectImmediate(expr::parse("label").unwrap()),
                ],
            )
            .unwrap();
        assert_eq!(pattern.template[0], TemplateItem::Byte(0x3a));
    }

    #[test]
    fn register_operand_matches_condition_shape() {
        // `c` classifies as a register; `jp c, addr` must still match the
        // condition pattern rather than fall through to a mismatch.
        let set = set();
        let pattern = set
            .find_match("jp", &[Operand::Register("c".into()), imm("8")])
            .unwrap();
        assert_eq!(pattern.template[0], TemplateItem::Byte(0xda));
    }

    #[test]
    fn no_match_is_distinguishable_from_no_mnemonic() {
        let set = set();
        assert!(!set.has_mnemonic("xyzzy"));
        assert!(set.has_mnemonic("jp"));
        assert!(set
            .find_match("jp", &[Operand::Register("hl".into())])
            .is_none());
    }

    #[test]
    fn slot_markers_parse_width_endian_signed() {
        let set = set();
        let jp = &set.candidates("jp")[0];
        assert_eq!(
            jp.template[1],
            TemplateItem::Slot(Slot {
                width: 2,
                endian: Endian::Little,
                signed: false
            })
        );
        let djnz = &set.candidates("djnz")[0];
        assert_eq!(
            djnz.template[1],
            TemplateItem::Slot(Slot {
                width: 1,
                endian: Endian::Little,
                signed: true
            })
        );
        assert_eq!(djnz.size(), 2);
    }

    #[test]
    fn duplicate_patterns_become_alternatives() {
        let source = "arch t\nreg a\nld a,@ : 3e @1\nld a,@ : 00 3e @1\n";
        let set = load(source).unwrap();
        assert_eq!(set.candidates("ld").len(), 2);
        // First entry wins on a tie.
        let pattern = set
            .find_match("ld", &[Operand::Register("a".into()), imm("1")])
            .unwrap();
        assert_eq!(pattern.template.len(), 2);
    }

    #[test]
    fn rejects_bad_byte_literal() {
        let err = load("arch t\nnop : zz\n").unwrap_err();
        assert!(err.message.contains("Bad byte literal"));
        assert_eq!(err.line_number, 2);
        assert!(err.line.contains("zz"));
    }

    #[test]
    fn rejects_unknown_slot_marker() {
        let err = load("arch t\nreg a\nld a,@ : 3e @x\n").unwrap_err();
        assert!(err.message.contains("Unknown slot marker"));
        let err = load("arch t\nreg a\nld a,@ : 3e @0\n").unwrap_err();
        assert!(err.message.contains("Unknown slot marker"));
        let err = load("arch t\nreg a\nld a,@ : 3e @2xx\n").unwrap_err();
        assert!(err.message.contains("Unknown slot marker"));
    }

    #[test]
    fn rejects_slot_count_mismatch() {
        let err = load("arch t\nreg a\nld a,@ : 3e\n").unwrap_err();
        assert!(err.message.contains("template slot"));
    }

    #[test]
    fn rejects_unknown_shape_and_missing_separator() {
        let err = load("arch t\nld q : 00\n").unwrap_err();
        assert!(err.message.contains("Unknown operand shape"));
        let err = load("arch t\nnop 00\n").unwrap_err();
        assert!(err.message.contains("Missing ':'"));
    }

    #[test]
    fn requires_arch_declaration() {
        let err = load("reg a\n").unwrap_err();
        assert!(err.message.contains("Missing arch"));
    }
}
