// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Directive handling: area switching, origin, symbol declaration,
//! export/import policy, file inclusion, and data emission.

use tracing::debug;

use super::{
    column_in, split_operands, Assembler, Decl, MAX_INCLUDE_DEPTH,
};
use crate::core::diagnostics::{ErrorKind, FatalError, WarningKind};
use crate::core::expr::{self, Eval};
use crate::core::instruction_set::Slot;
use crate::core::object::{Endian, Symbol};

impl<'a> Assembler<'a> {
    pub(super) fn directive(
        &mut self,
        raw: &str,
        name: &str,
        args: &str,
    ) -> Result<(), FatalError> {
        match name {
            "area" => self.dir_area(args),
            "org" => self.dir_org(raw, args),
            "equ" => self.error(
                ErrorKind::Syntax,
                "Expected a symbol name before equ".to_string(),
                None,
            ),
            "export" => self.dir_symbol_list(args, true),
            "import" => self.dir_symbol_list(args, false),
            "include" => return self.dir_include(args),
            "db" | "byte" => self.dir_data(raw, args, 1),
            "dw" | "word" => self.dir_data(raw, args, 2),
            "ds" | "block" => self.dir_block(raw, args),
            "ascii" => self.dir_ascii(raw, args, false),
            "asciz" | "asciiz" => self.dir_ascii(raw, args, true),
            _ => self.error(
                ErrorKind::Syntax,
                format!("Unknown directive: .{name}"),
                None,
            ),
        }
        Ok(())
    }

    /// `name equ expr` / `name = expr`. The expression must be evaluable
    /// now; constants never defer.
    pub(super) fn equ(&mut self, raw: &str, name: &str, args: &str) {
        if args.is_empty() {
            self.error(
                ErrorKind::Syntax,
                format!("Expected a constant expression for {name}"),
                None,
            );
            return;
        }
        let Some(value) = self.eval_resolved(raw, args) else {
            return;
        };
        let offset = self.area().len();
        self.define(Symbol::constant(name, value, offset));
    }

    fn dir_area(&mut self, args: &str) {
        let name = args.trim();
        if name.is_empty() || name.split_whitespace().count() != 1 {
            self.error(
                ErrorKind::Syntax,
                "Expected an area name".to_string(),
                None,
            );
            return;
        }
        self.current_area = self.object.area_index(name);
    }

    /// Set the current offset within the area, zero-filling the gap.
    fn dir_org(&mut self, raw: &str, args: &str) {
        let Some(value) = self.eval_resolved(raw, args) else {
            return;
        };
        if !(0..=u32::MAX as i64).contains(&value) {
            self.error(
                ErrorKind::Syntax,
                format!("Origin out of range: {value}"),
                None,
            );
            return;
        }
        let target = value as u32;
        let current = self.area().len();
        if target < current {
            self.error(
                ErrorKind::Syntax,
                format!("Origin {target:#x} is before the current offset {current:#x}"),
                None,
            );
            return;
        }
        self.area_mut().emit_fill(target - current, 0);
    }

    fn dir_symbol_list(&mut self, args: &str, export: bool) {
        if args.trim().is_empty() {
            self.error(
                ErrorKind::Syntax,
                "Expected one or more symbol names".to_string(),
                None,
            );
            return;
        }
        for name in args.split(',') {
            let name = name.trim();
            if !super::is_ident(name) {
                self.error(
                    ErrorKind::Syntax,
                    format!("Invalid symbol name: {name}"),
                    None,
                );
                continue;
            }
            let decl = Decl {
                name: name.to_string(),
                file: self.file.clone(),
                line: self.line,
                source: self.source_line.clone(),
            };
            if export {
                if !self.exports.iter().any(|d| d.name == name) {
                    self.exports.push(decl);
                }
            } else {
                self.declare_import(decl);
            }
        }
    }

    fn declare_import(&mut self, decl: Decl) {
        if self.imports.iter().any(|d| d.name == decl.name) {
            return;
        }
        if self.symbols.contains_key(&decl.name) {
            self.error(
                ErrorKind::DuplicateSymbol,
                format!("Cannot import locally defined symbol: {}", decl.name),
                None,
            );
            return;
        }
        self.define(Symbol::import(&decl.name));
        self.imports.push(decl);
    }

    /// Assemble another file inline, sharing the current area and symbol
    /// context. The target resolves against the ordered include path; a
    /// miss is unrecoverable. Depth is bounded to reject inclusion cycles.
    fn dir_include(&mut self, args: &str) -> Result<(), FatalError> {
        let target = match self.parse_include_target(args) {
            Some(target) => target,
            None => return Ok(()),
        };
        if self.include_depth >= MAX_INCLUDE_DEPTH {
            self.error(
                ErrorKind::CircularInclude,
                format!("Include depth limit exceeded (circular include?): {target}"),
                None,
            );
            return Ok(());
        }
        let path = self
            .settings
            .include_paths
            .iter()
            .map(|dir| dir.join(&target))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                FatalError::io(format!("Unable to find include file '{target}'"))
            })?;
        let source = std::fs::read_to_string(&path).map_err(|err| {
            FatalError::io(format!("Unable to read '{}': {err}", path.display()))
        })?;
        debug!(file = %path.display(), depth = self.include_depth, "including file");

        self.include_depth += 1;
        let result = self.run(&source, &path.to_string_lossy());
        self.include_depth -= 1;
        result
    }

    fn parse_include_target(&mut self, args: &str) -> Option<String> {
        let args = args.trim();
        if args.is_empty() {
            self.error(
                ErrorKind::Syntax,
                "Expected an include file name".to_string(),
                None,
            );
            return None;
        }
        if args.starts_with('"') {
            return match parse_string(args) {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(message) => {
                    self.error(ErrorKind::Syntax, message, None);
                    None
                }
            };
        }
        Some(args.to_string())
    }

    /// `.db`/`.dw`: comma-separated expressions (and string literals for
    /// byte data), each emitted through the regular slot path so forward
    /// references defer like instruction operands do.
    fn dir_data(&mut self, raw: &str, args: &str, width: u8) {
        if args.trim().is_empty() {
            self.error(ErrorKind::Syntax, "Expected data".to_string(), None);
            return;
        }
        let slot = Slot {
            width,
            endian: Endian::Little,
            signed: false,
        };
        for fragment in split_operands(args) {
            let text = fragment.trim();
            if text.starts_with('"') {
                if width != 1 {
                    self.error(
                        ErrorKind::Syntax,
                        "String literals are only allowed in byte data".to_string(),
                        column_in(raw, text),
                    );
                    continue;
                }
                match parse_string(text) {
                    Ok(bytes) => self.area_mut().emit(&bytes),
                    Err(message) => {
                        self.error(ErrorKind::Syntax, message, column_in(raw, text))
                    }
                }
                continue;
            }
            let column = column_in(raw, text);
            if let Some(expr) = self.parse_operand_expr(raw, text) {
                self.emit_slot(expr, slot, column);
            }
        }
    }

    /// `.ds count [, fill]`: reserve a run of bytes. Both arguments must be
    /// evaluable now.
    fn dir_block(&mut self, raw: &str, args: &str) {
        let fragments = split_operands(args);
        if fragments.is_empty() || fragments.len() > 2 {
            self.error(
                ErrorKind::Syntax,
                "Expected a block size and optional fill value".to_string(),
                None,
            );
            return;
        }
        let Some(count) = self.eval_resolved(raw, fragments[0].trim()) else {
            return;
        };
        if !(0..=u32::MAX as i64).contains(&count) {
            self.error(
                ErrorKind::Syntax,
                format!("Block size out of range: {count}"),
                None,
            );
            return;
        }
        let fill = match fragments.get(1) {
            Some(fragment) => {
                let text = fragment.trim();
                let Some(fill) = self.eval_resolved(raw, text) else {
                    return;
                };
                if !(-128..=255).contains(&fill) {
                    self.warning(
                        WarningKind::ValueTruncated,
                        format!("Fill value {fill} truncated to 1 byte(s)"),
                        column_in(raw, text),
                    );
                }
                fill as u8
            }
            None => 0,
        };
        self.area_mut().emit_fill(count as u32, fill);
    }

    fn dir_ascii(&mut self, raw: &str, args: &str, terminate: bool) {
        let text = args.trim();
        match parse_string(text) {
            Ok(bytes) => {
                self.area_mut().emit(&bytes);
                if terminate {
                    self.area_mut().emit_byte(0);
                }
            }
            Err(message) => self.error(ErrorKind::Syntax, message, column_in(raw, text)),
        }
    }

    /// Evaluate an expression that must be resolvable at assembly time.
    fn eval_resolved(&mut self, raw: &str, text: &str) -> Option<i64> {
        let expr = self.parse_operand_expr(raw, text)?;
        let outcome = {
            let me = &*self;
            expr::evaluate(&expr, &|name| me.lookup_value(name))
        };
        match outcome {
            Ok(Eval::Resolved(value)) => Some(value),
            Ok(Eval::Deferred) => {
                self.error(
                    ErrorKind::UnresolvedSymbol,
                    "Expression must be known at assembly time".to_string(),
                    column_in(raw, text),
                );
                None
            }
            Err(err) => {
                self.error(ErrorKind::Syntax, err.message, column_in(raw, text));
                None
            }
        }
    }
}

/// Parse a double-quoted string literal with the usual escapes.
fn parse_string(text: &str) -> Result<Vec<u8>, String> {
    let inner = text
        .strip_prefix('"')
        .ok_or_else(|| "Expected a string literal".to_string())?;
    let mut out = Vec::new();
    let mut chars = inner.chars();
    loop {
        match chars.next() {
            None => return Err("Unterminated string literal".to_string()),
            Some('"') => break,
            Some('\\') => match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('t') => out.push(b'\t'),
                Some('r') => out.push(b'\r'),
                Some('0') => out.push(0),
                Some('\\') => out.push(b'\\'),
                Some('"') => out.push(b'"'),
                Some(other) => return Err(format!("Bad escape sequence: \\{other}")),
                None => return Err("Unterminated string literal".to_string()),
            },
            Some(ch) => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    if !chars.as_str().trim().is_empty() {
        return Err("Unexpected text after string literal".to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::super::{assemble, DEFAULT_AREA};
    use super::parse_string;
    use crate::core::diagnostics::{Diagnostics, ErrorKind, WarningKind};
    use crate::core::instruction_set::{self, InstructionSet};
    use crate::core::object::Object;
    use crate::core::Settings;

    const TABLE: &str = "\
arch z80
reg a hl
cond z
nop    : 00
ld a,@ : 3e @1
jp @   : c3 @2le
";

    static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn set() -> InstructionSet {
        instruction_set::load(TABLE).unwrap()
    }

    fn run(source: &str) -> (Object, Diagnostics) {
        let settings = Settings::default();
        let mut diags = Diagnostics::new();
        let object = assemble(source, "test.asm", &set(), &settings, &mut diags).unwrap();
        (object, diags)
    }

    fn scratch_dir() -> PathBuf {
        let counter = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "relas-test-{}-{counter}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn area_directive_switches_and_creates() {
        let (object, diags) = run("\tnop\n\t.area data\n\tdb 1, 2\n\t.area code\n\tnop\n");
        assert_eq!(diags.len(), 0);
        assert_eq!(object.area(DEFAULT_AREA).unwrap().data(), &[0x00, 0x00]);
        assert_eq!(object.area("data").unwrap().data(), &[1, 2]);
        assert_eq!(object.areas.len(), 2);
    }

    #[test]
    fn org_pads_forward_and_rejects_backward() {
        let (object, diags) = run("\tnop\n\t.org 4\n\tnop\n");
        assert_eq!(diags.len(), 0);
        assert_eq!(
            object.area(DEFAULT_AREA).unwrap().data(),
            &[0x00, 0, 0, 0, 0x00]
        );

        let (_, diags) = run("\tnop\n\tnop\n\t.org 1\n");
        assert_eq!(diags.error_count(), 1);
    }

    #[test]
    fn equ_defines_constants_in_all_three_spellings() {
        let source = "answer equ 42\nmask .equ $f0\nbase = 0x100\n\tld a, answer\n";
        let (object, diags) = run(source);
        assert_eq!(diags.len(), 0);
        let answer = object.symbol("answer").unwrap();
        assert_eq!(answer.value, Some(42));
        assert!(answer.constant);
        assert_eq!(object.symbol("mask").unwrap().value, Some(0xf0));
        assert_eq!(object.symbol("base").unwrap().value, Some(0x100));
        assert_eq!(object.area(DEFAULT_AREA).unwrap().data(), &[0x3e, 42]);
    }

    #[test]
    fn equ_rejects_forward_references() {
        let (_, diags) = run("size equ limit + 1\nlimit:\tnop\n");
        assert_eq!(diags.error_count(), 1);
        let diag = diags.iter().next().unwrap();
        assert_eq!(diag.code(), ErrorKind::UnresolvedSymbol.code());
    }

    #[test]
    fn data_directives_emit_bytes_words_and_strings() {
        let source = "\tdb 1, $ff, \"hi\"\n\tdw $1234, label\nlabel:\n";
        let (object, diags) = run(source);
        assert_eq!(diags.len(), 0);
        let area = object.area(DEFAULT_AREA).unwrap();
        // `label` was a forward reference at emission time: the slot stays
        // zero-filled until the linker's patch pass.
        assert_eq!(area.data(), &[1, 0xff, b'h', b'i', 0x34, 0x12, 0x00, 0x00]);
        assert_eq!(area.late_immediates.len(), 1);
        assert_eq!(area.late_immediates[0].offset, 6);
        assert_eq!(object.symbol("label").unwrap().value, Some(8));
    }

    #[test]
    fn block_directive_reserves_with_fill() {
        let (object, diags) = run("\tds 3\n\tds 2, $aa\n");
        assert_eq!(diags.len(), 0);
        assert_eq!(
            object.area(DEFAULT_AREA).unwrap().data(),
            &[0, 0, 0, 0xaa, 0xaa]
        );
    }

    #[test]
    fn ascii_directives_emit_text() {
        let (object, diags) = run("\t.ascii \"ok\"\n\t.asciz \"go\"\n");
        assert_eq!(diags.len(), 0);
        assert_eq!(
            object.area(DEFAULT_AREA).unwrap().data(),
            &[b'o', b'k', b'g', b'o', 0]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            parse_string("\"a\\n\\0\\\"b\\\\\"").unwrap(),
            vec![b'a', b'\n', 0, b'"', b'b', b'\\']
        );
        assert!(parse_string("\"open").is_err());
        assert!(parse_string("\"bad\\q\"").is_err());
    }

    #[test]
    fn include_shares_area_and_symbol_context() {
        let dir = scratch_dir();
        std::fs::write(dir.join("defs.inc"), "answer equ 42\n\tnop\n").unwrap();
        let settings = Settings {
            include_paths: vec![dir.clone()],
            ..Settings::default()
        };
        let mut diags = Diagnostics::new();
        let object = assemble(
            "\t.include \"defs.inc\"\n\tld a, answer\n",
            "main.asm",
            &set(),
            &settings,
            &mut diags,
        )
        .unwrap();
        assert_eq!(diags.len(), 0, "{:?}", diags.iter().collect::<Vec<_>>());
        assert_eq!(object.area(DEFAULT_AREA).unwrap().data(), &[0x00, 0x3e, 42]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn include_path_order_first_match_wins() {
        let first = scratch_dir();
        let second = scratch_dir();
        std::fs::write(first.join("x.inc"), "\tdb 1\n").unwrap();
        std::fs::write(second.join("x.inc"), "\tdb 2\n").unwrap();
        let settings = Settings {
            include_paths: vec![first.clone(), second.clone()],
            ..Settings::default()
        };
        let mut diags = Diagnostics::new();
        let object = assemble(
            "\t.include \"x.inc\"\n",
            "main.asm",
            &set(),
            &settings,
            &mut diags,
        )
        .unwrap();
        assert_eq!(object.area(DEFAULT_AREA).unwrap().data(), &[1]);
        std::fs::remove_dir_all(&first).ok();
        std::fs::remove_dir_all(&second).ok();
    }

    #[test]
    fn missing_include_is_unrecoverable() {
        let settings = Settings::default();
        let mut diags = Diagnostics::new();
        let result = assemble(
            "\t.include \"nowhere.inc\"\n",
            "main.asm",
            &set(),
            &settings,
            &mut diags,
        );
        assert!(result.is_err());
        // Unrecoverable conditions never enter the diagnostic collection.
        assert_eq!(diags.len(), 0);
    }

    #[test]
    fn circular_include_hits_the_depth_guard() {
        let dir = scratch_dir();
        std::fs::write(dir.join("loop.inc"), "\t.include \"loop.inc\"\n").unwrap();
        let settings = Settings {
            include_paths: vec![dir.clone()],
            ..Settings::default()
        };
        let mut diags = Diagnostics::new();
        let object = assemble(
            "\t.include \"loop.inc\"\n",
            "main.asm",
            &set(),
            &settings,
            &mut diags,
        )
        .unwrap();
        assert_eq!(diags.error_count(), 1);
        let diag = diags.iter().next().unwrap();
        assert_eq!(diag.code(), ErrorKind::CircularInclude.code());
        assert_eq!(object.late_immediate_count(), 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_directive_is_a_syntax_error() {
        let (_, diags) = run("\t.frobnicate 1\n");
        assert_eq!(diags.error_count(), 1);
    }

    #[test]
    fn block_fill_truncation_warns() {
        let (object, diags) = run("\tds 2, 300\n");
        assert_eq!(diags.warning_count(), 1);
        assert_eq!(
            diags.iter().next().unwrap().code(),
            WarningKind::ValueTruncated.code()
        );
        assert_eq!(object.area(DEFAULT_AREA).unwrap().data(), &[0x2c, 0x2c]);
    }
}
