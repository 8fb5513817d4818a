// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! The linker: merges objects' same-named areas, resolves symbols
//! globally, assigns final addresses, and patches every pending late
//! immediate.
//!
//! Input order is significant and preserved throughout: areas concatenate
//! contributions in object order, merged areas are placed in first-seen
//! order, and duplicate-export detection reports in input order. In
//! `merge_only` mode the output is itself a linkable object: areas keep
//! relative offsets, no bases are assigned, and every late immediate stays
//! pending for a later link.

use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::core::diagnostics::{Diagnostic, Diagnostics, ErrorKind, WarningKind};
use crate::core::expr::{self, Eval};
use crate::core::instruction_set::Slot;
use crate::core::object::{Area, LateImmediate, Object, Symbol};
use crate::core::Settings;

/// Name attached to the merged object produced in `merge_only` mode.
pub const MERGED_OBJECT_NAME: &str = "linked";

/// Base addresses are aligned to this boundary under `automatic_relocation`.
const RELOCATION_ALIGN: u32 = 16;

/// The linker's product: a flat image, or a further-linkable object.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkOutput {
    Image(Vec<u8>),
    Object(Object),
}

struct MergedArea {
    name: String,
    data: Vec<u8>,
    symbols: Vec<Symbol>,
    /// Rebased late immediates, tagged with the contributing object so the
    /// patch pass can resolve against that object's local namespace.
    late: Vec<(usize, LateImmediate)>,
    base: Option<u32>,
}

/// One object's view of a symbol after merging, before placement.
struct MergedSymbol {
    merged_area: usize,
    /// Relative for labels, absolute for constants, `None` for imports.
    value: Option<i64>,
    constant: bool,
    exported: bool,
}

/// Link a set of objects. Ownership of the inputs transfers here; the
/// caller gates output writing on the diagnostic error count.
#[instrument(skip_all, fields(objects = objects.len()))]
pub fn link(objects: Vec<Object>, settings: &Settings, diags: &mut Diagnostics) -> LinkOutput {
    if objects.is_empty() {
        diags.push(Diagnostic::error(ErrorKind::Io, "No input objects"));
        return LinkOutput::Image(Vec::new());
    }
    let arch = objects[0].arch.clone();
    for object in &objects[1..] {
        if object.arch != arch {
            diags.push(
                Diagnostic::error(
                    ErrorKind::Format,
                    format!(
                        "Architecture mismatch: {} is '{}', expected '{}'",
                        object.name, object.arch, arch
                    ),
                )
                .with_location(&object.name, 0),
            );
        }
    }

    // Step 1: merge same-named areas in object input order, rebasing each
    // contribution's symbols and late-immediate offsets.
    let mut merged: Vec<MergedArea> = Vec::new();
    let mut per_object: Vec<Vec<(String, MergedSymbol)>> = Vec::with_capacity(objects.len());

    for (obj_idx, object) in objects.iter().enumerate() {
        let mut locals = Vec::new();
        for area in &object.areas {
            let m_idx = match merged.iter().position(|m| m.name == area.name) {
                Some(idx) => idx,
                None => {
                    merged.push(MergedArea {
                        name: area.name.clone(),
                        data: Vec::new(),
                        symbols: Vec::new(),
                        late: Vec::new(),
                        base: None,
                    });
                    merged.len() - 1
                }
            };
            let contribution = merged[m_idx].data.len() as u32;
            merged[m_idx].data.extend_from_slice(area.data());

            for symbol in &area.symbols {
                let value = if symbol.constant {
                    symbol.value
                } else {
                    symbol.value.map(|v| v + contribution as i64)
                };
                locals.push((
                    symbol.name.clone(),
                    MergedSymbol {
                        merged_area: m_idx,
                        value,
                        constant: symbol.constant,
                        exported: symbol.exported,
                    },
                ));
                merged[m_idx].symbols.push(Symbol {
                    name: symbol.name.clone(),
                    value,
                    offset: symbol.offset + contribution,
                    exported: symbol.exported,
                    imported: symbol.imported,
                    constant: symbol.constant,
                });
            }
            for imm in &area.late_immediates {
                let mut imm = imm.clone();
                imm.offset += contribution;
                merged[m_idx].late.push((obj_idx, imm));
            }
        }
        per_object.push(locals);
    }

    // Step 3 (part one): union the exported symbols. Exporting the same
    // name twice is an error, never a first-wins fallback.
    let mut export_owner: HashMap<String, usize> = HashMap::new();
    for (obj_idx, locals) in per_object.iter().enumerate() {
        for (name, info) in locals {
            if !info.exported || info.value.is_none() {
                continue;
            }
            if let Some(&first) = export_owner.get(name) {
                diags.push(
                    Diagnostic::error(
                        ErrorKind::DuplicateExport,
                        format!(
                            "Duplicate export: {name} (defined in {} and {})",
                            objects[first].name, objects[obj_idx].name
                        ),
                    )
                    .with_location(&objects[obj_idx].name, 0),
                );
            } else {
                export_owner.insert(name.clone(), obj_idx);
            }
        }
    }

    if settings.merge_only {
        return LinkOutput::Object(merge_output(arch, merged, diags));
    }

    // Step 2: assign each merged area a base address in first-seen order.
    // Plain mode packs areas back to back from zero; automatic relocation
    // aligns each base up to the next 16-byte boundary.
    let mut addr: u32 = 0;
    for area in &mut merged {
        if settings.automatic_relocation {
            addr = align_up(addr, RELOCATION_ALIGN);
        }
        area.base = Some(addr);
        debug!(area = %area.name, base = addr, size = area.data.len(), "placed area");
        addr += area.data.len() as u32;
    }

    // Final symbol values: merged base plus relative value for labels,
    // the recorded value for constants.
    let final_value = |info: &MergedSymbol| -> Option<i64> {
        let value = info.value?;
        if info.constant {
            Some(value)
        } else {
            Some(value + merged[info.merged_area].base.unwrap_or(0) as i64)
        }
    };
    let mut globals: HashMap<String, i64> = HashMap::new();
    for (name, &obj_idx) in &export_owner {
        let info = per_object[obj_idx]
            .iter()
            .find(|(n, info)| n == name && info.exported && info.value.is_some())
            .map(|(_, info)| info)
            .expect("export owners index defined symbols");
        if let Some(value) = final_value(info) {
            globals.insert(name.clone(), value);
        }
    }
    let locals: Vec<HashMap<String, i64>> = per_object
        .iter()
        .map(|symbols| {
            let mut map = HashMap::new();
            for (name, info) in symbols {
                if let Some(value) = final_value(info) {
                    map.entry(name.clone()).or_insert(value);
                }
            }
            map
        })
        .collect();

    // Step 4: patch every late immediate against final symbol values.
    let mut missing_reported: Vec<String> = Vec::new();
    for area_idx in 0..merged.len() {
        let late = std::mem::take(&mut merged[area_idx].late);
        for (obj_idx, imm) in &late {
            let lookup = |name: &str| {
                locals[*obj_idx]
                    .get(name)
                    .or_else(|| globals.get(name))
                    .copied()
            };
            match expr::evaluate(&imm.expr, &lookup) {
                Ok(Eval::Resolved(value)) => {
                    let slot = Slot {
                        width: imm.width,
                        endian: imm.endian,
                        signed: imm.signed,
                    };
                    if !crate::assembler::fits_slot(value, slot) {
                        let message = format!(
                            "Value {value} truncated to {} byte(s) patching area '{}' at {:#x}",
                            imm.width, merged[area_idx].name, imm.offset
                        );
                        let diag = if settings.overflow_errors {
                            Diagnostic::error(ErrorKind::Overflow, message)
                        } else {
                            Diagnostic::warning(WarningKind::ValueTruncated, message)
                        };
                        diags.push(diag.with_location(&objects[*obj_idx].name, 0));
                    }
                    let bytes = crate::assembler::encode_slot(value, slot);
                    let start = imm.offset as usize;
                    merged[area_idx].data[start..start + bytes.len()]
                        .copy_from_slice(&bytes);
                }
                Ok(Eval::Deferred) => {
                    for name in imm.expr.referenced_symbols() {
                        if lookup(&name).is_some() || missing_reported.iter().any(|n| n == &name)
                        {
                            continue;
                        }
                        missing_reported.push(name.clone());
                        diags.push(
                            Diagnostic::error(
                                ErrorKind::UnresolvedSymbol,
                                format!(
                                    "Undefined symbol: {name} (referenced from {}, area '{}')",
                                    objects[*obj_idx].name, merged[area_idx].name
                                ),
                            )
                            .with_location(&objects[*obj_idx].name, 0),
                        );
                    }
                }
                Err(err) => {
                    diags.push(
                        Diagnostic::error(ErrorKind::Syntax, err.message)
                            .with_location(&objects[*obj_idx].name, 0),
                    );
                }
            }
        }
    }

    // Step 5: concatenate the final bytes of all merged areas in placement
    // order, zero-filling relocation gaps.
    let total = merged
        .iter()
        .map(|m| m.base.unwrap_or(0) as usize + m.data.len())
        .max()
        .unwrap_or(0);
    let mut image = vec![0u8; total];
    for area in &merged {
        let start = area.base.unwrap_or(0) as usize;
        image[start..start + area.data.len()].copy_from_slice(&area.data);
    }
    debug!(bytes = image.len(), errors = diags.error_count(), "linked image");
    LinkOutput::Image(image)
}

/// Build the merge-only output object. Symbols keep relative values; every
/// late immediate stays pending. The merged symbol namespace must stay
/// unique, so colliding non-exported names across objects are errors here
/// (exported collisions were already reported as duplicate exports).
fn merge_output(arch: String, merged: Vec<MergedArea>, diags: &mut Diagnostics) -> Object {
    let mut object = Object::new(MERGED_OBJECT_NAME, arch);
    let mut seen: Vec<String> = Vec::new();
    for area in merged {
        let mut symbols: Vec<Symbol> = Vec::new();
        for symbol in area.symbols {
            if symbol.imported {
                continue;
            }
            if seen.iter().any(|n| n == &symbol.name) {
                if !symbol.exported {
                    diags.push(Diagnostic::error(
                        ErrorKind::DuplicateSymbol,
                        format!("Duplicate symbol across merged objects: {}", symbol.name),
                    ));
                }
                continue;
            }
            seen.push(symbol.name.clone());
            symbols.push(symbol);
        }
        object.areas.push(Area::from_parts(
            area.name,
            area.data,
            symbols,
            area.late.into_iter().map(|(_, imm)| imm).collect(),
        ));
    }
    // Re-create import entries for names still referenced but not defined.
    let mut imports: Vec<String> = Vec::new();
    for area in &object.areas {
        for imm in &area.late_immediates {
            for name in imm.expr.referenced_symbols() {
                if !seen.iter().any(|n| n == &name) && !imports.iter().any(|n| n == &name) {
                    imports.push(name);
                }
            }
        }
    }
    if let Some(first) = object.areas.first_mut() {
        for name in imports {
            first.symbols.push(Symbol::import(name));
        }
    }
    object
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{assemble, DEFAULT_AREA};
    use crate::core::instruction_set::{self, InstructionSet};

    const TABLE: &str = "\
arch z80
reg a hl
cond z
nop    : 00
ret    : c9
ld a,@ : 3e @1
ld hl,@: 21 @2le
jp @   : c3 @2le
call @ : cd @2le
";

    fn set() -> InstructionSet {
        instruction_set::load(TABLE).unwrap()
    }

    fn obj(source: &str, name: &str, settings: &Settings) -> Object {
        let mut diags = Diagnostics::new();
        let object = assemble(source, name, &set(), settings, &mut diags).unwrap();
        assert_eq!(
            diags.error_count(),
            0,
            "assembly of {name} failed: {:?}",
            diags.iter().map(|d| d.format()).collect::<Vec<_>>()
        );
        object
    }

    fn image(output: LinkOutput) -> Vec<u8> {
        match output {
            LinkOutput::Image(bytes) => bytes,
            LinkOutput::Object(_) => panic!("expected an image"),
        }
    }

    fn merged(output: LinkOutput) -> Object {
        match output {
            LinkOutput::Object(object) => object,
            LinkOutput::Image(_) => panic!("expected a merged object"),
        }
    }

    #[test]
    fn areas_concatenate_in_input_order() {
        let settings = Settings::default();
        let a = obj("\tnop\n\tret\n", "a.asm", &settings);
        let b = obj("\tld a, 1\n", "b.asm", &settings);
        let mut diags = Diagnostics::new();
        // Same-named areas are "the same area, continued".
        let out = image(link(vec![a, b], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);
        assert_eq!(out, vec![0x00, 0xc9, 0x3e, 0x01]);
    }

    #[test]
    fn cross_object_reference_patches_to_final_address() {
        // Object A exports `start` at offset 0 of "code"; object B calls
        // it through a 2-byte little-endian slot. Packed placement puts
        // A's code at base 0, so the patched bytes encode address 0.
        let settings = Settings::default();
        let a = obj("start:\tnop\n\tret\n", "a.asm", &settings);
        let b = obj("\tcall start\n", "b.asm", &settings);
        let mut diags = Diagnostics::new();
        let out = image(link(vec![a, b], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);
        assert_eq!(out, vec![0x00, 0xc9, 0xcd, 0x00, 0x00]);

        // Swap the input order: A's contribution now starts at offset 1,
        // and the patch must follow it.
        let settings = Settings::default();
        let b = obj("\tcall start\n", "b.asm", &settings);
        let a = obj("start:\tnop\n\tret\n", "a.asm", &settings);
        let mut diags = Diagnostics::new();
        let out = image(link(vec![b, a], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);
        assert_eq!(out, vec![0xcd, 0x03, 0x00, 0x00, 0xc9]);
    }

    #[test]
    fn forward_reference_matches_backward_reference_bytes() {
        let settings = Settings::default();
        let forward = obj("\tjp end\nend:\tret\n", "f.asm", &settings);
        let mut diags = Diagnostics::new();
        let forward_img = image(link(vec![forward], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);

        // The same layout written with the label first resolves inline;
        // after linking both must agree.
        assert_eq!(forward_img, vec![0xc3, 0x03, 0x00, 0xc9]);
    }

    #[test]
    fn duplicate_export_is_an_error() {
        let settings = Settings::default();
        let a = obj("foo:\tnop\n", "a.asm", &settings);
        let b = obj("foo:\tret\n", "b.asm", &settings);
        let mut diags = Diagnostics::new();
        link(vec![a, b], &settings, &mut diags);
        assert_eq!(diags.error_count(), 1);
        let diag = diags.iter().next().unwrap();
        assert_eq!(diag.code(), ErrorKind::DuplicateExport.code());
        assert!(diag.message().contains("a.asm"));
        assert!(diag.message().contains("b.asm"));
    }

    #[test]
    fn local_symbols_stay_invisible_under_explicit_export() {
        let settings = Settings {
            explicit_export: true,
            ..Settings::default()
        };
        let a = obj("loop:\tnop\n", "a.asm", &settings);
        let b = obj("loop:\tret\n", "b.asm", &settings);
        let mut diags = Diagnostics::new();
        let out = image(link(vec![a, b], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);
        assert_eq!(out, vec![0x00, 0xc9]);
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let settings = Settings::default();
        let a = obj("\tcall nowhere\n", "a.asm", &settings);
        let mut diags = Diagnostics::new();
        link(vec![a], &settings, &mut diags);
        assert!(diags.error_count() >= 1);
        assert!(diags
            .iter()
            .any(|d| d.code() == ErrorKind::UnresolvedSymbol.code()
                && d.message().contains("nowhere")));
    }

    #[test]
    fn local_forward_reference_resolves_without_export() {
        let settings = Settings {
            explicit_export: true,
            ..Settings::default()
        };
        // `end` is local (not exported); it must still satisfy the
        // object's own late immediate.
        let a = obj("\tjp end\nend:\tret\n", "a.asm", &settings);
        let mut diags = Diagnostics::new();
        let out = image(link(vec![a], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);
        assert_eq!(out, vec![0xc3, 0x03, 0x00, 0xc9]);
    }

    #[test]
    fn constants_are_not_relocated() {
        let settings = Settings::default();
        let a = obj("base equ $42\n\t.area data\n\tnop\n", "a.asm", &settings);
        let b = obj("\t.area data\n\tld a, base\n", "b.asm", &settings);
        // "data" is not the first-seen area only if another area precedes
        // it; the default "code" area of a.asm is empty but still first.
        let mut diags = Diagnostics::new();
        let out = image(link(vec![a, b], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);
        assert_eq!(out, vec![0x00, 0x3e, 0x42]);
    }

    #[test]
    fn merge_only_keeps_relative_offsets_and_pending_patches() {
        let settings = Settings {
            merge_only: true,
            ..Settings::default()
        };
        let a = obj("start:\tnop\n\tret\n", "a.asm", &settings);
        let b = obj("\tcall start\n\tcall outside\n", "b.asm", &settings);
        let mut diags = Diagnostics::new();
        let merged_obj = merged(link(vec![a, b], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);

        let code = merged_obj.area(DEFAULT_AREA).unwrap();
        // Contributions concatenated, nothing patched.
        assert_eq!(
            code.data(),
            &[0x00, 0xc9, 0xcd, 0x00, 0x00, 0xcd, 0x00, 0x00]
        );
        assert_eq!(code.late_immediates.len(), 2);
        assert_eq!(code.late_immediates[0].offset, 3);
        // `start` keeps its relative value.
        assert_eq!(merged_obj.symbol("start").unwrap().value, Some(0));
        // The external name is re-declared as an import.
        assert!(merged_obj.symbol("outside").unwrap().imported);
    }

    #[test]
    fn merge_only_output_relinks_to_the_same_image() {
        let settings = Settings::default();
        let a = obj("start:\tnop\n\tret\n", "a.asm", &settings);
        let b = obj("\tcall start\n", "b.asm", &settings);
        let mut diags = Diagnostics::new();
        let direct = image(link(vec![a.clone(), b.clone()], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);

        let merge_settings = Settings {
            merge_only: true,
            ..Settings::default()
        };
        let mut diags = Diagnostics::new();
        let merged_obj = merged(link(vec![a, b], &merge_settings, &mut diags));
        assert_eq!(diags.error_count(), 0);
        let mut diags = Diagnostics::new();
        let relinked = image(link(vec![merged_obj], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);
        assert_eq!(direct, relinked);
    }

    #[test]
    fn automatic_relocation_places_on_aligned_bases() {
        let settings = Settings {
            automatic_relocation: true,
            ..Settings::default()
        };
        let a = obj(
            "\tnop\n\t.area data\nvalue:\tnop\n\t.area code\n\tjp value\n",
            "a.asm",
            &settings,
        );
        let mut diags = Diagnostics::new();
        let out = image(link(vec![a], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);
        // code: 4 bytes at base 0; data: base aligned up to 16.
        assert_eq!(out.len(), 17);
        assert_eq!(&out[..4], &[0x00, 0xc3, 0x10, 0x00]);
        assert_eq!(out[16], 0x00);
        assert!(out[4..16].iter().all(|&b| b == 0));
    }

    #[test]
    fn patch_truncation_warns_by_default_and_errors_when_strict() {
        let settings = Settings::default();
        let a = obj("big equ 300\n\tld a, big + zero\nzero:\n", "a.asm", &settings);
        let mut diags = Diagnostics::new();
        let out = image(link(vec![a.clone()], &settings, &mut diags));
        assert_eq!(diags.error_count(), 0);
        assert_eq!(diags.warning_count(), 1);
        // 303 & 0xff == 0x2f; `zero` sits at offset 2 + placement 0... the
        // label is at offset 2, so 300 + 2 = 302 -> 0x2e.
        assert_eq!(out, vec![0x3e, 0x2e]);

        let strict = Settings {
            overflow_errors: true,
            ..Settings::default()
        };
        let mut diags = Diagnostics::new();
        link(vec![a], &strict, &mut diags);
        assert_eq!(diags.error_count(), 1);
        assert_eq!(
            diags.iter().next().unwrap().code(),
            ErrorKind::Overflow.code()
        );
    }

    #[test]
    fn architecture_mismatch_is_detected() {
        let settings = Settings::default();
        let a = obj("\tnop\n", "a.asm", &settings);
        let mut b = obj("\tnop\n", "b.asm", &settings);
        b.arch = "8080".to_string();
        let mut diags = Diagnostics::new();
        link(vec![a, b], &settings, &mut diags);
        assert!(diags
            .iter()
            .any(|d| d.code() == ErrorKind::Format.code()));
    }

    #[test]
    fn empty_input_is_an_error() {
        let settings = Settings::default();
        let mut diags = Diagnostics::new();
        let out = link(Vec::new(), &settings, &mut diags);
        assert_eq!(out, LinkOutput::Image(Vec::new()));
        assert_eq!(diags.error_count(), 1);
    }
}
