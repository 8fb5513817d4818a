// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Machine-readable symbol listing export.

use serde_json::json;

use crate::core::object::Object;

/// Build the JSON payload for `--symbols`: every object's areas and their
/// symbol tables, with symbols sorted by case-insensitive name for stable
/// output.
pub fn symbols_payload(objects: &[Object]) -> serde_json::Value {
    let objects: Vec<serde_json::Value> = objects
        .iter()
        .map(|object| {
            let areas: Vec<serde_json::Value> = object
                .areas
                .iter()
                .map(|area| {
                    let mut symbols = area.symbols.clone();
                    symbols.sort_by(|left, right| {
                        left.name
                            .to_ascii_lowercase()
                            .cmp(&right.name.to_ascii_lowercase())
                    });
                    let symbols: Vec<serde_json::Value> = symbols
                        .iter()
                        .map(|symbol| {
                            json!({
                                "name": symbol.name,
                                "value": symbol.value,
                                "offset": symbol.offset,
                                "exported": symbol.exported,
                                "imported": symbol.imported,
                                "constant": symbol.constant,
                            })
                        })
                        .collect();
                    json!({
                        "name": area.name,
                        "size": area.len(),
                        "symbols": symbols,
                    })
                })
                .collect();
            json!({
                "name": object.name,
                "arch": object.arch,
                "areas": areas,
            })
        })
        .collect();
    json!({ "objects": objects })
}
