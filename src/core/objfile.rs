// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Binary serialization of object modules.
//!
//! The writer and reader are exact inverses: for any well-formed object
//! `o`, `deserialize(&serialize(&o))` is structurally equal to `o`.
//! Integers are little-endian; strings are u16-length-prefixed UTF-8;
//! expressions are stored as their canonical `Display` text and re-parsed
//! on load. Corrupt input produces a deterministic [`FormatError`] naming
//! what failed.

use std::fmt;

use crate::core::expr;
use crate::core::object::{Area, Endian, LateImmediate, Object, Symbol};

pub const MAGIC: [u8; 4] = *b"RLOB";
pub const VERSION: u16 = 1;

const FLAG_EXPORT: u8 = 1 << 0;
const FLAG_IMPORT: u8 = 1 << 1;
const FLAG_CONSTANT: u8 = 1 << 2;

// Backstop against pathological counts in corrupt input.
const MAX_DECODE_ENTRY_COUNT: u32 = 1_000_000;

/// A corrupt or unreadable serialized object.
#[derive(Debug, Clone)]
pub struct FormatError {
    pub message: String,
}

impl FormatError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FormatError {}

/// Flat image emission refused because patch sites are still pending.
#[derive(Debug, Clone)]
pub struct FlatImageError {
    pub pending: usize,
}

impl fmt::Display for FlatImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot emit flat image: {} unresolved late immediate(s) remain",
            self.pending
        )
    }
}

impl std::error::Error for FlatImageError {}

/// Serialize an object module to its binary form.
pub fn serialize(object: &Object) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    put_u16(&mut out, VERSION);
    put_str(&mut out, &object.arch);
    put_u32(&mut out, object.areas.len() as u32);

    for area in &object.areas {
        put_str(&mut out, &area.name);
        put_u32(&mut out, area.len());
        out.extend_from_slice(area.data());

        put_u32(&mut out, area.late_immediates.len() as u32);
        for imm in &area.late_immediates {
            put_u32(&mut out, imm.offset);
            out.push(imm.width);
            out.push(match imm.endian {
                Endian::Little => 0,
                Endian::Big => 1,
            });
            out.push(imm.signed as u8);
            put_str(&mut out, &imm.expr.to_string());
        }

        put_u32(&mut out, area.symbols.len() as u32);
        for symbol in &area.symbols {
            put_str(&mut out, &symbol.name);
            let mut flags = 0u8;
            if symbol.exported {
                flags |= FLAG_EXPORT;
            }
            if symbol.imported {
                flags |= FLAG_IMPORT;
            }
            if symbol.constant {
                flags |= FLAG_CONSTANT;
            }
            out.push(flags);
            match symbol.value {
                Some(value) => {
                    out.push(1);
                    put_i64(&mut out, value);
                }
                None => out.push(0),
            }
            put_u32(&mut out, symbol.offset);
        }
    }

    out
}

/// Deserialize an object module. `name` is the unit name to attach (the
/// binary form does not carry one).
pub fn deserialize(bytes: &[u8], name: &str) -> Result<Object, FormatError> {
    let mut cursor = Cursor::new(bytes);

    let magic = cursor.take(4, "magic")?;
    if magic != MAGIC {
        return Err(FormatError::new("Bad object magic"));
    }
    let version = cursor.u16("format version")?;
    if version != VERSION {
        return Err(FormatError::new(format!(
            "Unsupported object format version: {version}"
        )));
    }
    let arch = cursor.string("architecture name")?;

    let area_count = cursor.count("area count")?;
    let mut object = Object::new(name, arch);
    for _ in 0..area_count {
        let area_name = cursor.string("area name")?;
        let data_len = cursor.u32("area data length")? as usize;
        let data = cursor.take(data_len, "area data")?.to_vec();

        let late_count = cursor.count("late immediate count")?;
        let mut late_immediates = Vec::with_capacity(late_count as usize);
        for _ in 0..late_count {
            let offset = cursor.u32("late immediate offset")?;
            let width = cursor.u8("late immediate width")?;
            let endian = match cursor.u8("late immediate endianness")? {
                0 => Endian::Little,
                1 => Endian::Big,
                other => {
                    return Err(FormatError::new(format!(
                        "Bad endianness marker: {other}"
                    )))
                }
            };
            let signed = cursor.u8("late immediate signedness")? != 0;
            if offset as usize + width as usize > data.len() {
                return Err(FormatError::new(format!(
                    "Late immediate at {offset} overruns area '{area_name}'"
                )));
            }
            let text = cursor.string("late immediate expression")?;
            let expr = expr::parse(&text).map_err(|err| {
                FormatError::new(format!("Bad expression in object file: {err}"))
            })?;
            late_immediates.push(LateImmediate {
                offset,
                width,
                endian,
                signed,
                expr,
            });
        }

        let symbol_count = cursor.count("symbol count")?;
        let mut symbols = Vec::with_capacity(symbol_count as usize);
        for _ in 0..symbol_count {
            let sym_name = cursor.string("symbol name")?;
            let flags = cursor.u8("symbol flags")?;
            let value = match cursor.u8("symbol value marker")? {
                0 => None,
                1 => Some(cursor.i64("symbol value")?),
                other => {
                    return Err(FormatError::new(format!(
                        "Bad symbol value marker: {other}"
                    )))
                }
            };
            let offset = cursor.u32("symbol offset")?;
            symbols.push(Symbol {
                name: sym_name,
                value,
                offset,
                exported: flags & FLAG_EXPORT != 0,
                imported: flags & FLAG_IMPORT != 0,
                constant: flags & FLAG_CONSTANT != 0,
            });
        }

        object
            .areas
            .push(Area::from_parts(area_name, data, symbols, late_immediates));
    }

    if !cursor.at_end() {
        return Err(FormatError::new("Trailing bytes after object data"));
    }
    Ok(object)
}

/// Concatenate final area bytes with no wrapper. Only legal once no late
/// immediates remain anywhere in the object.
pub fn flat_image(object: &Object) -> Result<Vec<u8>, FlatImageError> {
    let pending = object.late_immediate_count();
    if pending != 0 {
        return Err(FlatImageError { pending });
    }
    let mut out = Vec::new();
    for area in &object.areas {
        out.extend_from_slice(area.data());
    }
    Ok(out)
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, text: &str) {
    let bytes = text.as_bytes();
    debug_assert!(bytes.len() <= u16::MAX as usize);
    put_u16(out, bytes.len() as u16);
    out.extend_from_slice(bytes);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], FormatError> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(FormatError::new(format!(
                "Unexpected end of object file reading {what}"
            ))),
        }
    }

    fn u8(&mut self, what: &str) -> Result<u8, FormatError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, FormatError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32, FormatError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self, what: &str) -> Result<i64, FormatError> {
        let b = self.take(8, what)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn count(&mut self, what: &str) -> Result<u32, FormatError> {
        let count = self.u32(what)?;
        if count > MAX_DECODE_ENTRY_COUNT {
            return Err(FormatError::new(format!(
                "Implausible {what} in object file: {count}"
            )));
        }
        Ok(count)
    }

    fn string(&mut self, what: &str) -> Result<String, FormatError> {
        let len = self.u16(what)? as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| FormatError::new(format!("{what} is not valid UTF-8")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_object() -> Object {
        let mut object = Object::new("boot.asm", "z80");
        let code = object.area_index("code");
        object.areas[code].emit(&[0x3e, 0x2a, 0xc3, 0x00, 0x00]);
        object.areas[code].symbols.push(Symbol::label("start", 0));
        object.areas[code].symbols.push({
            let mut s = Symbol::constant("answer", 42, 2);
            s.exported = true;
            s
        });
        object.areas[code].symbols.push(Symbol::import("puts"));
        object.areas[code].add_late_immediate(LateImmediate {
            offset: 3,
            width: 2,
            endian: Endian::Little,
            signed: false,
            expr: expr::parse("puts + 2").unwrap(),
        });
        let data = object.area_index("data");
        object.areas[data].emit(&[1, 2, 3]);
        object
    }

    #[test]
    fn round_trip_preserves_structure() {
        let object = sample_object();
        let bytes = serialize(&object);
        let back = deserialize(&bytes, "boot.asm").unwrap();
        assert_eq!(object, back);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = serialize(&sample_object());
        bytes[0] = b'X';
        let err = deserialize(&bytes, "x").unwrap_err();
        assert!(err.message.contains("magic"));
    }

    #[test]
    fn rejects_bad_version() {
        let mut bytes = serialize(&sample_object());
        bytes[4] = 0xff;
        let err = deserialize(&bytes, "x").unwrap_err();
        assert!(err.message.contains("version"));
    }

    #[test]
    fn rejects_truncation_anywhere() {
        let bytes = serialize(&sample_object());
        for len in 0..bytes.len() {
            assert!(
                deserialize(&bytes[..len], "x").is_err(),
                "truncation at {len} must fail"
            );
        }
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut bytes = serialize(&sample_object());
        bytes.push(0);
        let err = deserialize(&bytes, "x").unwrap_err();
        assert!(err.message.contains("Trailing"));
    }

    #[test]
    fn flat_image_concatenates_in_area_order() {
        let mut object = Object::new("a.asm", "z80");
        let code = object.area_index("code");
        object.areas[code].emit(&[0xaa, 0xbb]);
        let data = object.area_index("data");
        object.areas[data].emit(&[0xcc]);
        assert_eq!(flat_image(&object).unwrap(), vec![0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn flat_image_refuses_pending_immediates() {
        let object = sample_object();
        let err = flat_image(&object).unwrap_err();
        assert_eq!(err.pending, 1);
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_payloads(
            data in proptest::collection::vec(any::<u8>(), 0..64),
            value in any::<i64>(),
            offset in any::<u32>(),
        ) {
            let mut object = Object::new("t", "z80");
            let idx = object.area_index("code");
            object.areas[idx].emit(&data);
            object.areas[idx].symbols.push(Symbol {
                name: "sym".to_string(),
                value: Some(value),
                offset,
                exported: offset % 2 == 0,
                imported: false,
                constant: offset % 3 == 0,
            });
            let bytes = serialize(&object);
            prop_assert_eq!(deserialize(&bytes, "t").unwrap(), object);
        }
    }
}
