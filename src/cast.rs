//! Textual column values → semantic JSON values.
//!
//! The logical stream carries every column as text; this module casts by
//! the column's type name. Casting is best-effort by design: a value that
//! fails to parse is forwarded as its raw string so downstream consumers
//! can decide, and the transaction is never aborted over it.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Number, Value};
use std::str::FromStr;
use tracing::trace;
use uuid::Uuid;

/// Resolve a built-in type OID to its catalog name. Unknown OIDs get a
/// stable placeholder that casts as pass-through text.
pub fn type_name_for_oid(oid: u32) -> String {
    let name = match oid {
        16 => "bool",
        17 => "bytea",
        18 => "char",
        19 => "name",
        20 => "int8",
        21 => "int2",
        23 => "int4",
        25 => "text",
        26 => "oid",
        114 => "json",
        700 => "float4",
        701 => "float8",
        790 => "money",
        1042 => "bpchar",
        1043 => "varchar",
        1082 => "date",
        1083 => "time",
        1114 => "timestamp",
        1184 => "timestamptz",
        1186 => "interval",
        1266 => "timetz",
        1700 => "numeric",
        2950 => "uuid",
        3802 => "jsonb",
        1000 => "_bool",
        1001 => "_bytea",
        1005 => "_int2",
        1007 => "_int4",
        1016 => "_int8",
        1009 => "_text",
        1015 => "_varchar",
        1021 => "_float4",
        1022 => "_float8",
        1231 => "_numeric",
        2951 => "_uuid",
        199 => "_json",
        3807 => "_jsonb",
        1182 => "_date",
        1115 => "_timestamp",
        1185 => "_timestamptz",
        _ => return format!("oid:{oid}"),
    };
    name.to_string()
}

/// Cast one textual value by type name. Never fails; see module docs.
pub fn cast_value(type_name: &str, raw: &str) -> Value {
    if let Some(element_type) = type_name.strip_prefix('_') {
        return cast_array(element_type, raw);
    }

    match type_name {
        "int2" | "int4" | "int8" | "oid" => match raw.parse::<i64>() {
            Ok(n) => Value::Number(n.into()),
            Err(_) => pass_through(type_name, raw),
        },
        "float4" | "float8" => match raw.parse::<f64>() {
            Ok(f) => Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or_else(|| pass_through(type_name, raw)),
            Err(_) => pass_through(type_name, raw),
        },
        "numeric" | "money" => match Decimal::from_str(raw) {
            // Strings preserve arbitrary precision through JSON.
            Ok(d) => Value::String(d.to_string()),
            Err(_) => pass_through(type_name, raw),
        },
        "bool" => match raw {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => pass_through(type_name, raw),
        },
        "bytea" => match decode_bytea(raw) {
            Some(bytes) => Value::String(format!("\\x{}", hex::encode(bytes))),
            None => pass_through(type_name, raw),
        },
        "timestamp" => match NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
            Ok(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Err(_) => pass_through(type_name, raw),
        },
        "timestamptz" => match DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
            Ok(ts) => Value::String(ts.with_timezone(&Utc).to_rfc3339()),
            Err(_) => pass_through(type_name, raw),
        },
        "date" => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(d) => Value::String(d.to_string()),
            Err(_) => pass_through(type_name, raw),
        },
        "time" => match NaiveTime::parse_from_str(raw, "%H:%M:%S%.f") {
            Ok(t) => Value::String(t.to_string()),
            Err(_) => pass_through(type_name, raw),
        },
        // Keeps the offset the server sent.
        "timetz" => Value::String(raw.to_string()),
        "uuid" => match Uuid::parse_str(raw) {
            Ok(u) => Value::String(u.to_string()),
            Err(_) => pass_through(type_name, raw),
        },
        "json" | "jsonb" => match serde_json::from_str::<Value>(raw) {
            Ok(v) => v,
            Err(_) => pass_through(type_name, raw),
        },
        _ => Value::String(raw.to_string()),
    }
}

fn pass_through(type_name: &str, raw: &str) -> Value {
    trace!(type_name, raw, "cast failed, forwarding raw text");
    Value::String(raw.to_string())
}

/// Array literal: `{e1,e2,…}`. Elements split on unquoted commas; quoted
/// elements lose their surrounding quotes and `\"`/`\\` escapes; unquoted
/// `NULL` is null; nested braces recurse as sub-arrays.
fn cast_array(element_type: &str, raw: &str) -> Value {
    let Some(inner) = raw
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Value::String(raw.to_string());
    };

    if inner.is_empty() {
        return Value::Array(Vec::new());
    }

    let mut elements = Vec::new();
    for element in split_array_elements(inner) {
        elements.push(cast_array_element(element_type, &element));
    }
    Value::Array(elements)
}

fn cast_array_element(element_type: &str, element: &ArrayElement) -> Value {
    match element {
        ArrayElement::Quoted(text) => cast_value(element_type, text),
        ArrayElement::Bare(text) if text == "NULL" => Value::Null,
        ArrayElement::Bare(text) if text.starts_with('{') => cast_array(element_type, text),
        ArrayElement::Bare(text) => cast_value(element_type, text),
    }
}

enum ArrayElement {
    /// Was double-quoted; quotes stripped and escapes resolved.
    Quoted(String),
    Bare(String),
}

fn split_array_elements(inner: &str) -> Vec<ArrayElement> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut depth = 0usize;
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                // Only \" and \\ are produced by the server; keep anything
                // else verbatim.
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                was_quoted = true;
            }
            '{' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            '}' if !in_quotes => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if !in_quotes && depth == 0 => {
                elements.push(finish_element(&mut current, &mut was_quoted));
            }
            _ => current.push(c),
        }
    }
    elements.push(finish_element(&mut current, &mut was_quoted));
    elements
}

fn finish_element(current: &mut String, was_quoted: &mut bool) -> ArrayElement {
    let text = std::mem::take(current);
    if std::mem::take(was_quoted) {
        ArrayElement::Quoted(text)
    } else {
        ArrayElement::Bare(text)
    }
}

/// Both bytea output forms: hex (`\x48690a`) and escape
/// (`Hi\012` with `\\` for backslash).
fn decode_bytea(raw: &str) -> Option<Vec<u8>> {
    if let Some(hex_part) = raw.strip_prefix("\\x") {
        return hex::decode(hex_part).ok();
    }

    let mut out = Vec::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if bytes.get(i + 1) == Some(&b'\\') {
                out.push(b'\\');
                i += 2;
            } else if i + 4 <= bytes.len() {
                let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).ok()?;
                out.push(u8::from_str_radix(octal, 8).ok()?);
                i += 4;
            } else {
                return None;
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}
