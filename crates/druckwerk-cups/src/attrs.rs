// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Helpers for working with flattened IPP attribute sets.
//
// The IPP layer flattens every response into a `name -> string` map
// (multi-valued attributes joined with `", "`); these helpers give the
// reconciler and dispatcher typed views onto that map.

use std::collections::HashSet;

use ipp::prelude::*;

use druckwerk_core::{PrinterAttributes, PrinterState};

/// Flatten all attribute groups of an IPP response into a single map.
///
/// Multi-valued attributes are joined with `", "`.  This intentionally
/// discards group-level context in favour of a simpler lookup interface.
pub fn flatten_attributes(attrs: &IppAttributes) -> PrinterAttributes {
    let mut map = PrinterAttributes::new();
    for group in attrs.groups() {
        for (name, attr) in group.attributes() {
            let value = match attr.value() {
                IppValue::Array(items) => items
                    .iter()
                    .map(|v| format!("{v}"))
                    .collect::<Vec<_>>()
                    .join(", "),
                other => format!("{other}"),
            };
            map.insert(name.clone(), value);
        }
    }
    map
}

/// Split a joined multi-value attribute into its parts.
pub fn split_values(attrs: &PrinterAttributes, name: &str) -> Vec<String> {
    attrs
        .get(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Multi-value attribute as a set, for membership checks.
pub fn value_set(attrs: &PrinterAttributes, name: &str) -> HashSet<String> {
    split_values(attrs, name).into_iter().collect()
}

/// `printer-state` as a typed value; absent means idle.
pub fn printer_state(attrs: &PrinterAttributes) -> PrinterState {
    attrs
        .get("printer-state")
        .and_then(|v| v.trim().parse::<i32>().ok())
        .map(PrinterState::from_ipp_enum)
        .unwrap_or(PrinterState::Idle)
}

/// `printer-is-accepting-jobs`; absent means accepting.
pub fn is_accepting(attrs: &PrinterAttributes) -> bool {
    attrs
        .get("printer-is-accepting-jobs")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(true)
}

/// Parse one IPP resolution string ("600dpi", "600x1200dpi") to its
/// cross-feed dpi value.
pub fn parse_resolution(value: &str) -> Option<u32> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// All supported resolutions in dpi, from `printer-resolution-supported`.
pub fn resolutions_supported(attrs: &PrinterAttributes) -> Vec<u32> {
    split_values(attrs, "printer-resolution-supported")
        .iter()
        .filter_map(|v| parse_resolution(v))
        .collect()
}

/// Default resolution in dpi; 600 when the printer does not report one.
pub fn resolution_default(attrs: &PrinterAttributes) -> u32 {
    attrs
        .get("printer-resolution-default")
        .and_then(|v| parse_resolution(v))
        .unwrap_or(600)
}
