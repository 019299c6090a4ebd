//! Unit file text format: ini-like sections of repeatable `Key=Value`
//! options, `#`/`;` comments, blank lines ignored, whitespace trimmed.

use std::collections::BTreeMap;
use std::fmt::Write;

use super::{Unit, UnitContents};

/// Map a raw unit file onto its sections and options. Unknown lines
/// (no `=`, or options before any section header) are dropped.
pub fn parse_unit_file(raw: &str) -> UnitContents {
    let mut sections: UnitContents = BTreeMap::new();
    let mut section = String::new();

    for line in raw.split('\n') {
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            section = line[1..line.len() - 1].to_string();
            sections.entry(section.clone()).or_default();
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            if !section.is_empty() {
                sections
                    .entry(section.clone())
                    .or_default()
                    .entry(key.trim().to_string())
                    .or_default()
                    .push(value.trim().to_string());
            }
        }
    }

    sections
}

impl Unit {
    /// Reconstruct a unit from the obsolete single-valued contents map of
    /// a legacy payload. Only used on the legacy read path; the serialized
    /// form is deterministic so the recomputed hash is stable.
    pub fn from_legacy_contents(contents: &BTreeMap<String, BTreeMap<String, String>>) -> Self {
        let mut raw = String::new();
        for (section, options) in contents {
            let _ = writeln!(raw, "[{section}]");
            for (key, value) in options {
                let _ = writeln!(raw, "{key}={value}");
            }
            raw.push('\n');
        }
        Unit::new(&raw)
    }
}
