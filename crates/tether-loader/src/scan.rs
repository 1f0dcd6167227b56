// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Lightweight source scanning.
//!
//! Extracts static import specifiers and `require()` arguments and detects
//! which module idiom a source uses, without a full parse. Regex-based by
//! design: the loader needs specifiers and syntax markers, not an AST.

use regex::Regex;
use std::sync::OnceLock;

fn static_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^[ \t]*import\b[^;'"]*?["']([^"']+)["']"#).unwrap()
    })
}

fn export_from_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^[ \t]*export\b[^;'"]*?\bfrom[ \t]+["']([^"']+)["']"#).unwrap()
    })
}

fn esm_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?m)^[ \t]*(?:import|export)\b"#).unwrap())
}

fn require_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\brequire[ \t]*\([ \t]*["']([^"']+)["'][ \t]*\)"#).unwrap()
    })
}

fn cjs_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\bmodule\.exports\b|\bexports\.[A-Za-z_$]|\brequire[ \t]*\("#).unwrap()
    })
}

/// Which module idiom a source exhibits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxSignal {
    /// Only `import`/`export` syntax
    Esm,
    /// Only `require`/`exports` syntax
    Cjs,
    /// Markers of both idioms
    Both,
    /// No module syntax at all
    Neither,
}

/// What a scan found in one source
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Static import and re-export specifiers, in declaration order
    pub imports: Vec<String>,
    /// `require()` arguments, in call order
    pub requires: Vec<String>,
    /// Whether ESM syntax markers are present
    pub has_esm_syntax: bool,
    /// Whether CommonJS syntax markers are present
    pub has_cjs_syntax: bool,
}

impl ScanReport {
    /// Collapse the markers into one signal
    pub fn signal(&self) -> SyntaxSignal {
        match (self.has_esm_syntax, self.has_cjs_syntax) {
            (true, true) => SyntaxSignal::Both,
            (true, false) => SyntaxSignal::Esm,
            (false, true) => SyntaxSignal::Cjs,
            (false, false) => SyntaxSignal::Neither,
        }
    }
}

/// Scan a source, considering at most `limit` bytes
pub fn scan(source: &str, limit: usize) -> ScanReport {
    let source = clamp_to_limit(source, limit);

    // Merge import and re-export specifiers by position so declaration
    // order survives, then drop duplicates keeping the first occurrence.
    let mut found: Vec<(usize, String)> = Vec::new();
    for cap in static_import_re().captures_iter(source) {
        let m = cap.get(1).unwrap();
        found.push((m.start(), m.as_str().to_string()));
    }
    for cap in export_from_re().captures_iter(source) {
        let m = cap.get(1).unwrap();
        found.push((m.start(), m.as_str().to_string()));
    }
    found.sort_by_key(|(pos, _)| *pos);

    let mut imports = Vec::new();
    for (_, spec) in found {
        if !imports.contains(&spec) {
            imports.push(spec);
        }
    }

    let mut requires = Vec::new();
    for cap in require_re().captures_iter(source) {
        let spec = cap.get(1).unwrap().as_str().to_string();
        if !requires.contains(&spec) {
            requires.push(spec);
        }
    }

    ScanReport {
        has_esm_syntax: esm_marker_re().is_match(source),
        has_cjs_syntax: cjs_marker_re().is_match(source),
        imports,
        requires,
    }
}

fn clamp_to_limit(source: &str, limit: usize) -> &str {
    if source.len() <= limit {
        return source;
    }
    let mut end = limit;
    while end > 0 && !source.is_char_boundary(end) {
        end -= 1;
    }
    &source[..end]
}
