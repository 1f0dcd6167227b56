// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Lexical classification of module specifiers.
//!
//! Classification is purely syntactic. No filesystem probing happens here;
//! whether a candidate actually exists is the resolver's business.

use crate::error::{LoaderError, Result};

/// Prefix addressing the privileged built-in namespace
pub const BUILTIN_PREFIX: &str = "core:";

/// The lexical shape of a specifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecifierKind {
    /// Begins with `./` or `../`
    Relative,
    /// Begins with `/`
    Absolute,
    /// Carries an RFC 3986 scheme (`file:`, `data:`, `https:`, ...)
    Url,
    /// Addresses the built-in namespace via the `core:` prefix
    Builtin,
    /// Anything else: a package name, optionally scoped or with a subpath
    Bare,
}

/// Classify a raw specifier string
pub fn classify(specifier: &str) -> Result<SpecifierKind> {
    if specifier.is_empty() {
        return Err(LoaderError::InvalidSpecifier("<empty>".to_string()));
    }
    if specifier.contains('\0') {
        return Err(LoaderError::InvalidSpecifier(
            specifier.replace('\0', "\\0"),
        ));
    }

    if specifier == "." || specifier == ".." || specifier.starts_with("./") || specifier.starts_with("../") {
        return Ok(SpecifierKind::Relative);
    }
    if specifier.starts_with('/') {
        return Ok(SpecifierKind::Absolute);
    }
    if specifier.starts_with(BUILTIN_PREFIX) {
        return Ok(SpecifierKind::Builtin);
    }
    if has_scheme(specifier) {
        return Ok(SpecifierKind::Url);
    }
    Ok(SpecifierKind::Bare)
}

/// RFC 3986 scheme test: ALPHA *( ALPHA / DIGIT / "+" / "-" / "." ) ":".
/// Single-letter schemes are rejected so Windows drive paths (`C:\...`)
/// classify as bare rather than URLs, mirroring how the resolver treats them.
fn has_scheme(specifier: &str) -> bool {
    let Some(colon) = specifier.find(':') else {
        return false;
    };
    if colon < 2 {
        return false;
    }
    let scheme = &specifier[..colon];
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_relative_and_absolute() {
        assert_eq!(classify("./a.js").unwrap(), SpecifierKind::Relative);
        assert_eq!(classify("../lib/util.js").unwrap(), SpecifierKind::Relative);
        assert_eq!(classify(".").unwrap(), SpecifierKind::Relative);
        assert_eq!(classify("/opt/app/main.js").unwrap(), SpecifierKind::Absolute);
    }

    #[test]
    fn test_classify_urls() {
        assert_eq!(classify("file:///srv/app.js").unwrap(), SpecifierKind::Url);
        assert_eq!(classify("data:text/javascript,1").unwrap(), SpecifierKind::Url);
        assert_eq!(classify("https://cdn.example/mod.js").unwrap(), SpecifierKind::Url);
    }

    #[test]
    fn test_classify_builtin_prefix() {
        assert_eq!(classify("core:time").unwrap(), SpecifierKind::Builtin);
        // Bare builtin names are still lexically bare; the resolver decides.
        assert_eq!(classify("time").unwrap(), SpecifierKind::Bare);
    }

    #[test]
    fn test_classify_bare() {
        assert_eq!(classify("lodash").unwrap(), SpecifierKind::Bare);
        assert_eq!(classify("@scope/pkg/sub").unwrap(), SpecifierKind::Bare);
        // Drive-letter-like names are not URLs
        assert_eq!(classify("c:stuff").unwrap(), SpecifierKind::Bare);
    }

    #[test]
    fn test_classify_invalid() {
        assert!(matches!(classify(""), Err(LoaderError::InvalidSpecifier(_))));
        assert!(matches!(classify("a\0b"), Err(LoaderError::InvalidSpecifier(_))));
    }
}
