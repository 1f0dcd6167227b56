// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader configuration.

use serde::Deserialize;

/// Tunable policy for resolution and loading.
///
/// Fixed for the lifetime of a [`crate::Loader`]; changing policy means
/// constructing a new loader (and with it a fresh module registry).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderOptions {
    /// File extensions probed, in order, when a path has no exact match
    pub extensions: Vec<String>,
    /// Directory name searched during the parent walk for bare specifiers
    pub package_dir: String,
    /// Whether `http:`/`https:` specifiers may resolve at all
    pub allow_network_imports: bool,
    /// Upper bound, in bytes, on source fed to the syntax scanner
    pub scan_limit: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            extensions: vec![
                ".js".to_string(),
                ".mjs".to_string(),
                ".cjs".to_string(),
                ".json".to_string(),
                ".node".to_string(),
            ],
            package_dir: "tether_modules".to_string(),
            allow_network_imports: false,
            scan_limit: 1024 * 1024,
        }
    }
}
