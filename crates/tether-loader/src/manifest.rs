// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Minimal package manifest handling.
//!
//! Only the fields resolution consults are parsed; everything else in a
//! manifest is ignored. An unparseable manifest is treated as absent.

use crate::registry::ModuleFormat;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Manifest file name looked for in package directories
pub const MANIFEST_FILE: &str = "package.json";

/// The subset of a package manifest the resolver reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageManifest {
    /// Entry point of the package directory
    pub main: Option<String>,
    /// Declared module idiom ("module" or "commonjs")
    #[serde(rename = "type")]
    pub type_field: Option<String>,
}

impl PackageManifest {
    /// Read the manifest in `dir`, if there is a usable one
    pub fn read_from(dir: &Path) -> Option<PackageManifest> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Walk from `start`'s directory upward to the nearest manifest
    pub fn nearest(start: &Path) -> Option<(PathBuf, PackageManifest)> {
        let mut current = start.parent();
        while let Some(dir) = current {
            if let Some(manifest) = Self::read_from(dir) {
                return Some((dir.to_path_buf(), manifest));
            }
            current = dir.parent();
        }
        None
    }

    /// Module format the `type` field declares, if any
    pub fn declared_format(&self) -> Option<ModuleFormat> {
        match self.type_field.as_deref() {
            Some("module") => Some(ModuleFormat::Esm),
            Some("commonjs") => Some(ModuleFormat::CommonJs),
            _ => None,
        }
    }
}
