// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Default resolution algorithm: the innermost link of the resolve chain.
//!
//! Relative and absolute specifiers resolve against the importer's
//! directory with a fixed extension probing order and a directory fallback
//! (manifest `main`, then index files). Bare specifiers walk parent
//! directories looking for the package directory. URL specifiers map
//! `file:` to paths, serve `data:` inline, and gate remote schemes behind
//! policy.

use crate::builtins::BuiltinRegistry;
use crate::config::LoaderOptions;
use crate::error::{LoaderError, Result};
use crate::hooks::{Resolution, ResolveRequest};
use crate::manifest::PackageManifest;
use crate::registry::ModuleFormat;
use crate::scan::{self, SyntaxSignal};
use crate::source::{ContentSource, SourceText, decode_data_url};
use crate::specifier::{BUILTIN_PREFIX, SpecifierKind, classify};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// The always-present innermost resolver
pub struct DefaultResolver {
    options: Arc<LoaderOptions>,
    builtins: Arc<BuiltinRegistry>,
    content: Arc<dyn ContentSource>,
}

impl DefaultResolver {
    /// Create a resolver over the given policy, builtin table, and storage
    pub fn new(
        options: Arc<LoaderOptions>,
        builtins: Arc<BuiltinRegistry>,
        content: Arc<dyn ContentSource>,
    ) -> Self {
        Self {
            options,
            builtins,
            content,
        }
    }

    /// Resolve a request to a canonical id and format
    pub fn resolve(&self, request: &ResolveRequest) -> Result<Resolution> {
        let specifier = request.specifier.as_str();
        let kind = classify(specifier)?;
        tracing::debug!("default resolve '{specifier}' ({kind:?})");

        match kind {
            SpecifierKind::Builtin => {
                let name = &specifier[BUILTIN_PREFIX.len()..];
                self.resolve_builtin(specifier, name)
            }
            SpecifierKind::Bare if self.builtins.contains(specifier) => {
                self.resolve_builtin(specifier, specifier)
            }
            SpecifierKind::Relative => {
                let base = self.parent_dir(request)?;
                self.resolve_path_candidate(&base.join(specifier), specifier)
            }
            SpecifierKind::Absolute => {
                self.resolve_path_candidate(&PathBuf::from(specifier), specifier)
            }
            SpecifierKind::Url => self.resolve_url(specifier),
            SpecifierKind::Bare => self.resolve_package(specifier, request),
        }
    }

    fn resolve_builtin(&self, specifier: &str, name: &str) -> Result<Resolution> {
        if !self.builtins.contains(name) {
            return Err(LoaderError::not_found(specifier));
        }
        let id = format!("{BUILTIN_PREFIX}{name}");
        Ok(Resolution::new(id, ModuleFormat::Builtin).short_circuited())
    }

    /// Directory that anchors relative and bare resolution for a request
    fn parent_dir(&self, request: &ResolveRequest) -> Result<PathBuf> {
        match request.parent.as_deref() {
            Some(parent) => {
                if matches!(classify(parent), Ok(SpecifierKind::Url))
                    || parent.starts_with(BUILTIN_PREFIX)
                {
                    return Err(LoaderError::InvalidSpecifier(format!(
                        "'{}' cannot be resolved relative to non-filesystem module '{parent}'",
                        request.specifier
                    )));
                }
                Ok(Path::new(parent)
                    .parent()
                    .unwrap_or(Path::new("."))
                    .to_path_buf())
            }
            None => Ok(std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
        }
    }

    fn resolve_path_candidate(&self, path: &Path, specifier: &str) -> Result<Resolution> {
        if path.is_file() {
            return self.finish_file(path);
        }

        for ext in &self.options.extensions {
            let candidate = append_extension(path, ext);
            if candidate.is_file() {
                return self.finish_file(&candidate);
            }
        }

        if path.is_dir() {
            return self.resolve_directory(path);
        }

        Err(LoaderError::not_found(specifier))
    }

    /// Directory fallback: manifest `main` first, then index files
    fn resolve_directory(&self, dir: &Path) -> Result<Resolution> {
        if let Some(manifest) = PackageManifest::read_from(dir) {
            if let Some(main) = &manifest.main {
                let main_path = dir.join(main);
                if main_path.is_file() {
                    return self.finish_file(&main_path);
                }
                for ext in &self.options.extensions {
                    let candidate = append_extension(&main_path, ext);
                    if candidate.is_file() {
                        return self.finish_file(&candidate);
                    }
                }
            }
        }

        for ext in &self.options.extensions {
            let index = dir.join(format!("index{ext}"));
            if index.is_file() {
                return self.finish_file(&index);
            }
        }

        Err(LoaderError::not_found(dir.display().to_string()))
    }

    /// Walk parent directories looking for the package directory
    fn resolve_package(&self, specifier: &str, request: &ResolveRequest) -> Result<Resolution> {
        let (name, subpath) = parse_package_specifier(specifier);
        let start = self.parent_dir(request)?;

        for dir in start.ancestors() {
            let package_root = dir.join(&self.options.package_dir).join(name);
            if !package_root.exists() {
                continue;
            }
            let attempt = match subpath {
                Some(sub) => self.resolve_path_candidate(&package_root.join(sub), specifier),
                None => self.resolve_directory(&package_root),
            };
            match attempt {
                Ok(resolution) => return Ok(resolution),
                // A miss in this candidate root keeps the walk going
                Err(LoaderError::NotFound(_)) => continue,
                Err(other) => return Err(other),
            }
        }

        Err(LoaderError::not_found(specifier))
    }

    fn resolve_url(&self, specifier: &str) -> Result<Resolution> {
        let url = Url::parse(specifier)
            .map_err(|e| LoaderError::InvalidSpecifier(format!("{specifier}: {e}")))?;

        match url.scheme() {
            "file" => {
                let path = url.to_file_path().map_err(|_| {
                    LoaderError::InvalidSpecifier(format!("{specifier}: not a local file URL"))
                })?;
                self.resolve_path_candidate(&path, specifier)
            }
            "data" => {
                let (mime, bytes) = decode_data_url(specifier)?;
                let format = match mime.as_str() {
                    "application/json" => ModuleFormat::Json,
                    "text/javascript" | "application/javascript" => ModuleFormat::DataUrl,
                    other => {
                        return Err(LoaderError::format_mismatch(
                            specifier,
                            format!("unsupported data URL mime type '{other}'"),
                        ));
                    }
                };
                Ok(Resolution::new(specifier, format)
                    .with_source(SourceText::from_bytes(bytes)))
            }
            "http" | "https" => {
                if !self.options.allow_network_imports {
                    return Err(LoaderError::NetworkImportDisallowed(specifier.to_string()));
                }
                // Fetching is the content source's business; resolution only
                // establishes identity and format.
                Ok(Resolution::new(specifier, ModuleFormat::Esm))
            }
            scheme => Err(LoaderError::InvalidSpecifier(format!(
                "{specifier}: unsupported URL scheme '{scheme}'"
            ))),
        }
    }

    /// Canonicalize a hit and determine its format
    fn finish_file(&self, path: &Path) -> Result<Resolution> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let id = path.display().to_string();
        let (format, source) = self.format_for_path(&path, &id)?;
        let mut resolution = Resolution::new(id, format);
        if let Some(source) = source {
            resolution = resolution.with_source(source);
        }
        Ok(resolution)
    }

    /// Format precedence: extension, then nearest manifest `type`, then a
    /// syntax scan. A source showing both idioms with no stronger signal is
    /// rejected rather than guessed at.
    fn format_for_path(
        &self,
        path: &Path,
        id: &str,
    ) -> Result<(ModuleFormat, Option<SourceText>)> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("mjs") => return Ok((ModuleFormat::Esm, None)),
            Some("cjs") => return Ok((ModuleFormat::CommonJs, None)),
            Some("json") => return Ok((ModuleFormat::Json, None)),
            Some("node") => return Ok((ModuleFormat::Addon, None)),
            _ => {}
        }

        if let Some((_, manifest)) = PackageManifest::nearest(path) {
            if let Some(format) = manifest.declared_format() {
                return Ok((format, None));
            }
        }

        let Some(bytes) = self.content.read_sync(id)? else {
            return Err(LoaderError::not_found(id));
        };
        let source = SourceText::from_bytes(bytes);
        let Some(text) = source.as_str() else {
            return Err(LoaderError::format_mismatch(id, "source is not valid UTF-8"));
        };
        let format = match scan::scan(text, self.options.scan_limit).signal() {
            SyntaxSignal::Esm => ModuleFormat::Esm,
            SyntaxSignal::Cjs | SyntaxSignal::Neither => ModuleFormat::CommonJs,
            SyntaxSignal::Both => return Err(LoaderError::AmbiguousSyntax(id.to_string())),
        };
        // The read is handed onward so the load chain need not repeat it
        Ok((format, Some(source)))
    }
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(ext);
    PathBuf::from(os)
}

/// Split a bare specifier into package name and optional subpath.
/// Scoped packages (`@scope/name/sub`) keep the scope in the name.
fn parse_package_specifier(specifier: &str) -> (&str, Option<&str>) {
    if let Some(rest) = specifier.strip_prefix('@') {
        if let Some(scope_sep) = rest.find('/') {
            let after_scope = &rest[scope_sep + 1..];
            if let Some(sub_sep) = after_scope.find('/') {
                let name_end = 1 + scope_sep + 1 + sub_sep;
                return (&specifier[..name_end], Some(&specifier[name_end + 1..]));
            }
        }
        (specifier, None)
    } else if let Some(sep) = specifier.find('/') {
        (&specifier[..sep], Some(&specifier[sep + 1..]))
    } else {
        (specifier, None)
    }
}
