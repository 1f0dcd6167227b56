// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the module loader.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Errors that can occur while resolving, loading, or evaluating modules
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Specifier is lexically malformed (empty, embedded NUL, unusable scheme)
    #[error("Invalid module specifier '{0}'")]
    InvalidSpecifier(String),

    /// No candidate resolved for the specifier
    #[error("Cannot find module '{0}'")]
    NotFound(String),

    /// Source shows markers of both module idioms and nothing else decides
    #[error("Cannot determine module format of '{0}': source mixes require/exports and import/export syntax")]
    AmbiguousSyntax(String),

    /// Resolution would fetch a non-local URL and policy forbids it
    #[error("Network import of '{0}' is disallowed by the loader policy")]
    NetworkImportDisallowed(String),

    /// Backing store was unreadable or had no content for a resolved id
    #[error("Failed to load '{id}': {reason}")]
    LoadFailed {
        /// Canonical id of the module
        id: String,
        /// Reason for failure
        reason: String,
    },

    /// Content cannot be parsed as its declared format
    #[error("Module '{id}' does not match its declared format: {reason}")]
    FormatMismatch {
        /// Canonical id of the module
        id: String,
        /// Reason for failure
        reason: String,
    },

    /// Dependency can only be produced asynchronously
    #[error("Module '{0}' must be loaded asynchronously and cannot be required synchronously")]
    SyncLoadUnsupported(String),

    /// Attempt to redefine an existing built-in module
    #[error("Built-in module '{0}' cannot be redefined")]
    BuiltinRedefinition(String),

    /// Request outlived a caller-imposed deadline
    #[error("Module request '{specifier}' did not settle within {timeout:?}")]
    NeverSettled {
        /// Specifier of the pending request
        specifier: String,
        /// Deadline the caller imposed
        timeout: Duration,
    },

    /// A hook broke the chain protocol (double `next`, missing short-circuit
    /// acknowledgement, registration during an active pass)
    #[error("Hook protocol violation: {0}")]
    HookProtocolViolation(String),

    /// A loader invariant is broken. Fatal: the registry poisons itself and
    /// every later operation on it fails with this error.
    #[error("Module loader invariant violated: {0}")]
    InternalConsistency(String),

    /// Wrong argument type passed to a built-in function
    #[error("TypeError: {0}")]
    Type(String),

    /// File system error
    #[error("File system error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Failure replayed from a module record that already errored
    #[error("{0}")]
    Cached(Arc<LoaderError>),
}

impl LoaderError {
    /// Create a module not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a load failure
    pub fn load_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a format mismatch
    pub fn format_mismatch(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FormatMismatch {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Strip cached-error wrappers down to the original failure
    pub fn root(&self) -> &LoaderError {
        match self {
            LoaderError::Cached(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether the error is fatal to the whole resolution subsystem
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), LoaderError::InternalConsistency(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_cached_layers() {
        let inner = Arc::new(LoaderError::not_found("x"));
        let wrapped = LoaderError::Cached(Arc::new(LoaderError::Cached(inner)));
        assert!(matches!(wrapped.root(), LoaderError::NotFound(id) if id == "x"));
    }

    #[test]
    fn test_fatality() {
        assert!(LoaderError::InternalConsistency("broken".into()).is_fatal());
        assert!(
            LoaderError::Cached(Arc::new(LoaderError::InternalConsistency("broken".into())))
                .is_fatal()
        );
        assert!(!LoaderError::not_found("x").is_fatal());
    }

    #[test]
    fn test_display_preserves_cached_message() {
        let err = LoaderError::Cached(Arc::new(LoaderError::not_found("left-pad")));
        assert_eq!(err.to_string(), "Cannot find module 'left-pad'");
    }
}
