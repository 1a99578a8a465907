// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! JSON Patch application for mutating admission webhooks.
//!
//! Webhooks return RFC 6902 operations restricted to `add`, `replace`, and
//! `remove`. Patch paths address the resource's spec object and come in two
//! accepted spellings:
//!
//! - `/spec/x` - explicit, preferred
//! - `/x` - spec-relative shorthand, kept for compatibility; a deprecation
//!   warning is logged when it is used
//!
//! Both forms resolve against the spec document before being handed to the
//! `json-patch` crate. Any failing operation aborts the admission chain.

use json_patch::{Patch, PatchOperation};
use serde_json::Value;
use tracing::warn;

use crate::errors::{Error, Result};

/// Apply webhook patches to a spec document, sequentially.
///
/// # Errors
///
/// `AdmissionDenied("invalid patch: ...")` when an operation is not one of
/// `add`/`replace`/`remove`, a path is malformed, or application fails
/// (e.g. `remove` on a missing key).
pub fn apply_patches(webhook: &str, spec: &mut Value, patches: Vec<PatchOperation>) -> Result<()> {
    let normalized: Vec<PatchOperation> = patches
        .into_iter()
        .map(|op| normalize_operation(webhook, op))
        .collect::<Result<_>>()?;

    json_patch::patch(spec, &Patch(normalized))
        .map_err(|e| Error::AdmissionDenied(format!("invalid patch: {e}")))
}

fn normalize_operation(webhook: &str, op: PatchOperation) -> Result<PatchOperation> {
    match op {
        PatchOperation::Add(mut add) => {
            add.path = normalize_path(webhook, &add.path)?;
            Ok(PatchOperation::Add(add))
        }
        PatchOperation::Replace(mut replace) => {
            replace.path = normalize_path(webhook, &replace.path)?;
            Ok(PatchOperation::Replace(replace))
        }
        PatchOperation::Remove(mut remove) => {
            remove.path = normalize_path(webhook, &remove.path)?;
            Ok(PatchOperation::Remove(remove))
        }
        other => Err(Error::AdmissionDenied(format!(
            "invalid patch: operation {other:?} is not supported (use add, replace, remove)"
        ))),
    }
}

/// Resolve a patch path against the spec object.
///
/// `/spec/x` and `/x` both become `/x`; a bare `/spec` addresses the whole
/// spec document.
fn normalize_path(webhook: &str, path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::AdmissionDenied(format!(
            "invalid patch: path {path:?} must start with '/'"
        )));
    }

    if path == "/spec" {
        return Ok(String::new());
    }
    if let Some(rest) = path.strip_prefix("/spec/") {
        return Ok(format!("/{rest}"));
    }

    warn!(
        webhook = webhook,
        path = path,
        "Patch path without /spec prefix is deprecated; treating it as spec-relative"
    );
    Ok(path.to_string())
}

#[cfg(test)]
#[path = "patch_tests.rs"]
mod patch_tests;
