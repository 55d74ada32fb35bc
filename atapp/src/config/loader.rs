// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Configuration file loading and merging
//!
//! A configuration is one YAML file plus the transitive closure of the
//! files it lists under `atapp.config.external`. Includes are merged
//! *after* their parent: mappings merge key-wise, anything else is
//! replaced by the later value. Include cycles are detected by canonical
//! path and silently skipped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use super::AppConfig;
use crate::errors::AppError;

fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn external_includes(root: &Value) -> Vec<String> {
    root.get("atapp")
        .and_then(|v| v.get("config"))
        .and_then(|v| v.get("external"))
        .and_then(|v| v.as_sequence())
        .map(|seq| {
            seq.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn canonical_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn load_one(path: &Path) -> Result<Value, AppError> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        tracing::error!("failed to read configure file {}: {err}", path.display());
        AppError::LoadConfigureFile
    })?;
    serde_yaml::from_str(&text).map_err(|err| {
        tracing::error!("failed to parse configure file {}: {err}", path.display());
        AppError::LoadConfigureFile
    })
}

/// Load `path` and every file it transitively includes, producing the
/// merged raw tree. Relative include paths resolve against the including
/// file's directory.
pub fn load_tree(path: &Path) -> Result<Value, AppError> {
    let mut merged = Value::Null;
    let mut loaded: HashSet<PathBuf> = HashSet::new();
    let mut pending: Vec<PathBuf> = vec![path.to_path_buf()];

    while let Some(next) = pending.pop() {
        if !loaded.insert(canonical_key(&next)) {
            continue;
        }

        let tree = load_one(&next)?;
        let includes = external_includes(&tree);
        merge_value(&mut merged, tree);

        let base_dir = next.parent().map(Path::to_path_buf).unwrap_or_default();
        // preserve listed order; includes load after their parent
        for include in includes.iter().rev() {
            let include_path = base_dir.join(include);
            pending.push(include_path);
        }
    }

    Ok(merged)
}

/// Load and deserialize the `atapp:` root of a configuration file set.
pub fn load_app_config(path: &Path) -> Result<AppConfig, AppError> {
    let tree = load_tree(path)?;
    let Some(atapp) = tree.get("atapp").cloned() else {
        tracing::error!(
            "configure file {} has no 'atapp' root mapping",
            path.display()
        );
        return Err(AppError::LoadConfigureFile);
    };
    serde_yaml::from_value(atapp).map_err(|err| {
        tracing::error!("invalid configure tree in {}: {err}", path.display());
        AppError::LoadConfigureFile
    })
}
