//! JSON patch builders.
//!
//! Every builder only reads the pod it is given and returns the operations
//! that would produce the desired state; the caller's objects are never
//! modified.

use std::collections::BTreeMap;

use api_types::PatchOperation;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::VolumeMount;
use serde::Serialize;
use serde_json::Value;

use super::LIBRARY_PATH_ENV;

const ANNOTATIONS_PATH: &str = "/metadata/annotations";

/// Escape a single reference token for embedding in a JSON pointer.
pub fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Inverse of [`escape_pointer_token`].
pub fn unescape_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Append `added` to the list at `base_path`.
///
/// An empty target cannot be appended to, so the whole list is added at
/// `base_path` in one operation. Otherwise each element is appended with the
/// `/-` end-of-array token.
pub fn append_or_init<T: Serialize>(
    target: &[T],
    added: &[T],
    base_path: &str,
) -> Result<Vec<PatchOperation>, serde_json::Error> {
    if added.is_empty() {
        return Ok(Vec::new());
    }
    if target.is_empty() {
        return Ok(vec![PatchOperation::add(
            base_path,
            serde_json::to_value(added)?,
        )]);
    }
    added
        .iter()
        .map(|item| Ok(PatchOperation::add(format!("{base_path}/-"), serde_json::to_value(item)?)))
        .collect()
}

/// Set each of `added` on the pod's annotations.
///
/// Decisions are taken against `target` as submitted: a missing
/// map is created with all new keys at once, an existing map gets one member
/// `add` per new key and one `replace` per key that already has a value.
pub fn annotate(
    target: Option<&BTreeMap<String, String>>,
    added: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    let Some(target) = target.filter(|annotations| !annotations.is_empty()) else {
        if added.is_empty() {
            return Vec::new();
        }
        let map: serde_json::Map<String, Value> = added
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        return vec![PatchOperation::add(ANNOTATIONS_PATH, Value::Object(map))];
    };

    added
        .iter()
        .map(|(key, value)| {
            let path = format!("{ANNOTATIONS_PATH}/{}", escape_pointer_token(key));
            match target.get(key) {
                Some(existing) if !existing.is_empty() => {
                    PatchOperation::replace(path, value.as_str())
                }
                _ => PatchOperation::add(path, value.as_str()),
            }
        })
        .collect()
}

/// Write a whole array field of a container, replacing it when it exists.
pub fn set_container_field<T: Serialize>(
    container_path: &str,
    field: &str,
    exists: bool,
    value: &T,
) -> Result<PatchOperation, serde_json::Error> {
    let path = format!("{container_path}/{field}");
    let value = serde_json::to_value(value)?;
    Ok(if exists {
        PatchOperation::replace(path, value)
    } else {
        PatchOperation::add(path, value)
    })
}

/// Merge the sidecar mounts and the client library path into a container.
///
/// Returns the `volumeMounts` and `env` operations for the container at
/// `container_path`.
pub fn merge_runtime_environment(
    container: &Container,
    container_path: &str,
    mounts: &[VolumeMount],
    library_path: &str,
) -> Result<Vec<PatchOperation>, serde_json::Error> {
    let mut volume_mounts = container.volume_mounts.clone().unwrap_or_default();
    volume_mounts.extend(mounts.iter().cloned());

    let mut env = container.env.clone().unwrap_or_default();
    match env.iter_mut().find(|var| var.name == LIBRARY_PATH_ENV) {
        Some(var) => {
            let merged = match var.value.as_deref() {
                Some(current) if !current.is_empty() => format!("{library_path}:{current}"),
                _ => library_path.to_string(),
            };
            var.value = Some(merged);
        }
        None => env.push(EnvVar {
            name: LIBRARY_PATH_ENV.to_string(),
            value: Some(library_path.to_string()),
            ..Default::default()
        }),
    }

    Ok(vec![
        set_container_field(
            container_path,
            "volumeMounts",
            container.volume_mounts.is_some(),
            &volume_mounts,
        )?,
        set_container_field(container_path, "env", container.env.is_some(), &env)?,
    ])
}
