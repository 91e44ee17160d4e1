// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Small helpers shared by components and controllers.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::api::ObjectMeta;
use sha2::{Digest, Sha256};

use crate::apis::constants::{CONFIRMATION_DELETION, CONFIRMATION_DELETION_DEPRECATED};

pub mod retry;

/// Merges the given maps; later maps win on conflicting keys.
pub fn merge_string_maps<'a, I>(maps: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a BTreeMap<String, String>>,
{
    let mut out = BTreeMap::new();
    for map in maps {
        out.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}

/// Builds a string map from literal pairs.
pub fn string_map<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Hex encoded SHA-256 of `data`.
pub fn compute_checksum(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Formats a duration the way `metav1.Duration` serializes it, e.g. `5m0s`,
/// `360h0m0s` or `500ms`.
pub fn go_duration_string(d: Duration) -> String {
    let total = d.as_secs();
    if total == 0 {
        let millis = d.subsec_millis();
        return if millis == 0 {
            "0s".to_string()
        } else {
            format!("{millis}ms")
        };
    }

    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// `namespace/name`, or just `name` for cluster-scoped objects.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// Checks that the object carries a deletion confirmation annotation set to
/// a true boolean value.
pub fn check_if_deletion_is_confirmed(meta: &ObjectMeta) -> Result<(), String> {
    let confirmed = meta.annotations.as_ref().is_some_and(|annotations| {
        [CONFIRMATION_DELETION, CONFIRMATION_DELETION_DEPRECATED]
            .iter()
            .filter_map(|key| annotations.get(*key))
            .any(|value| parse_bool(value) == Some(true))
    });
    if confirmed {
        Ok(())
    } else {
        Err(format!("must have a {CONFIRMATION_DELETION:?} annotation to delete"))
    }
}

/// Parses booleans the way `strconv.ParseBool` accepts them.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_string_maps_later_wins() {
        let a = string_map([("a", "1"), ("b", "1")]);
        let b = string_map([("b", "2")]);
        let merged = merge_string_maps([&a, &b]);
        assert_eq!(merged, string_map([("a", "1"), ("b", "2")]));
    }

    #[test]
    fn test_compute_checksum() {
        assert_eq!(
            compute_checksum("foo"),
            "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae"
        );
    }

    #[test]
    fn test_go_duration_string() {
        assert_eq!(go_duration_string(Duration::from_secs(300)), "5m0s");
        assert_eq!(go_duration_string(Duration::from_secs(12 * 3600)), "12h0m0s");
        assert_eq!(go_duration_string(Duration::from_secs(15 * 24 * 3600)), "360h0m0s");
        assert_eq!(go_duration_string(Duration::from_secs(10)), "10s");
        assert_eq!(go_duration_string(Duration::from_millis(500)), "500ms");
        assert_eq!(go_duration_string(Duration::ZERO), "0s");
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key(Some("garden"), "foo"), "garden/foo");
        assert_eq!(object_key(None, "foo"), "foo");
    }

    #[test]
    fn test_check_if_deletion_is_confirmed() {
        let meta = |annotations: &[(&str, &str)]| ObjectMeta {
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };

        assert!(check_if_deletion_is_confirmed(&ObjectMeta::default()).is_err());
        assert!(check_if_deletion_is_confirmed(&meta(&[(CONFIRMATION_DELETION, "false")])).is_err());
        assert!(check_if_deletion_is_confirmed(&meta(&[(CONFIRMATION_DELETION, "yes")])).is_err());
        assert!(check_if_deletion_is_confirmed(&meta(&[(CONFIRMATION_DELETION, "true")])).is_ok());
        assert!(check_if_deletion_is_confirmed(&meta(&[(CONFIRMATION_DELETION_DEPRECATED, "1")])).is_ok());
        assert_eq!(
            check_if_deletion_is_confirmed(&ObjectMeta::default()).unwrap_err(),
            r#"must have a "confirmation.gardener.cloud/deletion" annotation to delete"#
        );
    }
}
