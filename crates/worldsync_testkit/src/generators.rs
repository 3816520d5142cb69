//! Property-based test generators using proptest.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Strategy for one path segment: short lowercase names, never `.` or `..`.
pub fn segment_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,7}").expect("Invalid regex")
}

/// Strategy for a relative file path of one to three segments.
pub fn rel_path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(segment_strategy(), 1..=3).prop_map(|parts| parts.join("/"))
}

/// Strategy for file contents.
pub fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Strategy for a directory tree: relative path to content.
///
/// Paths that would be both a file and a directory are dropped so the
/// tree can always be written.
pub fn file_tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(rel_path_strategy(), content_strategy(), 0..12).prop_map(
        |tree| {
            let keys: Vec<String> = tree.keys().cloned().collect();
            tree.into_iter()
                .filter(|(path, _)| {
                    let prefix = format!("{path}/");
                    !keys.iter().any(|k| k.starts_with(&prefix))
                })
                .collect()
        },
    )
}

/// Writes a generated tree under `root`.
pub fn write_tree(root: &Path, tree: &BTreeMap<String, Vec<u8>>) {
    for (rel, data) in tree {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        fs::write(path, data).expect("Failed to write file");
    }
}
