//! Path helpers for the `{repoId}:{path}` keyspace.

use super::ClientError;

/// Path of the repo root document
pub const ROOT: &str = "/";

/// Ancestor directory paths from nearest to the top-most, excluding the root.
///
/// `/a/b/file` -> `["/a/b", "/a"]`, `/file` -> `[]`
pub fn parent_paths(path: &str) -> Vec<String> {
    let mut parents = Vec::new();
    let mut current = path.trim_end_matches('/');
    while let Some(idx) = current.rfind('/') {
        current = &current[..idx];
        if current.is_empty() {
            break;
        }
        parents.push(current.to_string());
    }
    parents
}

/// Final segment of a path
pub fn leaf_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Path of a named child inside a directory
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Store key for a path inside a repo
pub fn doc_key(repo_id: &str, path: &str) -> String {
    format!("{}:{}", repo_id, path)
}

/// Split a store key into `(repo_id, path)`
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// Repo ids become key prefixes, so they may not contain the separator.
pub fn validate_repo_id(repo_id: &str) -> Result<(), ClientError> {
    let valid = !repo_id.is_empty()
        && repo_id.len() <= 128
        && repo_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ClientError::bad_request(format!("invalid repo id: {:?}", repo_id)))
    }
}

/// Check that a path names a file: absolute, no empty, `.` or `..` segments.
pub fn validate_file_path(path: &str) -> Result<(), ClientError> {
    if !path.starts_with('/') || path == ROOT {
        return Err(ClientError::bad_request(format!("invalid path: {:?}", path)));
    }
    for segment in path[1..].split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(ClientError::bad_request(format!("invalid path: {:?}", path)));
        }
    }
    Ok(())
}
