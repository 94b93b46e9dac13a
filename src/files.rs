// src/files.rs
use std::path::PathBuf;

/// Join a request path onto the document root. Any `..` segment is
/// rejected so a request can never escape the root.
pub fn resolve_path(doc_root: &str, req_path: &str) -> Option<PathBuf> {
    if req_path.split('/').any(|seg| seg == "..") {
        return None;
    }
    let root = doc_root.trim_end_matches('/');
    let rel = req_path.trim_start_matches('/');
    Some(PathBuf::from(format!("{}/{}", root, rel)))
}

/// MIME type from the file extension, defaulting to octet-stream.
pub fn content_type_for(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
