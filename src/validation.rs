//! Validation of names that arrive from remote systems before they touch the filesystem.

/// Reasons a peer-supplied file name is refused.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FilenameError {
    #[error("file name is empty")]
    Empty,

    #[error("file name '{0}' refers to a directory")]
    DirectoryReference(String),

    #[error("file name contains control characters")]
    ControlCharacters,

    #[error("file name is too long (maximum {max} bytes)")]
    TooLong { max: usize },
}

pub const MAX_FILENAME_LEN: usize = 255;

/// Reduce a peer-supplied name to its final path component.
///
/// Both `/` and `\` are treated as separators regardless of platform so a
/// DOS-style path cannot smuggle `..` through. `.` and `..` and empty results
/// are rejected.
pub fn sanitize_inbound_filename(name: &str) -> Result<String, FilenameError> {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    if base.is_empty() {
        return Err(FilenameError::Empty);
    }
    if base == "." || base == ".." {
        return Err(FilenameError::DirectoryReference(base.to_string()));
    }
    if base.chars().any(|c| c.is_control()) {
        return Err(FilenameError::ControlCharacters);
    }
    if base.len() > MAX_FILENAME_LEN {
        return Err(FilenameError::TooLong { max: MAX_FILENAME_LEN });
    }
    Ok(base.to_string())
}

/// Case-insensitive `*.pkt` check used by both queue directories.
pub fn is_packet_name(name: &str) -> bool {
    !name.starts_with('.') && name.len() > 4 && name.to_ascii_lowercase().ends_with(".pkt")
}
