//! Saving answers as Markdown files.

use std::fs::OpenOptions;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Result, WeavrError};
use crate::path_guard;

/// File name for a saved answer.
///
/// Whitespace runs become `-`; only word characters, `-` and `_` are kept;
/// the stem is cut to `max_len` characters. An empty stem becomes `untitled`.
pub fn sanitize_filename(title: &str, max_len: usize) -> String {
    let mut stem = String::new();
    let mut in_space = false;
    for c in title.trim().chars() {
        if c.is_whitespace() {
            if !in_space {
                stem.push('-');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if c.is_alphanumeric() || c == '_' || c == '-' {
            stem.push(c);
        }
    }

    let stem: String = stem.chars().take(max_len).collect();
    let stem = stem.trim_matches('-');
    if stem.is_empty() {
        "untitled.md".to_string()
    } else {
        format!("{stem}.md")
    }
}

/// Write `body` under `# title` into `dir`, returning the file path.
///
/// An existing regular file with the same name is replaced; a symbolic link
/// is refused.
pub fn write_markdown(dir: &Path, title: &str, body: &str, max_len: usize) -> Result<PathBuf> {
    path_guard::validate(dir, true)?;

    let path = dir.join(sanitize_filename(title, max_len));
    match std::fs::symlink_metadata(&path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(WeavrError::security(&path, "refusing to write through a symbolic link"));
        }
        Ok(meta) if !meta.is_file() => {
            return Err(WeavrError::not_found(&path, "target exists and is not a regular file"));
        }
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => WeavrError::permission(&path, e.to_string()),
            _ => e.into(),
        })?;

    let mut writer = BufWriter::new(file);
    writeln!(writer, "# {}\n", title.trim())?;
    writer.write_all(body.as_bytes())?;
    if !body.ends_with('\n') {
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    info!(path = %path.display(), "saved answer");
    Ok(path)
}
