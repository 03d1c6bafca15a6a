use std::io::{Cursor, Read};

use common::error::AppError;
use tracing::warn;

/// Largest single archive member that will be unpacked.
const MAX_ENTRY_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadContents {
    pub files: Vec<DiscoveredFile>,
    /// Archive members dropped because of the entry cap.
    pub truncated: u32,
}

pub fn guess_mime(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn is_zip(file_name: &str, bytes: &[u8]) -> bool {
    let lower = file_name.to_ascii_lowercase();
    lower.ends_with(".zip") || (bytes.starts_with(b"PK\x03\x04") && !lower.ends_with(".docx"))
}

fn is_noise(path: &str) -> bool {
    path.ends_with('/')
        || path.starts_with("__MACOSX/")
        || path
            .rsplit('/')
            .next()
            .is_some_and(|name| name.starts_with('.') || name.is_empty())
}

/// Lists the documents in an upload. Zip archives are expanded up to `max_entries` members;
/// anything else is a single document.
pub fn discover_files(
    file_name: &str,
    bytes: Vec<u8>,
    max_entries: usize,
) -> Result<UploadContents, AppError> {
    if !is_zip(file_name, &bytes) {
        return Ok(UploadContents {
            files: vec![DiscoveredFile {
                name: file_name.to_string(),
                mime_type: guess_mime(file_name),
                bytes,
            }],
            truncated: 0,
        });
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice())).map_err(|err| {
        AppError::UnsupportedFormat(format!("{file_name} is not a readable zip archive: {err}"))
    })?;

    let mut contents = UploadContents::default();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|err| {
            AppError::UnsupportedFormat(format!("{file_name}: unreadable archive entry: {err}"))
        })?;
        let path = entry.name().to_string();
        if entry.is_dir() || is_noise(&path) {
            continue;
        }
        if contents.files.len() >= max_entries {
            contents.truncated = contents.truncated.saturating_add(1);
            continue;
        }

        let mut data = Vec::new();
        (&mut entry)
            .take(MAX_ENTRY_BYTES)
            .read_to_end(&mut data)?;
        if data.len() as u64 >= MAX_ENTRY_BYTES {
            warn!(archive = file_name, entry = %path, "archive member exceeds size limit; skipped");
            continue;
        }

        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        contents.files.push(DiscoveredFile {
            mime_type: guess_mime(&name),
            name,
            bytes: data,
        });
    }

    if contents.truncated > 0 {
        warn!(
            archive = file_name,
            kept = contents.files.len(),
            dropped = contents.truncated,
            "archive entry limit reached; remaining members ignored"
        );
    }

    Ok(contents)
}
