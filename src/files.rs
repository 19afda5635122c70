use std::fs;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::MedStoreError;

/// MIME type of raw DICOM payloads.
pub const DICOM_MIME: &str = "application/dicom";

/// Extensions accepted for import. Raw DICOM has no mandated extension, so
/// extensionless files count too; a trailing `.gz` wrapper is stripped first.
const DICOM_EXTENSIONS: [&str; 4] = ["", "dcm", "ima", "dicom"];

/// Resolve the MIME type for an import candidate, or reject it.
pub fn file_mime(path: &Path) -> Result<&'static str, MedStoreError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut stem = name.as_str();
    if let Some(prefix) = stem.strip_suffix(".gz") {
        stem = prefix;
    }
    let extension = stem.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    if DICOM_EXTENSIONS.contains(&extension) {
        Ok(DICOM_MIME)
    } else {
        Err(MedStoreError::UnsupportedFile(path.to_path_buf()))
    }
}

/// Recursively collect importable DICOM files under `root`.
///
/// Dot-files are skipped; unsupported files are skipped with a warning
/// rather than failing the walk. Results are sorted for stable batching.
pub fn find_dicom_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        match file_mime(entry.path()) {
            Ok(_) => found.push(entry.into_path()),
            Err(_) => warn!("skipping unsupported file {}", entry.path().display()),
        }
    }
    found.sort();
    found
}

/// Provide a unique path by appending a ` (n)` counter before the extension.
pub fn uniquify_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let raw = path.display().to_string();
    let (stem, extension) = split_extension(&raw);
    let mut counter = 1;
    loop {
        let candidate = PathBuf::from(format!("{stem} ({counter}){extension}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Split a path string into (stem, extension), keeping `.gz` double
/// extensions together.
fn split_extension(raw: &str) -> (&str, String) {
    let Some((stem, ext)) = raw.rsplit_once('.') else {
        return (raw, String::new());
    };
    if ext.eq_ignore_ascii_case("gz") {
        if let Some((inner_stem, inner_ext)) = stem.rsplit_once('.') {
            return (inner_stem, format!(".{inner_ext}.{ext}"));
        }
    }
    (stem, format!(".{ext}"))
}

/// Check for the gzip magic prefix.
pub fn is_gzipped_data(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Check for the `DICM` magic at offset 128, looking through a gzip wrapper.
pub fn is_dicom_file(path: &Path) -> Result<bool, MedStoreError> {
    let data = fs::read(path)?;
    let head = if is_gzipped_data(&data) {
        use std::io::Read;
        let mut decoder = GzDecoder::new(data.as_slice());
        let mut head = vec![0u8; 132];
        match decoder.read_exact(&mut head) {
            Ok(()) => head,
            Err(_) => return Ok(false),
        }
    } else {
        data
    };
    Ok(head.len() >= 132 && &head[128..132] == b"DICM")
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;

    #[test]
    fn recognizes_dicom_extensions() {
        assert!(file_mime(Path::new("a.dcm")).is_ok());
        assert!(file_mime(Path::new("a.DCM")).is_ok());
        assert!(file_mime(Path::new("a.ima")).is_ok());
        assert!(file_mime(Path::new("a.dcm.gz")).is_ok());
        assert!(file_mime(Path::new("noextension")).is_ok());
        assert!(file_mime(Path::new("a.txt")).is_err());
        assert!(file_mime(Path::new("a.json")).is_err());
    }

    #[test]
    fn walks_directories_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("study1");
        fs::create_dir_all(&nested).unwrap();
        File::create(dir.path().join("a.dcm")).unwrap();
        File::create(nested.join("b")).unwrap();
        File::create(nested.join(".hidden.dcm")).unwrap();
        File::create(nested.join("notes.txt")).unwrap();

        let found = find_dicom_files(dir.path());
        let names = found
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.dcm", "b"]);
    }

    #[test]
    fn uniquify_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dcm");
        assert_eq!(uniquify_path(&path), path);
        File::create(&path).unwrap();
        let unique = uniquify_path(&path);
        assert_eq!(
            unique.file_name().unwrap().to_string_lossy(),
            "out (1).dcm"
        );
        File::create(&unique).unwrap();
        assert_eq!(
            uniquify_path(&path).file_name().unwrap().to_string_lossy(),
            "out (2).dcm"
        );
    }

    #[test]
    fn gzip_magic_detection() {
        assert!(is_gzipped_data(&[0x1f, 0x8b, 0x08]));
        assert!(!is_gzipped_data(b"DICM"));
        assert!(!is_gzipped_data(&[0x1f]));
    }

    #[test]
    fn dicom_magic_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan");
        let mut data = vec![0u8; 128];
        data.extend_from_slice(b"DICM");
        fs::write(&path, &data).unwrap();
        assert!(is_dicom_file(&path).unwrap());

        let bogus = dir.path().join("bogus");
        fs::write(&bogus, b"short").unwrap();
        assert!(!is_dicom_file(&bogus).unwrap());
    }
}
