use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// File types the engine manages. Anything else in a monitored directory is
/// silently ignored.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "gif", "heic", "webp", "tiff"];

/// One file discovered during a scan pass. Ephemeral: exists only for the
/// duration of the pass that found it.
#[derive(Debug, Clone)]
pub struct FileCandidate {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub candidates: Vec<FileCandidate>,
    /// Per-directory/per-entry problems, reported instead of aborting the
    /// pass. The caller turns each into one error event.
    pub errors: Vec<String>,
}

/// Enumerate eligible image files under `root`. Non-recursive scans yield
/// direct children only; recursive scans walk depth-first with an explicit
/// stack. Symlinks are never followed, which also breaks symlink cycles.
/// Each call is independent: no cursor is carried between scans.
pub fn scan(root: &Path, recursive: bool) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                outcome
                    .errors
                    .push(format!("Cannot read directory {}: {}", dir.display(), e));
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    outcome
                        .errors
                        .push(format!("Cannot read entry in {}: {}", dir.display(), e));
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) => {
                    outcome
                        .errors
                        .push(format!("Cannot stat {}: {}", path.display(), e));
                    continue;
                }
            };

            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                if recursive {
                    pending.push(path);
                }
                continue;
            }
            if !has_image_extension(&path) {
                continue;
            }

            match entry.metadata() {
                Ok(meta) => {
                    let modified = meta
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now());
                    let created = meta.created().map(DateTime::<Utc>::from).unwrap_or(modified);
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "unknown".to_string());
                    outcome.candidates.push(FileCandidate {
                        path,
                        file_name,
                        size: meta.len(),
                        modified,
                        created,
                    });
                }
                Err(e) => outcome
                    .errors
                    .push(format!("Cannot stat {}: {}", path.display(), e)),
            }
        }
    }

    outcome
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"data").unwrap();
    }

    #[test]
    fn filters_by_extension_case_insensitively() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.jpg");
        touch(dir.path(), "b.PNG");
        touch(dir.path(), "c.txt");
        touch(dir.path(), "noext");

        let outcome = scan(dir.path(), false);
        let mut names: Vec<_> = outcome.candidates.iter().map(|c| c.file_name.as_str()).collect();
        names.sort();
        assert_eq!(names, ["a.jpg", "b.PNG"]);
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn non_recursive_never_yields_subdirectory_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "top.jpg");
        fs::create_dir(dir.path().join("sub")).unwrap();
        touch(&dir.path().join("sub"), "nested.gif");

        let outcome = scan(dir.path(), false);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].file_name, "top.jpg");
    }

    #[test]
    fn recursive_walks_descendants() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "top.jpg");
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        touch(&dir.path().join("sub"), "nested.gif");
        touch(&dir.path().join("sub/deeper"), "deep.webp");

        let outcome = scan(dir.path(), true);
        assert_eq!(outcome.candidates.len(), 3);
    }

    #[test]
    fn missing_directory_yields_zero_candidates_and_one_error() {
        let outcome = scan(Path::new("/nonexistent/photos"), true);
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn candidates_carry_size_and_timestamps() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("img.jpeg"), vec![0u8; 1234]).unwrap();

        let outcome = scan(dir.path(), false);
        let candidate = &outcome.candidates[0];
        assert_eq!(candidate.size, 1234);
        assert!(candidate.modified <= Utc::now());
    }
}
