use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use crate::error::ConvertError;
use crate::job::JobTable;
use log::{debug, warn};

/// Extensions of files the converter picks up. Matched case-sensitively.
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "flv", "wmv", "webm", "mpg", "mpeg",
    "3gp", "3g2", "ts", "m4v", "f4v", "rmvb", "vob", "ogv", "divx",
    "xvid", "h264", "h265", "hevc",
];

/// Convertible files currently in the watched directory, with their sizes
pub type WatchedSet = BTreeMap<PathBuf, u64>;

/// Differences between the watched directory and the job table
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanDelta {
    /// Paths that should get a new job
    pub new: Vec<PathBuf>,
    /// Tracked paths that no longer exist on disk
    pub removed: Vec<PathBuf>,
}

impl ScanDelta {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.removed.is_empty()
    }
}

/// Check if a file has a convertible extension
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| MEDIA_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// List convertible files directly inside `dir`.
///
/// Failing to read `dir` itself is fatal. Entries that vanish or cannot be
/// read mid-listing are skipped.
pub fn scan_directory(dir: &Path) -> Result<WatchedSet, ConvertError> {
    let list_error = |source: io::Error| ConvertError::DirectoryList { path: dir.to_path_buf(), source };

    let meta = std::fs::metadata(dir).map_err(list_error)?;
    if !meta.is_dir() {
        return Err(list_error(io::Error::new(io::ErrorKind::Other, "not a directory")));
    }

    let mut watched = WatchedSet::new();
    let walker = WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true);

    for entry in walker.into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => return Err(list_error(e.into())),
            // Repeats every poll (e.g. a dangling symlink), so keep it quiet
            Err(e) => {
                debug!("Skipping unreadable directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_media_file(entry.path()) {
            continue;
        }

        // Stat can race with a file being moved away
        match entry.metadata() {
            Ok(meta) => {
                watched.insert(entry.path().to_path_buf(), meta.len());
            }
            Err(e) => debug!("Skipping {}: {}", entry.path().display(), e),
        }
    }

    Ok(watched)
}

/// Compare the current scan against the job table.
///
/// A tracked path counts as removed only when stat reports it missing;
/// other stat errors are logged and the path is kept.
pub fn reconcile(watched: &WatchedSet, table: &JobTable) -> ScanDelta {
    let new = watched
        .iter()
        .filter(|(path, size)| table.needs_job(path, **size))
        .map(|(path, _)| path.clone())
        .collect();

    let mut removed = Vec::new();
    for path in table.paths() {
        if watched.contains_key(&path) {
            continue;
        }
        match std::fs::metadata(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => removed.push(path),
            Err(e) => warn!("Failed to stat tracked file {}: {}", path.display(), e),
            Ok(_) => {}
        }
    }
    removed.sort();

    ScanDelta { new, removed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::OutcomeKind;
    use std::fs;

    #[test]
    fn test_is_media_file_is_case_sensitive() {
        assert!(is_media_file(Path::new("/c/movie.mp4")));
        assert!(is_media_file(Path::new("/c/show.mkv")));
        assert!(is_media_file(Path::new("/c/clip.3gp")));
        assert!(!is_media_file(Path::new("/c/MOVIE.MP4")));
        assert!(!is_media_file(Path::new("/c/notes.txt")));
        assert!(!is_media_file(Path::new("/c/no_extension")));
        assert!(!is_media_file(Path::new("/c/movie.mp4.part")));
    }

    #[test]
    fn test_scan_filters_by_extension_and_depth() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp4"), b"aaaa").unwrap();
        fs::write(dir.path().join("b.mkv"), b"bb").unwrap();
        fs::write(dir.path().join("readme.txt"), b"text").unwrap();
        fs::write(dir.path().join("UPPER.MP4"), b"x").unwrap();
        fs::create_dir(dir.path().join("Converted")).unwrap();
        fs::write(dir.path().join("Converted").join("c.mp4"), b"c").unwrap();
        fs::create_dir(dir.path().join("folder.mkv")).unwrap();

        let watched = scan_directory(dir.path()).unwrap();
        let names: Vec<_> = watched.keys().map(|p| p.file_name().unwrap().to_owned()).collect();
        assert_eq!(names, vec!["a.mp4", "b.mkv"]);
        assert_eq!(watched[&dir.path().join("a.mp4")], 4);
        assert_eq!(watched[&dir.path().join("b.mkv")], 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp4"), b"aaaa").unwrap();
        std::os::unix::fs::symlink(dir.path().join("nowhere.mkv"), dir.path().join("link.mkv")).unwrap();

        let watched = scan_directory(dir.path()).unwrap();
        assert_eq!(watched.keys().cloned().collect::<Vec<_>>(), vec![dir.path().join("a.mp4")]);
    }

    #[test]
    fn test_scan_missing_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let err = scan_directory(&missing).unwrap_err();
        assert!(matches!(err, ConvertError::DirectoryList { .. }));
    }

    #[test]
    fn test_scan_file_as_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(scan_directory(&file), Err(ConvertError::DirectoryList { .. })));
    }

    #[test]
    fn test_reconcile_new_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mp4");
        let b = dir.path().join("b.mkv");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let mut table = JobTable::new();
        let delta = reconcile(&scan_directory(dir.path()).unwrap(), &table);
        assert_eq!(delta.new, vec![a.clone(), b.clone()]);
        assert!(delta.removed.is_empty());

        table.register(&a);
        table.register(&b);
        let delta = reconcile(&scan_directory(dir.path()).unwrap(), &table);
        assert!(delta.is_empty());

        fs::remove_file(&b).unwrap();
        let delta = reconcile(&scan_directory(dir.path()).unwrap(), &table);
        assert!(delta.new.is_empty());
        assert_eq!(delta.removed, vec![b]);
    }

    #[test]
    fn test_reconcile_reports_removed_finished_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mp4");
        fs::write(&a, b"a").unwrap();

        let mut table = JobTable::new();
        let (job, _) = table.register(&a);
        table.finish(job.id, &a, OutcomeKind::Completed, Some(1));

        let delta = reconcile(&scan_directory(dir.path()).unwrap(), &table);
        assert!(delta.is_empty());

        fs::remove_file(&a).unwrap();
        let delta = reconcile(&scan_directory(dir.path()).unwrap(), &table);
        assert_eq!(delta.removed, vec![a]);
    }
}
