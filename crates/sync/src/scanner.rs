use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Per-project ignore file, same syntax as `.gitignore`.
pub const CONTEXT_IGNORE_FILE: &str = ".contextignore";

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path relative to the scan root, `/`-separated.
    pub relative: String,
    pub len: u64,
    pub mtime_ms: u64,
}

/// Scanner for the files that make up a project's context.
pub struct FileScanner {
    root: PathBuf,
}

impl FileScanner {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan for context files (.gitignore and .contextignore aware), sorted by relative path.
    pub fn scan(&self) -> Vec<ScannedFile> {
        let mut files = Vec::new();

        let root = self.root.clone();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .require_git(false)
            .add_custom_ignore_filename(CONTEXT_IGNORE_FILE);
        builder.filter_entry(move |entry| !FileScanner::is_ignored_scope(entry.path(), &root));

        for result in builder.build() {
            match result {
                Ok(entry) => {
                    let Some(file_type) = entry.file_type() else {
                        continue;
                    };
                    if !file_type.is_file() {
                        continue;
                    }

                    let path = entry.path();
                    let meta = match entry.metadata() {
                        Ok(meta) => meta,
                        Err(e) => {
                            log::warn!("Failed to stat {}: {e}", path.display());
                            continue;
                        }
                    };
                    if meta.len() > MAX_FILE_SIZE_BYTES {
                        log::debug!(
                            "Skipping large file {} ({} bytes > {})",
                            path.display(),
                            meta.len(),
                            MAX_FILE_SIZE_BYTES
                        );
                        continue;
                    }

                    if Self::is_noise_file(path) || Self::is_binary_file(path) {
                        log::debug!("Skipping noisy artifact {}", path.display());
                        continue;
                    }

                    let mtime_ms = meta
                        .modified()
                        .ok()
                        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                        .unwrap_or(0);

                    files.push(ScannedFile {
                        relative: self.relative(path),
                        path: path.to_path_buf(),
                        len: meta.len(),
                        mtime_ms,
                    });
                }
                Err(e) => log::warn!("Failed to read entry: {e}"),
            }
        }

        files.sort_by(|a, b| a.relative.cmp(&b.relative));
        log::debug!("Found {} context files under {}", files.len(), self.root.display());
        files
    }

    /// Newest modification time among the scanned files, `None` for an empty project.
    pub fn newest_mtime_ms(&self) -> Option<u64> {
        self.scan().iter().map(|f| f.mtime_ms).max()
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn is_binary_file(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                BINARY_EXTENSIONS.iter().any(|candidate| candidate == &ext)
            })
            .unwrap_or(false)
    }

    fn is_ignored_scope(path: &Path, root: &Path) -> bool {
        if let Ok(relative) = path.strip_prefix(root) {
            for component in relative.components() {
                if let std::path::Component::Normal(name) = component {
                    let lowered = name.to_string_lossy().to_lowercase();
                    if IGNORED_SCOPES.iter().any(|ignored| ignored == &lowered) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn is_noise_file(path: &Path) -> bool {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if NOISE_FILE_NAMES
                .iter()
                .any(|candidate| name.eq_ignore_ascii_case(candidate))
            {
                return true;
            }
        }

        false
    }
}

const IGNORED_SCOPES: &[&str] = &[
    // VCS / tooling
    ".git",
    ".hg",
    ".svn",
    ".idea",
    ".vscode",
    // caches / builds
    ".cache",
    "node_modules",
    ".next",
    ".turbo",
    ".parcel-cache",
    "build",
    "dist",
    "coverage",
    ".nuxt",
    ".vite",
    ".svelte-kit",
    "target",
    ".terraform",
    ".venv",
    "venv",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
];

const NOISE_FILE_NAMES: &[&str] = &[
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "Cargo.lock",
    "poetry.lock",
    "uv.lock",
];

const MAX_FILE_SIZE_BYTES: u64 = 1_048_576; // 1 MB

const BINARY_EXTENSIONS: &[&str] = &[
    // images
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "psd",
    // archives
    "zip", "gz", "tgz", "bz2", "xz", "7z", "rar", "tar", "jar",
    // compiled
    "exe", "dll", "so", "dylib", "o", "a", "class", "pyc", "pyo", "wasm", "rlib",
    // media / documents
    "mp3", "mp4", "wav", "ogg", "mov", "avi", "pdf", "woff", "woff2", "ttf", "otf",
    // data
    "db", "sqlite", "sqlite3", "bin", "pkl", "npy", "parquet",
];

#[cfg(test)]
mod tests {
    use super::FileScanner;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    fn relatives(scanner: &FileScanner) -> Vec<String> {
        scanner.scan().into_iter().map(|f| f.relative).collect()
    }

    #[test]
    fn skips_ignored_directories_and_binaries() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("node_modules/pkg")).unwrap();
        fs::write(temp.path().join("node_modules/pkg/index.js"), b"x").unwrap();
        fs::create_dir_all(temp.path().join("src")).unwrap();
        fs::write(temp.path().join("src/main.py"), b"print('hi')").unwrap();
        fs::write(temp.path().join("logo.png"), [0u8, 1, 2]).unwrap();
        fs::write(temp.path().join("Cargo.lock"), b"lock").unwrap();

        let scanner = FileScanner::new(temp.path());
        assert_eq!(relatives(&scanner), vec!["src/main.py".to_string()]);
    }

    #[test]
    fn honours_gitignore_and_contextignore() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(".gitignore"), b"secret.txt\n").unwrap();
        fs::write(temp.path().join(".contextignore"), b"docs/\n").unwrap();
        fs::write(temp.path().join("secret.txt"), b"s").unwrap();
        fs::create_dir_all(temp.path().join("docs")).unwrap();
        fs::write(temp.path().join("docs/guide.md"), b"# guide").unwrap();
        fs::write(temp.path().join("lib.rs"), b"fn main() {}").unwrap();

        let scanner = FileScanner::new(temp.path());
        assert_eq!(relatives(&scanner), vec!["lib.rs".to_string()]);
    }

    #[test]
    fn newest_mtime_tracks_latest_file() {
        let temp = tempdir().unwrap();
        let scanner = FileScanner::new(temp.path());
        assert_eq!(scanner.newest_mtime_ms(), None);

        fs::write(temp.path().join("a.txt"), b"a").unwrap();
        let before = scanner.newest_mtime_ms().unwrap();

        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(30);
        let file = fs::File::options()
            .write(true)
            .open(temp.path().join("a.txt"))
            .unwrap();
        file.set_modified(later).unwrap();

        assert!(scanner.newest_mtime_ms().unwrap() > before);
    }
}
