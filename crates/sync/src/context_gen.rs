use crate::content_store::hash_bytes;
use crate::scanner::{FileScanner, ScannedFile};
use crate::{Result, SyncError};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

/// Project file holding a custom setup prompt.
pub const CONTEXT_PROMPT_FILE: &str = ".contextprompt";

pub const DEFAULT_SETUP_PROMPT: &str = "You are a senior software engineer reviewing a complete codebase.

The attached document contains the full source of my project as plain text:
- It starts with the directory tree.
- Every file follows, introduced by a FILE: header with its path relative to the project root.
- Ignored paths (.gitignore, .contextignore, build output, binaries) are excluded.

Read the whole structure before answering, keep every important file in mind for later turns, \
and answer with concrete references to file paths.";

pub const DEFAULT_SETUP_RESPONSE: &str = "Understood, project loaded.";

const FILE_SEPARATOR: &str = "================================================";
const CHARS_PER_TOKEN: usize = 4;

/// Freshly generated context text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedContext {
    pub text: String,
    pub token_estimate: u64,
    pub hash: String,
}

impl GeneratedContext {
    pub fn from_text(text: String) -> Self {
        let token_estimate = (text.chars().count() / CHARS_PER_TOKEN) as u64;
        let hash = hash_bytes(text.as_bytes());
        Self {
            text,
            token_estimate,
            hash,
        }
    }
}

/// Turns a project tree into context text.
pub trait ContextSource: Send + Sync {
    fn generate(&self, root: &Path) -> Result<GeneratedContext>;
}

/// Directory tree followed by every text file under the root.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeContextSource;

impl ContextSource for TreeContextSource {
    fn generate(&self, root: &Path) -> Result<GeneratedContext> {
        if !root.is_dir() {
            return Err(SyncError::InvalidPath(root.display().to_string()));
        }
        let files = FileScanner::new(root).scan();

        let mut text = render_tree(root, &files);
        for file in &files {
            let bytes = match std::fs::read(&file.path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("Skipping unreadable {}: {e}", file.relative);
                    continue;
                }
            };
            let Ok(body) = String::from_utf8(bytes) else {
                log::debug!("Skipping non-UTF-8 file {}", file.relative);
                continue;
            };
            let _ = write!(
                text,
                "\n{FILE_SEPARATOR}\nFILE: {}\n{FILE_SEPARATOR}\n{body}\n",
                file.relative
            );
        }

        Ok(GeneratedContext::from_text(text))
    }
}

fn render_tree(root: &Path, files: &[ScannedFile]) -> String {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string());

    // Directories are implied by file paths; BTreeSet keeps them sorted and unique.
    let mut entries = BTreeSet::new();
    for file in files {
        let parts: Vec<&str> = file.relative.split('/').collect();
        for depth in 1..parts.len() {
            entries.insert(format!("{}/", parts[..depth].join("/")));
        }
        entries.insert(file.relative.clone());
    }

    let mut out = format!("Directory structure:\n└── {name}/\n");
    for entry in &entries {
        let trimmed = entry.trim_end_matches('/');
        let depth = trimmed.matches('/').count();
        let leaf = trimmed.rsplit('/').next().unwrap_or(trimmed);
        let suffix = if entry.ends_with('/') { "/" } else { "" };
        let _ = writeln!(out, "    {}├── {leaf}{suffix}", "│   ".repeat(depth));
    }
    out
}

/// Setup prompt for a new transcript: `.contextprompt` when present and non-empty.
#[must_use]
pub fn setup_prompt(project_root: &Path) -> String {
    let path = project_root.join(CONTEXT_PROMPT_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) if !content.trim().is_empty() => {
            log::info!("Using custom prompt from {CONTEXT_PROMPT_FILE}");
            content.trim().to_string()
        }
        Ok(_) => DEFAULT_SETUP_PROMPT.to_string(),
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Could not read {}: {err}", path.display());
            }
            DEFAULT_SETUP_PROMPT.to_string()
        }
    }
}
