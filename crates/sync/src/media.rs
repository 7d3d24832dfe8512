use crate::remote::{DocumentStore, ROOT_PARENT};
use crate::state::StateRecord;
use crate::transcript_ops::{EditReport, TranscriptEditor};
use crate::{Result, SyncError};
use context_transcript::Block;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// An image reference found in a note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub target: String,
    /// `![[...]]` form, resolved against the media root when not next to the note.
    pub wiki: bool,
}

const IMAGE_PATTERN: &str =
    r"!\[\[([^\]|]+)(?:\|[^\]]*)?\]\]|!\[[^\]]*\]\(\s*<?([^)>\s]+)>?(?:\s+[^)]*)?\)";

fn image_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(IMAGE_PATTERN) {
            Ok(re) => Some(re),
            Err(err) => {
                log::error!("Image reference pattern does not compile: {err}");
                None
            }
        })
        .as_ref()
}

/// Markdown `![alt](path)` and wiki `![[path]]` references, in order, skipping URLs.
#[must_use]
pub fn extract_image_refs(note: &str) -> Vec<ImageRef> {
    let Some(pattern) = image_pattern() else {
        return Vec::new();
    };
    pattern
        .captures_iter(note)
        .filter_map(|caps| {
            if let Some(wiki) = caps.get(1) {
                return Some(ImageRef {
                    target: wiki.as_str().trim().to_string(),
                    wiki: true,
                });
            }
            let target = caps.get(2)?.as_str().trim();
            if target.contains("://") {
                return None;
            }
            Some(ImageRef {
                target: target.to_string(),
                wiki: false,
            })
        })
        .collect()
}

#[must_use]
pub fn image_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

/// Path of `reference` next to the note, or below `media_root` for wiki links.
#[must_use]
pub fn resolve_image(note: &Path, reference: &ImageRef, media_root: Option<&Path>) -> Option<PathBuf> {
    let base = note.parent().unwrap_or_else(|| Path::new("."));
    let beside = base.join(&reference.target);
    if beside.is_file() {
        return Some(beside);
    }
    if reference.wiki {
        let candidate = media_root?.join(&reference.target);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Result of [`inject_images`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInjection {
    pub uploaded: Vec<PathBuf>,
    pub unresolved: Vec<String>,
    pub report: Option<EditReport>,
}

/// Upload every image referenced by `note` and append them to the transcript,
/// framed by a user prompt and a model acknowledgement.
pub async fn inject_images(
    store: &Arc<dyn DocumentStore>,
    editor: &TranscriptEditor,
    state: &mut StateRecord,
    remote_folder: &str,
    note: &Path,
    media_root: Option<&Path>,
) -> Result<ImageInjection> {
    let text = tokio::fs::read_to_string(note)
        .await
        .map_err(|e| SyncError::InvalidPath(format!("{}: {e}", note.display())))?;

    let mut resolved = Vec::new();
    let mut unresolved = Vec::new();
    for reference in extract_image_refs(&text) {
        match resolve_image(note, &reference, media_root) {
            Some(path) if image_mime(&path).is_some() => resolved.push(path),
            _ => {
                log::warn!("Could not resolve image {}", reference.target);
                unresolved.push(reference.target);
            }
        }
    }
    if resolved.is_empty() {
        return Ok(ImageInjection {
            uploaded: Vec::new(),
            unresolved,
            report: None,
        });
    }

    let parent = store
        .find_by_name(remote_folder, ROOT_PARENT)
        .await?
        .unwrap_or_else(|| ROOT_PARENT.to_string());

    let note_name = note
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut blocks = vec![Block::user_text(format!(
        "Images referenced in {note_name} follow."
    ))];
    for path in &resolved {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime = image_mime(path).unwrap_or("application/octet-stream");
        let id = store.create(&parent, &name, &bytes, mime).await?;
        log::info!("Uploaded {name} as {id}");
        blocks.push(Block::image(id));
    }
    blocks.push(Block::model_text(format!(
        "Received the images from {note_name}."
    )));

    let report = editor.append(state, blocks).await?;
    Ok(ImageInjection {
        uploaded: resolved,
        unresolved,
        report: Some(report),
    })
}
