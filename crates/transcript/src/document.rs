use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextBlock {
    pub text: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Fields the remote format carries that the editor never interprets.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRefBlock {
    pub drive_document: RemoteRef,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRefBlock {
    pub drive_image: RemoteRef,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One unit of a transcript.
///
/// On the wire the variants are distinguished by which key is present
/// (`driveDocument`, `driveImage` or `text`), so the order of the variants matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Block {
    DocumentRef(DocumentRefBlock),
    ImageRef(ImageRefBlock),
    Text(TextBlock),
}

impl Block {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::text(Role::Model, text)
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Block::Text(TextBlock {
            text: text.into(),
            role,
            token_count: None,
            finish_reason: None,
            extra: Map::new(),
        })
    }

    pub fn document(id: impl Into<String>, token_count: Option<u64>) -> Self {
        Block::DocumentRef(DocumentRefBlock {
            drive_document: RemoteRef { id: id.into() },
            role: Role::User,
            token_count,
            extra: Map::new(),
        })
    }

    pub fn image(id: impl Into<String>) -> Self {
        Block::ImageRef(ImageRefBlock {
            drive_image: RemoteRef { id: id.into() },
            role: Role::User,
            token_count: None,
            extra: Map::new(),
        })
    }

    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Block::DocumentRef(b) => b.role,
            Block::ImageRef(b) => b.role,
            Block::Text(b) => b.role,
        }
    }

    #[must_use]
    pub fn is_model(&self) -> bool {
        self.role() == Role::Model
    }

    #[must_use]
    pub fn is_media(&self) -> bool {
        matches!(self, Block::DocumentRef(_) | Block::ImageRef(_))
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&TextBlock> {
        match self {
            Block::Text(b) => Some(b),
            _ => None,
        }
    }

    /// True when this is a text block whose body contains `marker` verbatim.
    #[must_use]
    pub fn carries_marker(&self, marker: &str) -> bool {
        self.as_text().is_some_and(|b| b.text.contains(marker))
    }

    #[must_use]
    pub fn token_count(&self) -> Option<u64> {
        match self {
            Block::DocumentRef(b) => b.token_count,
            Block::ImageRef(b) => b.token_count,
            Block::Text(b) => b.token_count,
        }
    }

    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Block::DocumentRef(_) => "FILE",
            Block::ImageRef(_) => "IMG",
            Block::Text(_) => "TEXT",
        }
    }

    /// Single-line preview, at most `max_chars` characters of text.
    #[must_use]
    pub fn preview(&self, max_chars: usize) -> String {
        match self {
            Block::DocumentRef(b) => format!("[document {}]", b.drive_document.id),
            Block::ImageRef(b) => format!("[image {}]", b.drive_image.id),
            Block::Text(b) => {
                let flat: String = b
                    .text
                    .chars()
                    .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                    .collect();
                if flat.chars().count() > max_chars {
                    let head: String = flat.chars().take(max_chars).collect();
                    format!("{head}...")
                } else {
                    flat
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedPrompt {
    #[serde(default)]
    pub chunks: Vec<Block>,
    #[serde(default)]
    pub pending_inputs: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A full transcript file as stored remotely.
///
/// Only `chunkedPrompt.chunks` is interpreted; run settings, system
/// instruction and any other top-level keys round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptDocument {
    pub chunked_prompt: ChunkedPrompt,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TranscriptDocument {
    pub fn new(blocks: Vec<Block>) -> Self {
        let mut extra = Map::new();
        extra.insert("runSettings".to_string(), Value::Object(Map::new()));
        extra.insert("systemInstruction".to_string(), Value::Object(Map::new()));
        Self {
            chunked_prompt: ChunkedPrompt {
                chunks: blocks,
                pending_inputs: Vec::new(),
                extra: Map::new(),
            },
            extra,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.chunked_prompt.chunks
    }

    pub fn set_blocks(&mut self, blocks: Vec<Block>) {
        self.chunked_prompt.chunks = blocks;
    }

    /// Updates the token count of the document block pointing at `document_id`.
    ///
    /// Returns `true` only when a block carried a count and it actually changed.
    pub fn set_document_token_count(&mut self, document_id: &str, token_count: u64) -> bool {
        let mut changed = false;
        for block in &mut self.chunked_prompt.chunks {
            if let Block::DocumentRef(doc) = block {
                if doc.drive_document.id != document_id {
                    continue;
                }
                if let Some(current) = doc.token_count {
                    if current != token_count {
                        doc.token_count = Some(token_count);
                        changed = true;
                    }
                }
            }
        }
        changed
    }
}
