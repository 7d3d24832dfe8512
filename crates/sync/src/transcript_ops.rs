use crate::remote::DocumentStore;
use crate::state::StateRecord;
use crate::Result;
use context_transcript::{
    append_blocks, has_pending_marked_task, pop_blocks, remove_blocks, remove_marked_tasks,
    repair_finish_markers, trim_to_setup, Block, TranscriptDocument, TRANSCRIPT_MIME,
};
use serde::Serialize;
use std::sync::Arc;

/// Outcome of one remote transcript edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EditReport {
    /// Whether a write-back happened. `false` means the transcript was already in shape.
    pub changed: bool,
    /// Blocks removed, repaired or appended, depending on the edit.
    pub affected: usize,
    pub blocks_before: usize,
    pub blocks_after: usize,
}

/// Download, edit in memory, write back only when something changed.
///
/// Methods taking `&mut StateRecord` write remotely; hold the shared state
/// guard while calling them.
pub struct TranscriptEditor {
    store: Arc<dyn DocumentStore>,
}

impl TranscriptEditor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, state: &StateRecord) -> Result<TranscriptDocument> {
        let bytes = self.store.get_content(state.transcript_id()?).await?;
        Ok(TranscriptDocument::from_slice(&bytes)?)
    }

    pub async fn blocks(&self, state: &StateRecord) -> Result<Vec<Block>> {
        Ok(self.load(state).await?.chunked_prompt.chunks)
    }

    /// Drop every turn after the setup exchange.
    pub async fn clear_history(&self, state: &mut StateRecord) -> Result<EditReport> {
        self.apply(state, |blocks| {
            let trimmed = trim_to_setup(blocks)?;
            let removed = blocks.len() - trimmed.len();
            Ok((trimmed, removed))
        })
        .await
    }

    pub async fn remove_marked_tasks(
        &self,
        state: &mut StateRecord,
        marker: &str,
    ) -> Result<EditReport> {
        self.apply(state, |blocks| Ok(remove_marked_tasks(blocks, marker)))
            .await
    }

    pub async fn has_pending_task(&self, state: &StateRecord, marker: &str) -> Result<bool> {
        let doc = self.load(state).await?;
        Ok(has_pending_marked_task(doc.blocks(), marker))
    }

    pub async fn repair_finish_markers(&self, state: &mut StateRecord) -> Result<EditReport> {
        self.apply(state, |blocks| Ok(repair_finish_markers(blocks)))
            .await
    }

    pub async fn append(
        &self,
        state: &mut StateRecord,
        new_blocks: Vec<Block>,
    ) -> Result<EditReport> {
        self.apply(state, move |blocks| {
            let added = new_blocks.len();
            Ok((append_blocks(blocks, new_blocks), added))
        })
        .await
    }

    pub async fn remove_blocks(
        &self,
        state: &mut StateRecord,
        indices: &[usize],
    ) -> Result<EditReport> {
        self.apply(state, |blocks| Ok(remove_blocks(blocks, indices)))
            .await
    }

    pub async fn pop_blocks(&self, state: &mut StateRecord, count: usize) -> Result<EditReport> {
        self.apply(state, |blocks| Ok(pop_blocks(blocks, count)))
            .await
    }

    async fn apply<F>(&self, state: &mut StateRecord, edit: F) -> Result<EditReport>
    where
        F: FnOnce(&[Block]) -> Result<(Vec<Block>, usize)>,
    {
        let transcript_id = state.transcript_id()?.to_string();
        let mut doc = TranscriptDocument::from_slice(&self.store.get_content(&transcript_id).await?)?;
        let blocks_before = doc.blocks().len();

        let (blocks, affected) = edit(doc.blocks())?;
        let blocks_after = blocks.len();
        if affected == 0 {
            log::info!("Transcript already in shape; nothing written");
            return Ok(EditReport {
                changed: false,
                affected,
                blocks_before,
                blocks_after: blocks_before,
            });
        }

        doc.set_blocks(blocks);
        self.store
            .update(&transcript_id, &doc.to_vec()?, TRANSCRIPT_MIME)
            .await?;
        state.note_remote_write();
        log::info!("Transcript updated ({blocks_before} -> {blocks_after} blocks)");

        Ok(EditReport {
            changed: true,
            affected,
            blocks_before,
            blocks_after,
        })
    }
}
