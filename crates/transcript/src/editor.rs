use crate::{Block, EditError, Result};

/// Finish reason a completed model turn is expected to carry.
pub const CANONICAL_FINISH_REASON: &str = "STOP";

/// Cuts the transcript back to its setup exchange.
///
/// The cut point is the first model block. Without one, the cut falls on the last
/// document/image block, extended by one text block when that block follows it.
/// A transcript with neither has no anchor and is reported instead of guessed at.
pub fn trim_to_setup(blocks: &[Block]) -> Result<Vec<Block>> {
    let cut = match blocks.iter().position(Block::is_model) {
        Some(idx) => idx,
        None => {
            let last_media = blocks
                .iter()
                .rposition(Block::is_media)
                .ok_or(EditError::NoAnchor { len: blocks.len() })?;
            match blocks.get(last_media + 1) {
                Some(Block::Text(_)) => last_media + 1,
                _ => last_media,
            }
        }
    };
    Ok(blocks[..=cut].to_vec())
}

/// A user text block carrying `marker`. Model replies may quote the marker without
/// being requests.
fn is_marked_request(block: &Block, marker: &str) -> bool {
    !block.is_model() && block.carries_marker(marker)
}

/// Drops every user text block containing `marker` together with the model reply that
/// immediately follows it, if any. Index 0 is never touched.
pub fn remove_marked_tasks(blocks: &[Block], marker: &str) -> (Vec<Block>, usize) {
    let mut kept = Vec::with_capacity(blocks.len());
    let mut removed = 0usize;
    let mut idx = 0usize;

    while idx < blocks.len() {
        let block = &blocks[idx];
        if idx == 0 || !is_marked_request(block, marker) {
            kept.push(block.clone());
            idx += 1;
            continue;
        }

        removed += 1;
        idx += 1;
        if blocks.get(idx).is_some_and(Block::is_model) {
            removed += 1;
            idx += 1;
        }
    }

    (kept, removed)
}

/// The most recent marked request is pending when no model block answers it.
#[must_use]
pub fn has_pending_marked_task(blocks: &[Block], marker: &str) -> bool {
    match blocks.iter().rposition(|b| is_marked_request(b, marker)) {
        Some(idx) => !blocks.get(idx + 1).is_some_and(Block::is_model),
        None => false,
    }
}

/// Forces every non-canonical finish reason to [`CANONICAL_FINISH_REASON`].
pub fn repair_finish_markers(blocks: &[Block]) -> (Vec<Block>, usize) {
    let mut fixed = 0usize;
    let repaired = blocks
        .iter()
        .cloned()
        .map(|mut block| {
            if let Block::Text(text) = &mut block {
                if let Some(reason) = &text.finish_reason {
                    if reason != CANONICAL_FINISH_REASON {
                        log::debug!("repairing finish reason {reason:?}");
                        text.finish_reason = Some(CANONICAL_FINISH_REASON.to_string());
                        fixed += 1;
                    }
                }
            }
            block
        })
        .collect();
    (repaired, fixed)
}

#[must_use]
pub fn append_blocks(blocks: &[Block], new_blocks: impl IntoIterator<Item = Block>) -> Vec<Block> {
    let mut out = blocks.to_vec();
    out.extend(new_blocks);
    out
}

/// Removes the blocks at `indices`. Index 0 and out-of-range indices are ignored.
pub fn remove_blocks(blocks: &[Block], indices: &[usize]) -> (Vec<Block>, usize) {
    let kept: Vec<Block> = blocks
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx == 0 || !indices.contains(idx))
        .map(|(_, block)| block.clone())
        .collect();
    let removed = blocks.len() - kept.len();
    (kept, removed)
}

/// Pops up to `count` trailing blocks, never going below the protected first block.
pub fn pop_blocks(blocks: &[Block], count: usize) -> (Vec<Block>, usize) {
    let keep = blocks.len().saturating_sub(count).max(blocks.len().min(1));
    let popped = blocks.len() - keep;
    (blocks[..keep].to_vec(), popped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Role, TextBlock};
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    const MARK: &str = "[[commit]]";

    fn finished(text: &str, reason: Option<&str>) -> Block {
        Block::Text(TextBlock {
            text: text.to_string(),
            role: Role::Model,
            token_count: None,
            finish_reason: reason.map(str::to_string),
            extra: Map::new(),
        })
    }

    fn labels(blocks: &[Block]) -> Vec<String> {
        blocks.iter().map(|b| b.preview(40)).collect()
    }

    #[test]
    fn trim_cuts_after_first_model_block() {
        let blocks = vec![
            Block::document("ctx", Some(10)),
            Block::user_text("setup"),
            Block::model_text("ok"),
            Block::user_text("q1"),
            Block::model_text("a1"),
        ];
        let trimmed = trim_to_setup(&blocks).unwrap();
        assert_eq!(labels(&trimmed), vec!["[document ctx]", "setup", "ok"]);
    }

    #[test]
    fn trim_falls_back_to_last_media_run_and_one_text() {
        let blocks = vec![
            Block::document("ctx", None),
            Block::user_text("between"),
            Block::image("img-1"),
            Block::image("img-2"),
            Block::user_text("describe these"),
            Block::user_text("dangling"),
        ];
        let trimmed = trim_to_setup(&blocks).unwrap();
        assert_eq!(
            labels(&trimmed),
            vec![
                "[document ctx]",
                "between",
                "[image img-1]",
                "[image img-2]",
                "describe these"
            ]
        );
    }

    #[test]
    fn trim_fallback_without_trailing_text_ends_on_media() {
        let blocks = vec![Block::document("ctx", None)];
        assert_eq!(trim_to_setup(&blocks).unwrap(), blocks);
    }

    #[test]
    fn trim_without_anchor_is_structural_error() {
        let blocks = vec![Block::user_text("a"), Block::user_text("b")];
        let err = trim_to_setup(&blocks).unwrap_err();
        assert!(matches!(err, EditError::NoAnchor { len: 2 }));
        assert!(matches!(trim_to_setup(&[]), Err(EditError::NoAnchor { len: 0 })));
    }

    #[test]
    fn remove_marked_pairs_reply_with_request() {
        let blocks = vec![
            Block::document("ctx", None),
            Block::user_text(format!("{MARK} suggest a commit")),
            Block::model_text("feat: add things"),
            Block::user_text("x"),
        ];
        let (kept, removed) = remove_marked_tasks(&blocks, MARK);
        assert_eq!(removed, 2);
        assert_eq!(labels(&kept), vec!["[document ctx]", "x"]);
    }

    #[test]
    fn remove_marked_leaves_following_user_block() {
        let blocks = vec![
            Block::document("ctx", None),
            Block::user_text(MARK),
            Block::user_text("not a reply"),
        ];
        let (kept, removed) = remove_marked_tasks(&blocks, MARK);
        assert_eq!(removed, 1);
        assert_eq!(labels(&kept), vec!["[document ctx]", "not a reply"]);
    }

    #[test]
    fn remove_marked_never_drops_index_zero() {
        let blocks = vec![Block::user_text(MARK), Block::model_text("reply")];
        let (kept, removed) = remove_marked_tasks(&blocks, MARK);
        assert_eq!(removed, 0);
        assert_eq!(kept, blocks);
    }

    #[test]
    fn pending_marker_detection() {
        let answered = vec![
            Block::document("ctx", None),
            Block::user_text(MARK),
            Block::model_text("done"),
        ];
        assert!(!has_pending_marked_task(&answered, MARK));

        let pending = append_blocks(&answered, [Block::user_text(MARK)]);
        assert!(has_pending_marked_task(&pending, MARK));

        let followed_by_user = append_blocks(&pending, [Block::user_text("more")]);
        assert!(has_pending_marked_task(&followed_by_user, MARK));

        assert!(!has_pending_marked_task(&[Block::user_text("plain")], MARK));
    }

    #[test]
    fn model_quoting_the_marker_is_not_a_request() {
        let quoted = format!("You asked {MARK}; here is the message.");
        let answered = vec![
            Block::document("ctx", None),
            Block::user_text(MARK),
            Block::model_text(quoted.as_str()),
        ];
        assert!(!has_pending_marked_task(&answered, MARK));

        let stray_quote = vec![
            Block::document("ctx", None),
            Block::model_text(quoted.as_str()),
            Block::user_text("next"),
        ];
        let (kept, removed) = remove_marked_tasks(&stray_quote, MARK);
        assert_eq!(removed, 0);
        assert_eq!(kept, stray_quote);
    }

    #[test]
    fn repair_is_idempotent() {
        let blocks = vec![
            Block::document("ctx", None),
            finished("a", Some("MAX_TOKENS")),
            finished("b", Some("STOP")),
            finished("c", None),
            finished("d", Some("OTHER")),
        ];
        let (once, fixed) = repair_finish_markers(&blocks);
        assert_eq!(fixed, 2);
        let (twice, fixed_again) = repair_finish_markers(&once);
        assert_eq!(fixed_again, 0);
        assert_eq!(once, twice);
        assert_eq!(
            twice[3].as_text().and_then(|t| t.finish_reason.clone()),
            None
        );
    }

    #[test]
    fn manual_removal_protects_first_block() {
        let blocks = vec![
            Block::document("ctx", None),
            Block::user_text("a"),
            Block::model_text("b"),
        ];
        let (kept, removed) = remove_blocks(&blocks, &[0, 2, 99]);
        assert_eq!(removed, 1);
        assert_eq!(labels(&kept), vec!["[document ctx]", "a"]);

        let (kept, popped) = pop_blocks(&blocks, 10);
        assert_eq!(popped, 2);
        assert_eq!(kept.len(), 1);

        let (empty, popped) = pop_blocks(&[], 3);
        assert_eq!((empty.len(), popped), (0, 0));
    }
}
