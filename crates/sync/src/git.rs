use crate::state::StateRecord;
use crate::transcript_ops::{EditReport, TranscriptEditor};
use crate::{Result, SyncError};
use context_transcript::{Block, COMMIT_TASK_MARKER};
use std::path::Path;
use tokio::time::{timeout, Duration};

const GIT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// What [`request_commit_message`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitRequest {
    Appended(EditReport),
    /// Nothing staged; the transcript was left alone.
    NothingStaged,
    /// A previous request is still unanswered.
    AlreadyPending,
}

/// Staged changes of the repository containing `project_root`.
///
/// Falls back to `git status --short` when the repository has no commit yet,
/// where `diff --cached` can come back empty despite staged files.
pub async fn staged_diff(project_root: &Path) -> Result<Option<String>> {
    let diff = run_git(project_root, &["diff", "--cached"]).await?;
    if !diff.trim().is_empty() {
        return Ok(Some(diff));
    }

    let has_head = run_git(project_root, &["rev-parse", "--verify", "HEAD"])
        .await
        .is_ok();
    if !has_head {
        let status = run_git(project_root, &["status", "--short"]).await?;
        if !status.trim().is_empty() {
            return Ok(Some(format!("Initial commit. Files added:\n{status}")));
        }
    }
    Ok(None)
}

#[must_use]
pub fn commit_request_text(diff: &str) -> String {
    format!(
        "{COMMIT_TASK_MARKER}\nAct as a senior developer who writes commit messages following \
         common best practices. The attached project context describes the codebase.\n\n\
         I made the following staged changes:\n\n```diff\n{diff}\n```\n\n\
         Suggest one concise commit message, a single paragraph that states the intent of the \
         change without omitting important details."
    )
}

/// Append a marker-tagged commit message request to the transcript.
pub async fn request_commit_message(
    editor: &TranscriptEditor,
    state: &mut StateRecord,
) -> Result<CommitRequest> {
    if editor.has_pending_task(state, COMMIT_TASK_MARKER).await? {
        return Ok(CommitRequest::AlreadyPending);
    }
    let Some(diff) = staged_diff(&state.project_path).await? else {
        return Ok(CommitRequest::NothingStaged);
    };
    let report = editor
        .append(state, vec![Block::user_text(commit_request_text(&diff))])
        .await?;
    Ok(CommitRequest::Appended(report))
}

async fn run_git(project_root: &Path, args: &[&str]) -> Result<String> {
    let output = timeout(
        GIT_TIMEOUT,
        tokio::process::Command::new("git")
            .arg("-C")
            .arg(project_root)
            .args(args)
            .output(),
    )
    .await
    .map_err(|_| SyncError::Other(format!("git {} timed out", args.join(" "))))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SyncError::Other(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_transcript::has_pending_marked_task;

    #[test]
    fn request_text_carries_marker_and_diff() {
        let text = commit_request_text("+fn main() {}");
        assert!(text.starts_with(COMMIT_TASK_MARKER));
        assert!(text.contains("```diff\n+fn main() {}\n```"));

        let blocks = vec![Block::document("ctx", None), Block::user_text(text)];
        assert!(has_pending_marked_task(&blocks, COMMIT_TASK_MARKER));
    }

    #[tokio::test]
    async fn outside_a_repository_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(staged_diff(dir.path()).await.is_err());
    }
}
