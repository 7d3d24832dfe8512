mod support;

use context_sync::{
    shared, DocumentStore, ErrorKind, MonitorConfig, SnapshotManager, StructuralViolation,
    SyncError, SyncOutcome, TranscriptEditor,
};
use context_transcript::{Block, TranscriptDocument, TRANSCRIPT_MIME};
use pretty_assertions::assert_eq;
use std::time::Duration;
use support::{touch_ahead, Fixture};

fn manager(fx: &Fixture, state: context_sync::SharedState) -> SnapshotManager {
    SnapshotManager::new(
        fx.dyn_store(),
        state,
        fx.layout.clone(),
        MonitorConfig {
            poll_interval: Duration::from_millis(20),
            stop_grace: Duration::from_millis(500),
        },
    )
}

#[tokio::test]
async fn restore_reproduces_captured_bytes() {
    let fx = Fixture::new().await;
    let state = shared(fx.bootstrap().await);
    let history = manager(&fx, state.clone());
    let (context_id, transcript_id) = {
        let guard = state.lock().await;
        (
            guard.context_document_id.clone().expect("context id"),
            guard.transcript_document_id.clone().expect("transcript id"),
        )
    };

    let captured_context = fx.store.get_content(&context_id).await.expect("context");
    let captured_transcript = fx.store.get_content(&transcript_id).await.expect("transcript");
    let info = history
        .create_named_snapshot("before experiment")
        .await
        .expect("snapshot");
    assert_eq!(info.message.as_deref(), Some("before experiment"));

    {
        let mut guard = state.lock().await;
        let editor = TranscriptEditor::new(fx.dyn_store());
        editor
            .append(&mut guard, vec![Block::user_text("try something")])
            .await
            .expect("append");
        std::fs::write(fx.project.path().join("main.py"), "print('experiment')\n").expect("edit");
        touch_ahead(&fx.project.path().join("main.py"), 60);
        let outcome = fx.engine.synchronize(&mut guard).await.expect("sync");
        assert!(matches!(outcome, SyncOutcome::Pushed { .. }));
    }
    assert_ne!(
        fx.store.get_content(&transcript_id).await.expect("transcript"),
        captured_transcript
    );

    history.restore(&info.timestamp_id).await.expect("restore");

    assert_eq!(
        fx.store.get_content(&context_id).await.expect("context"),
        captured_context
    );
    assert_eq!(
        fx.store.get_content(&transcript_id).await.expect("transcript"),
        captured_transcript
    );
    assert_eq!(
        state.lock().await.content_hash.as_deref(),
        Some(info.context_hash_ref.as_str())
    );
    assert_eq!(
        fx.layout.read_context_cache().await.expect("cache"),
        Some(captured_context)
    );
}

#[tokio::test]
async fn restore_without_stored_content_is_structural_and_writes_nothing() {
    let fx = Fixture::new().await;
    let state = shared(fx.bootstrap().await);
    let history = manager(&fx, state.clone());
    let info = history.create_named_snapshot("base").await.expect("snapshot");

    let entry = fx
        .layout
        .content_store_dir()
        .join(format!("{}.txt", info.context_hash_ref));
    std::fs::remove_file(entry).expect("drop stored content");
    let writes = fx.store.writes();

    let err = history.restore(&info.timestamp_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StructuralError);
    assert!(matches!(
        err,
        SyncError::Structural(StructuralViolation::MissingStoredContent { .. })
    ));
    assert_eq!(fx.store.writes(), writes);
}

#[tokio::test]
async fn unknown_snapshot_is_not_found() {
    let fx = Fixture::new().await;
    let state = shared(fx.bootstrap().await);
    let history = manager(&fx, state);

    let err = history.restore("20200101_000000").await.unwrap_err();
    assert!(matches!(err, SyncError::SnapshotNotFound(_)));
    assert!(history.get_snapshot("../state").await.expect("get").is_none());
}

#[tokio::test]
async fn failed_transcript_restore_rolls_context_back() {
    let fx = Fixture::new().await;
    let state = shared(fx.bootstrap().await);
    let history = manager(&fx, state.clone());
    let info = history.create_named_snapshot("base").await.expect("snapshot");

    let (context_id, transcript_id) = {
        let mut guard = state.lock().await;
        std::fs::write(fx.project.path().join("main.py"), "print('v2')\n").expect("edit");
        touch_ahead(&fx.project.path().join("main.py"), 60);
        fx.engine.synchronize(&mut guard).await.expect("sync");
        (
            guard.context_document_id.clone().expect("context id"),
            guard.transcript_document_id.clone().expect("transcript id"),
        )
    };
    let live_context = fx.store.get_content(&context_id).await.expect("context");
    let live_hash = state.lock().await.content_hash.clone();

    fx.store.reject_updates_to(Some(&transcript_id));
    let err = history.restore(&info.timestamp_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteError);

    assert_eq!(
        fx.store.get_content(&context_id).await.expect("context"),
        live_context
    );
    assert_eq!(state.lock().await.content_hash, live_hash);
}

#[tokio::test]
async fn first_observation_never_snapshots() {
    let fx = Fixture::new().await;
    let state = shared(fx.bootstrap().await);
    let history = manager(&fx, state.clone());

    let mut observed = None;
    assert!(history.poll_once(&mut observed).await.expect("poll").is_none());
    assert!(observed.is_some());
    assert!(history.list_snapshots().await.expect("list").is_empty());
}

#[tokio::test]
async fn external_edits_snapshot_but_own_writes_do_not() {
    let fx = Fixture::new().await;
    let state = shared(fx.bootstrap().await);
    let history = manager(&fx, state.clone());
    let transcript_id = state
        .lock()
        .await
        .transcript_document_id
        .clone()
        .expect("transcript id");

    let mut observed = None;
    history.poll_once(&mut observed).await.expect("baseline");

    {
        let mut guard = state.lock().await;
        TranscriptEditor::new(fx.dyn_store())
            .append(&mut guard, vec![Block::user_text("from this session")])
            .await
            .expect("append");
    }
    assert!(history.poll_once(&mut observed).await.expect("poll").is_none());

    let mut doc = TranscriptDocument::from_slice(
        &fx.store.get_content(&transcript_id).await.expect("transcript"),
    )
    .expect("parse");
    let mut blocks = doc.blocks().to_vec();
    blocks.push(Block::model_text("typed in the web UI"));
    doc.set_blocks(blocks);
    fx.store
        .external_update(&transcript_id, &doc.to_vec().expect("encode"), TRANSCRIPT_MIME)
        .await;

    let info = history
        .poll_once(&mut observed)
        .await
        .expect("poll")
        .expect("snapshot on external change");
    assert!(info.is_automatic());
    assert_eq!(
        history.list_snapshots().await.expect("list"),
        vec![info.clone()]
    );
    assert!(history.poll_once(&mut observed).await.expect("poll").is_none());
}

#[tokio::test]
async fn snapshots_list_newest_first() {
    let fx = Fixture::new().await;
    let state = shared(fx.bootstrap().await);
    let history = manager(&fx, state);

    let first = history.create_named_snapshot("one").await.expect("one");
    let second = history.create_named_snapshot("two").await.expect("two");
    let third = history.create_named_snapshot("three").await.expect("three");

    let ids: Vec<String> = history
        .list_snapshots()
        .await
        .expect("list")
        .into_iter()
        .map(|s| s.timestamp_id)
        .collect();
    assert_eq!(
        ids,
        vec![third.timestamp_id, second.timestamp_id, first.timestamp_id]
    );
}

#[tokio::test]
async fn snapshot_requires_a_content_hash() {
    let fx = Fixture::new().await;
    let mut record = fx.bootstrap().await;
    record.content_hash = None;
    let history = manager(&fx, shared(record));

    let err = history.create_named_snapshot("x").await.unwrap_err();
    assert!(matches!(err, SyncError::MissingContentHash));
}

fn snapshot_dir_entries(fx: &Fixture) -> Vec<String> {
    match std::fs::read_dir(fx.layout.snapshots_dir()) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn snapshot_copies_the_cached_context_into_an_empty_store() {
    let fx = Fixture::new().await;
    let record = fx.bootstrap().await;
    let hash = record.content_hash.clone().expect("hash");
    std::fs::remove_file(fx.layout.content_store_dir().join(format!("{hash}.txt")))
        .expect("drop stored content");
    assert!(!fx.engine.content_store().contains(&hash).await);

    let history = manager(&fx, shared(record));
    let info = history.create_named_snapshot("from cache").await.expect("snapshot");

    assert_eq!(info.context_hash_ref, hash);
    let cached = fx
        .layout
        .read_context_cache()
        .await
        .expect("cache")
        .expect("cache present");
    assert_eq!(
        fx.engine.content_store().get(&hash).await.expect("get"),
        Some(cached)
    );
}

#[tokio::test]
async fn snapshot_without_store_entry_or_cache_leaves_no_directory() {
    let fx = Fixture::new().await;
    let record = fx.bootstrap().await;
    let hash = record.content_hash.clone().expect("hash");
    std::fs::remove_file(fx.layout.content_store_dir().join(format!("{hash}.txt")))
        .expect("drop stored content");
    std::fs::remove_file(fx.layout.context_cache_path()).expect("drop cache");

    let history = manager(&fx, shared(record));
    let err = history.create_named_snapshot("doomed").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StructuralError);
    assert!(matches!(
        err,
        SyncError::Structural(StructuralViolation::MissingStoredContent { .. })
    ));
    assert_eq!(snapshot_dir_entries(&fx), Vec::<String>::new());
    assert!(history.list_snapshots().await.expect("list").is_empty());
}

#[tokio::test]
async fn failed_transcript_download_leaves_no_partial_snapshot() {
    let fx = Fixture::new().await;
    let record = fx.bootstrap().await;
    fx.store
        .reject_reads_of(record.transcript_document_id.as_deref());

    let history = manager(&fx, shared(record));
    let err = history.create_named_snapshot("offline").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransferError);
    assert_eq!(snapshot_dir_entries(&fx), Vec::<String>::new());

    fx.store.reject_reads_of(None);
    let info = history.create_named_snapshot("online").await.expect("snapshot");
    assert_eq!(snapshot_dir_entries(&fx), vec![info.timestamp_id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poller_starts_quietly_and_stops_within_grace() {
    let fx = Fixture::new().await;
    let state = shared(fx.bootstrap().await);
    let mut history = manager(&fx, state.clone());

    history.start();
    history.start();
    assert!(history.is_running());
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(history.list_snapshots().await.expect("list").is_empty());

    history.stop().await;
    assert!(!history.is_running());
}
