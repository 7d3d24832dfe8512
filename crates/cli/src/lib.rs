use anyhow::{Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use context_sync::{
    inject_images, request_commit_message, shared, AnnotationUpdate, CommitRequest, EditReport,
    SnapshotInfo, StateRecord, SyncError, SyncOutcome,
};
use context_transcript::{Block, COMMIT_TASK_MARKER};
use serde_json::json;
use session::{Session, SessionOptions};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

mod session;

const DEFAULT_HISTORY_LIMIT: usize = 10;
const PREVIEW_CHARS: usize = 60;

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    print_stdout(&serde_json::to_string_pretty(value)?)
}

#[derive(Parser)]
#[command(name = "project-context")]
#[command(about = "Keep a project's generated context and its chat transcript in sync, with history", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory (default: current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// State directory (overrides PROJECT_CONTEXT_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Directory backing the document store (default: <home>/remote)
    #[arg(long, global = true)]
    remote_dir: Option<PathBuf>,

    /// Transcript poll interval in milliseconds (overrides PROJECT_CONTEXT_POLL_MS)
    #[arg(long, global = true)]
    poll_ms: Option<u64>,

    /// Machine-readable output on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Answer yes to confirmation prompts
    #[arg(short, long, global = true)]
    yes: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the context and transcript on first use, otherwise push changes
    Sync(SyncArgs),

    /// Show the tracked state of the project
    Status,

    /// List snapshots, newest first
    History(HistoryArgs),

    /// Show one snapshot
    Show(ShowArgs),

    /// Save a named snapshot of the current transcript
    Save(SaveArgs),

    /// Restore context and transcript from a snapshot
    Restore(RestoreArgs),

    /// Drop the conversation, keeping the setup exchange
    Clear,

    /// Safety snapshot, regenerate and push the context, then clear
    Reset,

    /// Ask the chat for a commit message for the staged changes
    Commit,

    /// Remove commit message requests and their answers
    #[command(name = "clean-tasks")]
    CleanTasks,

    /// Normalize finish markers of model turns
    Repair,

    /// Upload the images referenced by a note into the transcript
    Images(ImagesArgs),

    /// List the transcript blocks
    Blocks,

    /// Remove blocks by index
    Rm(RmArgs),

    /// Remove trailing blocks
    Pop(PopArgs),

    /// Control the background snapshot monitor
    Monitor(MonitorArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// Restrict context generation to this sub-directory
    #[arg(long, conflicts_with = "no_scope")]
    scope: Option<PathBuf>,

    /// Generate context from the whole project again
    #[arg(long)]
    no_scope: bool,

    /// Push even if nothing changed
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct HistoryArgs {
    /// Number of snapshots to list, or `all`
    limit: Option<String>,
}

#[derive(Args)]
struct ShowArgs {
    id: String,
}

#[derive(Args)]
struct SaveArgs {
    /// Label stored with the snapshot
    message: String,
}

#[derive(Args)]
struct RestoreArgs {
    id: String,
}

#[derive(Args)]
struct ImagesArgs {
    /// Markdown note referencing the images
    note: PathBuf,

    /// Where `![[...]]` links are looked up when not next to the note
    #[arg(long)]
    media_root: Option<PathBuf>,
}

#[derive(Args)]
struct RmArgs {
    /// Block indices as shown by `blocks`
    #[arg(required = true)]
    indices: Vec<usize>,
}

#[derive(Args)]
struct PopArgs {
    #[arg(default_value_t = 2)]
    count: usize,
}

#[derive(Args)]
struct MonitorArgs {
    #[arg(value_enum)]
    action: MonitorAction,

    /// With `run`: stop after this many milliseconds instead of waiting for Ctrl-C
    #[arg(long)]
    for_ms: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum MonitorAction {
    On,
    Off,
    Run,
}

struct Output {
    json: bool,
    yes: bool,
}

impl Output {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        if self.yes {
            return Ok(true);
        }
        Ok(dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?)
    }
}

pub async fn main_entry() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let json_output = cli.json;
    if let Err(err) = run(cli).await {
        report_error(&err, json_output)?;
        std::process::exit(1);
    }
    Ok(())
}

fn report_error(err: &anyhow::Error, json_output: bool) -> Result<()> {
    let kind = err
        .downcast_ref::<SyncError>()
        .map(|e| e.kind().to_string());
    if json_output {
        return print_json(&json!({
            "status": "error",
            "kind": kind,
            "message": format!("{err:#}"),
        }));
    }
    match kind {
        Some(kind) => eprintln!("Error [{kind}]: {err:#}"),
        None => eprintln!("Error: {err:#}"),
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let opts = SessionOptions {
        project: cli.project.clone(),
        home: cli.home.clone(),
        remote_dir: cli.remote_dir.clone(),
        poll_ms: cli.poll_ms,
    };
    let out = Output {
        json: cli.json,
        yes: cli.yes,
    };
    let session = Session::open(&opts).await?;

    match cli.command {
        Commands::Sync(args) => run_sync(&session, &out, args).await,
        Commands::Status => run_status(&session, &out).await,
        Commands::History(args) => run_history(&session, &out, args).await,
        Commands::Show(args) => run_show(&session, &out, args).await,
        Commands::Save(args) => run_save(&session, &out, args).await,
        Commands::Restore(args) => run_restore(&session, &out, args).await,
        Commands::Clear => run_clear(&session, &out).await,
        Commands::Reset => run_reset(&session, &out).await,
        Commands::Commit => run_commit(&session, &out).await,
        Commands::CleanTasks => {
            let mut state = session.load_state().await?;
            let report = session
                .editor
                .remove_marked_tasks(&mut state, COMMIT_TASK_MARKER)
                .await?;
            print_edit(&out, "Commit requests removed", report)
        }
        Commands::Repair => {
            let mut state = session.load_state().await?;
            let report = session.editor.repair_finish_markers(&mut state).await?;
            print_edit(&out, "Finish markers repaired", report)
        }
        Commands::Images(args) => run_images(&session, &out, args).await,
        Commands::Blocks => run_blocks(&session, &out).await,
        Commands::Rm(args) => {
            let mut state = session.load_state().await?;
            let report = session
                .editor
                .remove_blocks(&mut state, &args.indices)
                .await?;
            print_edit(&out, "Blocks removed", report)
        }
        Commands::Pop(args) => {
            let mut state = session.load_state().await?;
            let report = session.editor.pop_blocks(&mut state, args.count).await?;
            print_edit(&out, "Blocks popped", report)
        }
        Commands::Monitor(args) => run_monitor(&session, &out, args).await,
    }
}

async fn run_sync(session: &Session, out: &Output, args: SyncArgs) -> Result<()> {
    let (mut state, created) = session.load_or_bootstrap().await?;

    let scope_changed = if args.no_scope {
        state.context_scope.take().is_some()
    } else if let Some(scope) = args.scope {
        if !session.project().join(&scope).is_dir() {
            anyhow::bail!("scope {} is not a directory of the project", scope.display());
        }
        let changed = state.context_scope.as_ref() != Some(&scope);
        state.context_scope = Some(scope);
        changed
    } else {
        false
    };

    if created && !scope_changed && !args.force {
        session.save(&state).await?;
        if out.json {
            return print_json(&json!({ "status": "created", "state": state }));
        }
        print_stdout(&format!(
            "Project initialised.\n  context document:    {}\n  transcript document: {}",
            state.context_document_id.as_deref().unwrap_or("-"),
            state.transcript_document_id.as_deref().unwrap_or("-"),
        ))?;
        return Ok(());
    }

    let outcome = if scope_changed || args.force {
        session.engine.force_push(&mut state).await
    } else {
        session.engine.synchronize(&mut state).await
    };
    // An error means nothing was pushed and the state is as it was.
    let outcome = outcome.context("Context sync failed")?;
    session.save(&state).await?;
    print_outcome(out, &outcome)
}

fn print_outcome(out: &Output, outcome: &SyncOutcome) -> Result<()> {
    if out.json {
        let value = match outcome {
            SyncOutcome::Unchanged => json!({ "status": "unchanged" }),
            SyncOutcome::Touched { last_modified } => {
                json!({ "status": "touched", "last_modified": last_modified })
            }
            SyncOutcome::Pushed {
                hash,
                token_estimate,
                annotation,
                cache_written,
            } => json!({
                "status": "pushed",
                "hash": hash,
                "token_estimate": token_estimate,
                "annotation": annotation_label(annotation),
                "cache_written": cache_written,
            }),
        };
        return print_json(&value);
    }
    match outcome {
        SyncOutcome::Unchanged => print_stdout("Project unchanged; nothing to push."),
        SyncOutcome::Touched { .. } => {
            print_stdout("Files touched but the context is identical; nothing pushed.")
        }
        SyncOutcome::Pushed {
            token_estimate,
            annotation,
            cache_written,
            ..
        } => {
            print_stdout(&format!("Context pushed (~{token_estimate} tokens)."))?;
            if !cache_written {
                print_stdout("Local context cache could not be updated; see the log.")?;
            }
            if let AnnotationUpdate::Failed(reason) = annotation {
                print_stdout(&format!(
                    "Token count in the transcript is stale ({reason}); it is fixed by the next push."
                ))?;
            }
            Ok(())
        }
    }
}

fn annotation_label(annotation: &AnnotationUpdate) -> String {
    match annotation {
        AnnotationUpdate::Updated => "updated".to_string(),
        AnnotationUpdate::Unchanged => "unchanged".to_string(),
        AnnotationUpdate::Failed(reason) => format!("failed: {reason}"),
    }
}

async fn run_status(session: &Session, out: &Output) -> Result<()> {
    let state = session.load_state().await?;
    let history = session.history(shared(state.clone()));
    let snapshots = history.list_snapshots().await?.len();

    if out.json {
        return print_json(&json!({
            "state": state,
            "state_dir": session.layout.dir(),
            "snapshots": snapshots,
        }));
    }
    print_stdout(&format!(
        "Project:     {}\nScope:       {}\nContext:     {} ({})\nTranscript:  {}\nMonitor:     {}\nSnapshots:   {snapshots}\nState dir:   {}",
        state.project_path.display(),
        state
            .context_scope
            .as_ref()
            .map(|s| s.display().to_string())
            .unwrap_or_else(|| "whole project".to_string()),
        state.context_document_id.as_deref().unwrap_or("-"),
        state.content_hash.as_deref().map(short).unwrap_or("no hash"),
        state.transcript_document_id.as_deref().unwrap_or("-"),
        if state.monitor_active { "on" } else { "off" },
        session.layout.dir().display(),
    ))
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn parse_history_limit(raw: Option<&str>) -> Result<Option<usize>> {
    match raw {
        None => Ok(Some(DEFAULT_HISTORY_LIMIT)),
        Some(value) if value.eq_ignore_ascii_case("all") => Ok(None),
        Some(value) => value
            .parse::<usize>()
            .map(Some)
            .with_context(|| format!("history limit must be a number or `all`, got {value:?}")),
    }
}

async fn run_history(session: &Session, out: &Output, args: HistoryArgs) -> Result<()> {
    let limit = parse_history_limit(args.limit.as_deref())?;
    let state = session.load_state().await?;
    let mut snapshots = session.history(shared(state)).list_snapshots().await?;
    let total = snapshots.len();
    if let Some(limit) = limit {
        snapshots.truncate(limit);
    }

    if out.json {
        return print_json(&json!({ "total": total, "snapshots": snapshots }));
    }
    if snapshots.is_empty() {
        return print_stdout("No snapshots yet.");
    }
    for info in &snapshots {
        print_stdout(&snapshot_row(info))?;
    }
    if snapshots.len() < total {
        print_stdout(&format!(
            "({} of {total} shown; `history all` lists every snapshot)",
            snapshots.len()
        ))?;
    }
    Ok(())
}

fn snapshot_row(info: &SnapshotInfo) -> String {
    let label = match &info.message {
        Some(message) => message.clone(),
        None => format!("auto ({})", info.remote_modified_marker),
    };
    format!(
        " {:<18} | {} | {} | {label}",
        info.timestamp_id,
        info.created_at,
        short(&info.context_hash_ref)
    )
}

async fn run_show(session: &Session, out: &Output, args: ShowArgs) -> Result<()> {
    let state = session.load_state().await?;
    let history = session.history(shared(state));
    let info = history
        .get_snapshot(&args.id)
        .await?
        .ok_or_else(|| SyncError::SnapshotNotFound(args.id.clone()))?;
    let restorable = session
        .engine
        .content_store()
        .contains(&info.context_hash_ref)
        .await;

    if out.json {
        return print_json(&json!({ "snapshot": info, "restorable": restorable }));
    }
    print_stdout(&format!(
        "Snapshot:    {}\nCreated:     {}\nMessage:     {}\nRemote mark: {}\nContext:     {}{}",
        info.timestamp_id,
        info.created_at,
        info.message.as_deref().unwrap_or("(automatic)"),
        info.remote_modified_marker,
        info.context_hash_ref,
        if restorable { "" } else { " (missing from the content store)" },
    ))
}

async fn run_save(session: &Session, out: &Output, args: SaveArgs) -> Result<()> {
    let state = session.load_state().await?;
    let info = session
        .history(shared(state))
        .create_named_snapshot(&args.message)
        .await?;
    if out.json {
        return print_json(&json!({ "status": "saved", "snapshot": info }));
    }
    print_stdout(&format!("Snapshot {} saved.", info.timestamp_id))
}

async fn run_restore(session: &Session, out: &Output, args: RestoreArgs) -> Result<()> {
    let state = shared(session.load_state().await?);
    if !out.confirm(&format!(
        "Overwrite the remote context and transcript with snapshot {}?",
        args.id
    ))? {
        return print_stdout("Restore cancelled.");
    }

    let history = session.history(state.clone());
    let restored = history.restore(&args.id).await;
    // A partial restore still moves the content hash.
    session.save(&*state.lock().await).await?;
    let info = restored?;

    if out.json {
        return print_json(&json!({ "status": "restored", "snapshot": info }));
    }
    print_stdout(&format!("Snapshot {} restored.", info.timestamp_id))
}

async fn run_clear(session: &Session, out: &Output) -> Result<()> {
    let mut state = session.load_state().await?;
    if !out.confirm("Delete the whole conversation after the setup exchange?")? {
        return print_stdout("Clear cancelled.");
    }
    let report = session.editor.clear_history(&mut state).await?;
    print_edit(out, "History cleared", report)
}

async fn run_reset(session: &Session, out: &Output) -> Result<()> {
    let state = shared(session.load_state().await?);
    if !out.confirm("Snapshot, regenerate the context and clear the conversation?")? {
        return print_stdout("Reset cancelled.");
    }

    let history = session.history(state.clone());
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let safety = history
        .create_named_snapshot(&format!("before reset {stamp}"))
        .await
        .context("Safety snapshot failed; nothing was reset")?;
    drop(history);

    let mut guard = state.lock().await;
    let pushed = session.engine.force_push(&mut guard).await;
    session.save(&guard).await?;
    let outcome = pushed.context("Context push failed")?;
    let report = session.editor.clear_history(&mut guard).await?;
    session.save(&guard).await?;

    if out.json {
        return print_json(&json!({
            "status": "reset",
            "safety_snapshot": safety.timestamp_id,
            "pushed": matches!(outcome, SyncOutcome::Pushed { .. }),
            "history": report,
        }));
    }
    print_stdout(&format!(
        "Safety snapshot {} saved; context pushed; {} blocks removed.",
        safety.timestamp_id, report.affected
    ))
}

async fn run_commit(session: &Session, out: &Output) -> Result<()> {
    let mut state = session.load_state().await?;
    let result = request_commit_message(&session.editor, &mut state).await?;
    if out.json {
        let status = match &result {
            CommitRequest::Appended(_) => "appended",
            CommitRequest::NothingStaged => "nothing_staged",
            CommitRequest::AlreadyPending => "pending",
        };
        return print_json(&json!({ "status": status }));
    }
    match result {
        CommitRequest::Appended(_) => {
            print_stdout("Commit message request added to the end of the chat; run it there.")
        }
        CommitRequest::NothingStaged => {
            print_stdout("Nothing staged; stage changes with `git add` first.")
        }
        CommitRequest::AlreadyPending => print_stdout(
            "A commit request is still unanswered; answer it or run `clean-tasks` first.",
        ),
    }
}

async fn run_images(session: &Session, out: &Output, args: ImagesArgs) -> Result<()> {
    let mut state = session.load_state().await?;
    let note = if args.note.is_absolute() {
        args.note.clone()
    } else {
        session.project().join(&args.note)
    };
    let injection = inject_images(
        &session.store,
        &session.editor,
        &mut state,
        &session.config.remote_folder,
        &note,
        args.media_root.as_deref(),
    )
    .await?;

    if out.json {
        return print_json(&json!({
            "uploaded": injection.uploaded,
            "unresolved": injection.unresolved,
            "report": injection.report,
        }));
    }
    for missing in &injection.unresolved {
        print_stdout(&format!(" [!] not found: {missing}"))?;
    }
    if injection.uploaded.is_empty() {
        return print_stdout(&format!("No images resolved in {}.", args.note.display()));
    }
    print_stdout(&format!("{} images injected.", injection.uploaded.len()))
}

fn block_row(index: usize, block: &Block) -> String {
    let tokens = block
        .token_count()
        .map(|t| format!("{t}t"))
        .unwrap_or_else(|| "? t".to_string());
    format!(
        " {index:<3} | {:<6} | {:<5} | {tokens:<8} | {}",
        block.role().as_str(),
        block.kind_label(),
        block.preview(PREVIEW_CHARS)
    )
}

async fn run_blocks(session: &Session, out: &Output) -> Result<()> {
    let state = session.load_state().await?;
    let blocks = session.editor.blocks(&state).await?;
    if out.json {
        return print_json(&json!({ "blocks": blocks }));
    }
    print_stdout(" #   | role   | kind  | tokens   | preview")?;
    for (index, block) in blocks.iter().enumerate() {
        print_stdout(&block_row(index, block))?;
    }
    Ok(())
}

fn print_edit(out: &Output, what: &str, report: EditReport) -> Result<()> {
    if out.json {
        let status = if report.changed { "changed" } else { "unchanged" };
        return print_json(&json!({ "status": status, "report": report }));
    }
    if report.changed {
        print_stdout(&format!(
            "{what}: {} ({} -> {} blocks).",
            report.affected, report.blocks_before, report.blocks_after
        ))
    } else {
        print_stdout("Transcript already in shape; nothing written.")
    }
}

async fn run_monitor(session: &Session, out: &Output, args: MonitorArgs) -> Result<()> {
    let mut state = session.load_state().await?;
    match args.action {
        MonitorAction::On | MonitorAction::Off => {
            state.monitor_active = matches!(args.action, MonitorAction::On);
            session.save(&state).await?;
            if out.json {
                return print_json(&json!({ "monitor_active": state.monitor_active }));
            }
            print_stdout(if state.monitor_active {
                "Monitor enabled; `monitor run` resumes it."
            } else {
                "Monitor disabled."
            })
        }
        MonitorAction::Run => run_watch(session, state, args.for_ms).await,
    }
}

/// Foreground loop: keeps the context synced and, when enabled, the snapshot poller running.
async fn run_watch(session: &Session, state: StateRecord, for_ms: Option<u64>) -> Result<()> {
    let monitor_active = state.monitor_active;
    let state = shared(state);
    let mut history = session.history(state.clone());
    if monitor_active {
        history.start();
    } else {
        log::info!("Snapshot monitor is off; only the context is kept in sync");
    }

    let deadline = async {
        match for_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    log::warn!("Cannot listen for Ctrl-C: {err}");
                    std::future::pending::<()>().await;
                }
            }
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(session.config.monitor.poll_interval);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = ticker.tick() => {
                let mut guard = state.lock().await;
                match session.engine.synchronize(&mut guard).await {
                    Ok(SyncOutcome::Unchanged) => {}
                    Ok(outcome) => {
                        log::info!("Context sync: {outcome:?}");
                        session.save(&guard).await?;
                    }
                    Err(err) => log::warn!("Context sync failed: {err}"),
                }
            }
        }
    }

    history.stop().await;
    session.save(&*state.lock().await).await?;
    log::info!("Monitor stopped");
    Ok(())
}
