use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use foreman_core::{
    CoreError, Criterion, DocumentKind, Persona, PersonaId, Project, ProjectId, RunStatus,
    SqliteStore, Ticket, TicketId, TicketState,
};
use foreman_dispatch::{
    lock_store, pause, AgentInvocation, AgentProcessResult, AgentRunner, ControlApi, CycleOutcome,
    DispatchLimits, Dispatcher, DispatcherConfig, MentionDispatchRequest, ReauthResponse,
    SharedStore, SideChannel, StoreSideChannel, Workspace, WorkspaceProvider,
};

struct StubWorkspace;

impl WorkspaceProvider for StubWorkspace {
    fn provision(&self, _project: &Project, _ticket_id: &TicketId) -> Result<Workspace, CoreError> {
        Ok(Workspace {
            path: std::env::temp_dir(),
            branch: None,
            isolated: false,
        })
    }
}

struct FailingWorkspace;

impl WorkspaceProvider for FailingWorkspace {
    fn provision(&self, project: &Project, _ticket_id: &TicketId) -> Result<Workspace, CoreError> {
        Err(CoreError::Workspace(format!(
            "Project '{}' checkout does not exist.",
            project.name
        )))
    }
}

#[derive(Default)]
struct ScriptedRunner {
    results: Mutex<VecDeque<AgentProcessResult>>,
    invocations: Mutex<Vec<AgentInvocation>>,
}

impl ScriptedRunner {
    fn with_results(results: Vec<AgentProcessResult>) -> Self {
        Self {
            results: Mutex::new(VecDeque::from(results)),
            invocations: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(&self, invocation: &AgentInvocation) -> AgentProcessResult {
        self.invocations
            .lock()
            .expect("lock")
            .push(invocation.clone());
        self.results
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_default()
    }
}

/// Simulates an agent that uploads its document through the side channel
/// mid-run, then exits with unhelpful stdout.
struct DocSavingRunner {
    store: SharedStore,
    kind: DocumentKind,
}

#[async_trait]
impl AgentRunner for DocSavingRunner {
    async fn run(&self, _invocation: &AgentInvocation) -> AgentProcessResult {
        lock_store(&self.store)
            .expect("lock")
            .append_document(
                &TicketId::new("t-1"),
                self.kind,
                "## Summary\nSaved through the side channel.\n## Details\nMore.",
                Some(&PersonaId::new("per-1")),
                Utc::now(),
            )
            .expect("append");
        AgentProcessResult {
            stdout: "done".to_owned(),
            stderr: String::new(),
            exit_code: Some(0),
            timed_out: false,
        }
    }
}

#[derive(Default)]
struct RecordingApi {
    reauth_calls: Mutex<usize>,
    mention_requests: Mutex<Vec<MentionDispatchRequest>>,
}

#[async_trait]
impl ControlApi for RecordingApi {
    async fn reauthorize(&self) -> Result<ReauthResponse, CoreError> {
        *self.reauth_calls.lock().expect("lock") += 1;
        Ok(ReauthResponse {
            ok: true,
            message: None,
            error: None,
        })
    }

    async fn dispatch_mention(&self, request: MentionDispatchRequest) -> Result<(), CoreError> {
        self.mention_requests.lock().expect("lock").push(request);
        Ok(())
    }
}

fn sample_ticket(id: &str) -> Ticket {
    Ticket {
        ticket_id: TicketId::new(id),
        title: format!("ticket {id}"),
        description: "Do the thing.".to_owned(),
        ticket_type: "feature".to_owned(),
        state: TicketState::Backlog,
        priority: 0,
        project_id: ProjectId::new("p-1"),
        assignee_persona_id: None,
        last_agent_activity: None,
        last_human_comment_at: None,
        returned_from_verification: false,
        research_completed_at: None,
        research_completed_by: None,
        research_approved_at: None,
        research_approved_by: None,
        plan_completed_at: None,
        plan_completed_by: None,
        plan_approved_at: None,
        plan_approved_by: None,
        criteria: vec![Criterion {
            text: "it works".to_owned(),
            satisfied: false,
        }],
        created_at: Utc::now(),
    }
}

fn seeded_store() -> SharedStore {
    let store = SqliteStore::in_memory().expect("store");
    store
        .upsert_project(&Project {
            project_id: ProjectId::new("p-1"),
            name: "gateway".to_owned(),
            repo_path: None,
        })
        .expect("project");
    store
        .upsert_persona(&Persona {
            persona_id: PersonaId::new("per-1"),
            display_name: "Sam".to_owned(),
            role: "implementer".to_owned(),
            project_id: Some(ProjectId::new("p-1")),
            skills: vec!["rust".to_owned()],
        })
        .expect("persona");
    Arc::new(Mutex::new(store))
}

fn dispatcher(
    store: &SharedStore,
    workspace: Arc<dyn WorkspaceProvider>,
    runner: Arc<dyn AgentRunner>,
    api: Arc<RecordingApi>,
) -> Dispatcher {
    let side_channel: Arc<dyn SideChannel> =
        Arc::new(StoreSideChannel::new(Arc::clone(store)));
    Dispatcher::new(
        Arc::clone(store),
        workspace,
        runner,
        side_channel,
        api,
        DispatcherConfig {
            agent_binary: PathBuf::from("agent"),
            model: "sonnet-latest".to_owned(),
            sessions_root: std::env::temp_dir().join("foreman-tests"),
            limits: DispatchLimits::default(),
        },
    )
}

fn substantial_document() -> String {
    format!(
        "## Summary\nMapped the gateway retry paths.\n\n## Findings\n{}",
        "Detail line with enough text to clear the output threshold.\n".repeat(4)
    )
}

#[tokio::test]
async fn successful_research_run_completes_the_phase() {
    let store = seeded_store();
    lock_store(&store)
        .expect("lock")
        .upsert_ticket(&sample_ticket("t-1"))
        .expect("ticket");

    let api = Arc::new(RecordingApi::default());
    let runner = Arc::new(ScriptedRunner::with_results(vec![AgentProcessResult {
        stdout: substantial_document(),
        stderr: String::new(),
        exit_code: Some(0),
        timed_out: false,
    }]));
    let dispatcher = dispatcher(
        &store,
        Arc::new(StubWorkspace),
        Arc::clone(&runner) as Arc<dyn AgentRunner>,
        Arc::clone(&api),
    );

    let report = dispatcher.run_cycle(Utc::now()).await.expect("cycle");
    assert_eq!(report.outcome, CycleOutcome::Ran);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.completed, 1);

    let guard = lock_store(&store).expect("lock");
    let ticket = guard
        .get_ticket(&TicketId::new("t-1"))
        .expect("get")
        .expect("exists");
    assert!(ticket.research_completed_at.is_some());
    assert_eq!(
        ticket.research_completed_by,
        Some(PersonaId::new("per-1"))
    );
    // Completed but unapproved: the next cycle must leave it alone.
    assert_eq!(
        guard
            .latest_document_version(&TicketId::new("t-1"), DocumentKind::Research)
            .expect("version"),
        1
    );
    let runs = guard
        .list_runs_for_ticket(&TicketId::new("t-1"), Utc::now())
        .expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(
        guard
            .get_setting(pause::KEY_CYCLE_DISPATCHED)
            .expect("setting")
            .as_deref(),
        Some("1")
    );
    assert_eq!(
        guard
            .get_setting(pause::KEY_HEARTBEAT_STATUS)
            .expect("setting")
            .as_deref(),
        Some(pause::HEARTBEAT_IDLE)
    );

    // The phase summary comment came through the side channel.
    let comments = guard
        .recent_agent_comments(Utc::now() - Duration::minutes(1))
        .expect("comments");
    assert_eq!(comments.len(), 1);
    assert!(comments[0].content.starts_with("research phase complete."));
    assert!(comments[0].content.contains("Mapped the gateway retry paths."));
}

#[tokio::test]
async fn awaiting_approval_tickets_are_skipped() {
    let store = seeded_store();
    let mut ticket = sample_ticket("t-1");
    ticket.research_completed_at = Some(Utc::now());
    lock_store(&store)
        .expect("lock")
        .upsert_ticket(&ticket)
        .expect("ticket");

    let api = Arc::new(RecordingApi::default());
    let runner = Arc::new(ScriptedRunner::default());
    let dispatcher = dispatcher(
        &store,
        Arc::new(StubWorkspace),
        Arc::clone(&runner) as Arc<dyn AgentRunner>,
        api,
    );

    let report = dispatcher.run_cycle(Utc::now()).await.expect("cycle");
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.skipped, 1);
    assert!(runner.invocations.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn short_output_fails_the_run_and_clears_the_lock() {
    let store = seeded_store();
    lock_store(&store)
        .expect("lock")
        .upsert_ticket(&sample_ticket("t-1"))
        .expect("ticket");

    let api = Arc::new(RecordingApi::default());
    let runner = Arc::new(ScriptedRunner::with_results(vec![AgentProcessResult {
        stdout: "ok".to_owned(),
        stderr: String::new(),
        exit_code: Some(0),
        timed_out: false,
    }]));
    let dispatcher = dispatcher(
        &store,
        Arc::new(StubWorkspace),
        runner,
        api,
    );

    let report = dispatcher.run_cycle(Utc::now()).await.expect("cycle");
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.completed, 0);

    let guard = lock_store(&store).expect("lock");
    let ticket = guard
        .get_ticket(&TicketId::new("t-1"))
        .expect("get")
        .expect("exists");
    assert_eq!(ticket.last_agent_activity, None);
    assert!(ticket.research_completed_at.is_none());
    let runs = guard
        .list_runs_for_ticket(&TicketId::new("t-1"), Utc::now())
        .expect("runs");
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0]
        .error_message
        .as_deref()
        .expect("message")
        .contains("exit code 0"));
}

#[tokio::test]
async fn timeout_records_the_run_and_clears_the_lock() {
    let store = seeded_store();
    lock_store(&store)
        .expect("lock")
        .upsert_ticket(&sample_ticket("t-1"))
        .expect("ticket");

    let api = Arc::new(RecordingApi::default());
    let runner = Arc::new(ScriptedRunner::with_results(vec![AgentProcessResult {
        stdout: "partial".to_owned(),
        stderr: String::new(),
        exit_code: None,
        timed_out: true,
    }]));
    let dispatcher = dispatcher(&store, Arc::new(StubWorkspace), runner, api);

    dispatcher.run_cycle(Utc::now()).await.expect("cycle");

    let guard = lock_store(&store).expect("lock");
    let runs = guard
        .list_runs_for_ticket(&TicketId::new("t-1"), Utc::now())
        .expect("runs");
    assert_eq!(runs[0].status, RunStatus::Timeout);
    let ticket = guard
        .get_ticket(&TicketId::new("t-1"))
        .expect("get")
        .expect("exists");
    assert_eq!(ticket.last_agent_activity, None);
}

#[tokio::test]
async fn quota_failure_pauses_subsequent_cycles_until_expiry() {
    let store = seeded_store();
    lock_store(&store)
        .expect("lock")
        .upsert_ticket(&sample_ticket("t-1"))
        .expect("ticket");

    let api = Arc::new(RecordingApi::default());
    let runner = Arc::new(ScriptedRunner::with_results(vec![AgentProcessResult {
        stdout: String::new(),
        stderr: "Error: hit your limit, try later".to_owned(),
        exit_code: Some(1),
        timed_out: false,
    }]));
    let dispatcher = dispatcher(&store, Arc::new(StubWorkspace), runner, api);

    let now = Utc::now();
    let report = dispatcher.run_cycle(now).await.expect("first cycle");
    assert_eq!(report.outcome, CycleOutcome::Ran);

    {
        let guard = lock_store(&store).expect("lock");
        assert!(guard
            .get_setting(pause::KEY_QUOTA_PAUSE_UNTIL)
            .expect("setting")
            .is_some());
        let ticket = guard
            .get_ticket(&TicketId::new("t-1"))
            .expect("get")
            .expect("exists");
        assert_eq!(ticket.last_agent_activity, None);
    }

    // Still paused: the whole cycle is skipped with no side effects.
    let paused = dispatcher.run_cycle(now).await.expect("paused cycle");
    assert_eq!(paused.outcome, CycleOutcome::SkippedQuotaPause);

    // Past the fallback hour the pause auto-clears and dispatch resumes.
    let later = now + Duration::minutes(61);
    let resumed = dispatcher.run_cycle(later).await.expect("resumed cycle");
    assert_eq!(resumed.outcome, CycleOutcome::Ran);
    let guard = lock_store(&store).expect("lock");
    assert!(guard
        .get_setting(pause::KEY_QUOTA_PAUSE_UNTIL)
        .expect("setting")
        .is_none());
}

#[tokio::test]
async fn credential_failure_halts_dispatch_and_requests_reauthorization() {
    let store = seeded_store();
    lock_store(&store)
        .expect("lock")
        .upsert_ticket(&sample_ticket("t-1"))
        .expect("ticket");

    let api = Arc::new(RecordingApi::default());
    let runner = Arc::new(ScriptedRunner::with_results(vec![AgentProcessResult {
        stdout: String::new(),
        stderr: "Error: OAuth token has expired. Please run /login".to_owned(),
        exit_code: Some(1),
        timed_out: false,
    }]));
    let dispatcher = dispatcher(
        &store,
        Arc::new(StubWorkspace),
        runner,
        Arc::clone(&api),
    );

    let now = Utc::now();
    dispatcher.run_cycle(now).await.expect("first cycle");
    assert_eq!(*api.reauth_calls.lock().expect("lock"), 1);

    // The flag gates every later cycle until cleared externally.
    let halted = dispatcher.run_cycle(now).await.expect("halted cycle");
    assert_eq!(halted.outcome, CycleOutcome::SkippedAuthExpired);

    {
        let guard = lock_store(&store).expect("lock");
        pause::clear_auth_expired(&guard).expect("clear");
    }
    let resumed = dispatcher.run_cycle(now).await.expect("resumed");
    assert_eq!(resumed.outcome, CycleOutcome::Ran);
}

#[tokio::test]
async fn side_channel_document_completes_the_phase_even_with_short_stdout() {
    let store = seeded_store();
    lock_store(&store)
        .expect("lock")
        .upsert_ticket(&sample_ticket("t-1"))
        .expect("ticket");

    let api = Arc::new(RecordingApi::default());
    let runner = Arc::new(DocSavingRunner {
        store: Arc::clone(&store),
        kind: DocumentKind::Research,
    });
    let dispatcher = dispatcher(&store, Arc::new(StubWorkspace), runner, api);

    let report = dispatcher.run_cycle(Utc::now()).await.expect("cycle");
    assert_eq!(report.completed, 1);

    let guard = lock_store(&store).expect("lock");
    let ticket = guard
        .get_ticket(&TicketId::new("t-1"))
        .expect("get")
        .expect("exists");
    assert!(ticket.research_completed_at.is_some());
    // The fallback path must not add a second version on top of the agent's.
    assert_eq!(
        guard
            .latest_document_version(&TicketId::new("t-1"), DocumentKind::Research)
            .expect("version"),
        1
    );
    let comments = guard
        .recent_agent_comments(Utc::now() - Duration::minutes(1))
        .expect("comments");
    assert!(comments
        .iter()
        .any(|comment| comment.content.contains("Saved through the side channel.")));
}

#[tokio::test]
async fn one_persona_cannot_take_two_tickets_in_one_cycle() {
    let store = seeded_store();
    {
        let guard = lock_store(&store).expect("lock");
        guard.upsert_ticket(&sample_ticket("t-1")).expect("ticket");
        guard.upsert_ticket(&sample_ticket("t-2")).expect("ticket");
    }

    let api = Arc::new(RecordingApi::default());
    let runner = Arc::new(ScriptedRunner::with_results(vec![AgentProcessResult {
        stdout: substantial_document(),
        stderr: String::new(),
        exit_code: Some(0),
        timed_out: false,
    }]));
    let dispatcher = dispatcher(&store, Arc::new(StubWorkspace), runner, api);

    let report = dispatcher.run_cycle(Utc::now()).await.expect("cycle");
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.skipped, 1);
}

#[tokio::test]
async fn workspace_failure_is_isolated_to_the_ticket() {
    let store = seeded_store();
    lock_store(&store)
        .expect("lock")
        .upsert_ticket(&sample_ticket("t-1"))
        .expect("ticket");

    let api = Arc::new(RecordingApi::default());
    let runner = Arc::new(ScriptedRunner::default());
    let dispatcher = dispatcher(&store, Arc::new(FailingWorkspace), runner, api);

    let report = dispatcher.run_cycle(Utc::now()).await.expect("cycle");
    assert_eq!(report.outcome, CycleOutcome::Ran);
    assert_eq!(report.completed, 0);

    // Lock cleared so the next cycle retries once the checkout exists.
    let guard = lock_store(&store).expect("lock");
    let ticket = guard
        .get_ticket(&TicketId::new("t-1"))
        .expect("get")
        .expect("exists");
    assert_eq!(ticket.last_agent_activity, None);
}

#[tokio::test]
async fn lock_window_blocks_redispatch_within_the_same_window() {
    let store = seeded_store();
    let mut ticket = sample_ticket("t-1");
    ticket.last_agent_activity = Some(Utc::now() - Duration::minutes(10));
    lock_store(&store)
        .expect("lock")
        .upsert_ticket(&ticket)
        .expect("ticket");

    let api = Arc::new(RecordingApi::default());
    let runner = Arc::new(ScriptedRunner::default());
    let dispatcher = dispatcher(
        &store,
        Arc::new(StubWorkspace),
        Arc::clone(&runner) as Arc<dyn AgentRunner>,
        api,
    );

    let report = dispatcher.run_cycle(Utc::now()).await.expect("cycle");
    assert_eq!(report.dispatched, 0);
    assert!(runner.invocations.lock().expect("lock").is_empty());
}
