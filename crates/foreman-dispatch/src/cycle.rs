use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use foreman_core::{
    CoreError, DispatchSource, NeededPhase, NewRun, Persona, PersonaId, Phase, Project, RunStatus,
    Ticket, TicketId,
};
use tokio::task::JoinSet;

use crate::classifier::{quota_resume_time, ErrorClassifier, FailureKind};
use crate::control_api::ControlApi;
use crate::matcher::match_persona;
use crate::mentions::{MentionDispatcher, MentionReport};
use crate::pause::{
    clear_quota_pause, record_auth_expired, record_heartbeat_idle, record_heartbeat_running,
    record_quota_pause, ControlState, CycleGate,
};
use crate::prompt::{allowed_tools, build_system_prompt, build_task, phase_timeout};
use crate::runner::{AgentInvocation, AgentRunner};
use crate::scheduler::Scheduler;
use crate::sidechannel::{lock_store, SharedStore, SideChannel};
use crate::summary::extract_summary;
use crate::workspace::{workspace_slug, WorkspaceProvider};

/// Completed runs whose stdout is at or below this length are treated as
/// empty/truncated agent responses and recorded as failures.
pub const MIN_OUTPUT_CHARS: usize = 100;

pub const DEFAULT_MAX_JOBS: usize = 8;
pub const DEFAULT_CONCURRENCY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    /// Cap on jobs collected per cycle, across all projects.
    pub max_jobs: usize,
    /// Simultaneous external agent processes.
    pub concurrency: usize,
    /// Scheduler candidates pulled per project.
    pub schedule_batch_size: usize,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
            concurrency: DEFAULT_CONCURRENCY,
            schedule_batch_size: crate::scheduler::DEFAULT_SCHEDULE_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub agent_binary: PathBuf,
    pub model: String,
    pub sessions_root: PathBuf,
    pub limits: DispatchLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Ran,
    SkippedAuthExpired,
    SkippedQuotaPause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub dispatched: usize,
    pub completed: usize,
    pub skipped: usize,
    pub mentions: MentionReport,
}

impl CycleReport {
    fn skipped_cycle(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            dispatched: 0,
            completed: 0,
            skipped: 0,
            mentions: MentionReport::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct DispatchJob {
    project: Project,
    ticket: Ticket,
    persona: Persona,
    phase: Phase,
}

#[derive(Debug)]
struct JobOutcome {
    ticket_id: TicketId,
    run_status: Option<RunStatus>,
    phase_completed: bool,
}

#[derive(Clone)]
struct JobContext {
    store: SharedStore,
    workspace: Arc<dyn WorkspaceProvider>,
    runner: Arc<dyn AgentRunner>,
    classifier: Arc<ErrorClassifier>,
    side_channel: Arc<dyn SideChannel>,
    api: Arc<dyn ControlApi>,
    config: Arc<DispatcherConfig>,
}

pub struct Dispatcher {
    store: SharedStore,
    workspace: Arc<dyn WorkspaceProvider>,
    runner: Arc<dyn AgentRunner>,
    classifier: Arc<ErrorClassifier>,
    side_channel: Arc<dyn SideChannel>,
    api: Arc<dyn ControlApi>,
    config: Arc<DispatcherConfig>,
}

impl Dispatcher {
    pub fn new(
        store: SharedStore,
        workspace: Arc<dyn WorkspaceProvider>,
        runner: Arc<dyn AgentRunner>,
        side_channel: Arc<dyn SideChannel>,
        api: Arc<dyn ControlApi>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            workspace,
            runner,
            classifier: Arc::new(ErrorClassifier::default()),
            side_channel,
            api,
            config: Arc::new(config),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// One dispatch cycle: gate on pause state, collect jobs, execute them
    /// with bounded concurrency, reconcile, then run the mention pass. The
    /// dispatcher holds no state across invocations; everything is
    /// recomputed from the store.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, CoreError> {
        let control = {
            let guard = lock_store(&self.store)?;
            ControlState::load(&guard)?
        };

        match control.gate(now) {
            CycleGate::AuthExpired => {
                tracing::warn!(
                    reason = control.auth_reason.as_deref().unwrap_or("unknown"),
                    "skipping cycle: credentials expired, awaiting reauthentication"
                );
                return Ok(CycleReport::skipped_cycle(CycleOutcome::SkippedAuthExpired));
            }
            CycleGate::QuotaPaused => {
                tracing::info!("skipping cycle: quota pause active");
                return Ok(CycleReport::skipped_cycle(CycleOutcome::SkippedQuotaPause));
            }
            CycleGate::Proceed => {}
        }
        if control.quota_pause_expired(now) {
            let guard = lock_store(&self.store)?;
            clear_quota_pause(&guard)?;
            tracing::info!("quota pause expired, resuming dispatch");
        }

        let (jobs, skipped, personas) = self.collect_jobs(now)?;
        let dispatched = jobs.len();
        tracing::info!(dispatched, skipped, "collected dispatch jobs");

        let outcomes = self.execute_jobs(jobs, now).await;
        for outcome in &outcomes {
            tracing::debug!(
                ticket = outcome.ticket_id.as_str(),
                status = ?outcome.run_status,
                phase_completed = outcome.phase_completed,
                "job outcome"
            );
        }
        let completed = outcomes
            .iter()
            .filter(|outcome| outcome.phase_completed)
            .count();
        let timed_out = outcomes
            .iter()
            .filter(|outcome| outcome.run_status == Some(RunStatus::Timeout))
            .count();
        tracing::info!(completed, timed_out, "dispatch jobs reconciled");

        {
            let guard = lock_store(&self.store)?;
            record_heartbeat_idle(&guard, dispatched, completed, skipped)?;
        }

        let mentions = MentionDispatcher::default()
            .run(&self.store, &personas, self.api.as_ref(), Utc::now())
            .await?;

        Ok(CycleReport {
            outcome: CycleOutcome::Ran,
            dispatched,
            completed,
            skipped,
            mentions,
        })
    }

    /// Pulls scheduler candidates per project, resolves the needed phase,
    /// binds a persona, and stamps the ticket lock. Claims are in-memory
    /// sets scoped to this invocation only.
    fn collect_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Vec<DispatchJob>, usize, Vec<Persona>), CoreError> {
        let guard = lock_store(&self.store)?;
        record_heartbeat_running(&guard, now)?;

        let projects = guard.list_projects()?;
        let personas = guard.list_personas()?;

        let mut claimed_tickets: HashSet<TicketId> = HashSet::new();
        let mut busy_personas: HashSet<PersonaId> =
            guard.running_personas(now)?.into_iter().collect();

        let scheduler = Scheduler {
            batch_size: self.config.limits.schedule_batch_size,
            ..Scheduler::default()
        };

        let mut jobs = Vec::new();
        let mut skipped = 0;

        'projects: for project in &projects {
            let candidates =
                scheduler.candidates(&guard, &project.project_id, &claimed_tickets, now)?;
            for ticket in candidates {
                if jobs.len() >= self.config.limits.max_jobs {
                    break 'projects;
                }
                let phase = match ticket.needed_phase() {
                    NeededPhase::AwaitingApproval => {
                        skipped += 1;
                        continue;
                    }
                    NeededPhase::Run(phase) => phase,
                };
                let Some(persona) =
                    match_persona(&personas, &project.project_id, phase, &busy_personas)
                else {
                    skipped += 1;
                    continue;
                };

                claimed_tickets.insert(ticket.ticket_id.clone());
                busy_personas.insert(persona.persona_id.clone());
                guard.set_agent_activity(&ticket.ticket_id, Some(now))?;

                jobs.push(DispatchJob {
                    project: project.clone(),
                    ticket,
                    persona: persona.clone(),
                    phase,
                });
            }
        }

        Ok((jobs, skipped, personas))
    }

    /// Bounded worker pool: up to `concurrency` jobs in flight, a new job
    /// starting as soon as a slot frees. One job's failure never aborts the
    /// batch.
    async fn execute_jobs(&self, jobs: Vec<DispatchJob>, now: DateTime<Utc>) -> Vec<JobOutcome> {
        let context = JobContext {
            store: Arc::clone(&self.store),
            workspace: Arc::clone(&self.workspace),
            runner: Arc::clone(&self.runner),
            classifier: Arc::clone(&self.classifier),
            side_channel: Arc::clone(&self.side_channel),
            api: Arc::clone(&self.api),
            config: Arc::clone(&self.config),
        };

        let concurrency = self.config.limits.concurrency.max(1);
        let mut queue = jobs.into_iter();
        let mut join_set: JoinSet<JobOutcome> = JoinSet::new();
        let mut outcomes = Vec::new();

        loop {
            while join_set.len() < concurrency {
                let Some(job) = queue.next() else {
                    break;
                };
                let job_context = context.clone();
                join_set.spawn(async move { run_job(job_context, job, now).await });
            }
            match join_set.join_next().await {
                Some(Ok(outcome)) => outcomes.push(outcome),
                Some(Err(join_error)) => {
                    tracing::error!(error = %join_error, "dispatch job panicked");
                }
                None => break,
            }
        }

        outcomes
    }
}

async fn run_job(context: JobContext, job: DispatchJob, now: DateTime<Utc>) -> JobOutcome {
    let ticket_id = job.ticket.ticket_id.clone();
    match execute_job(&context, &job, now).await {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::error!(
                ticket = ticket_id.as_str(),
                phase = job.phase.as_str(),
                error = %error,
                "dispatch job failed"
            );
            if let Ok(guard) = lock_store(&context.store) {
                if let Err(clear_error) = guard.set_agent_activity(&ticket_id, None) {
                    tracing::warn!(
                        ticket = ticket_id.as_str(),
                        error = %clear_error,
                        "failed to clear ticket lock after job failure"
                    );
                }
            }
            JobOutcome {
                ticket_id,
                run_status: None,
                phase_completed: false,
            }
        }
    }
}

async fn execute_job(
    context: &JobContext,
    job: &DispatchJob,
    now: DateTime<Utc>,
) -> Result<JobOutcome, CoreError> {
    let ticket_id = job.ticket.ticket_id.clone();
    let workspace = context.workspace.provision(&job.project, &ticket_id)?;
    let document_kind = job.phase.document_kind();

    let session_dir = context
        .config
        .sessions_root
        .join(workspace_slug(&ticket_id))
        .join(job.phase.as_str());

    let (run, version_before) = {
        let mut guard = lock_store(&context.store)?;
        let version_before = guard.latest_document_version(&ticket_id, document_kind)?;
        let run = guard.start_run(
            NewRun {
                ticket_id: ticket_id.clone(),
                persona_id: job.persona.persona_id.clone(),
                phase: job.phase,
                allowed_tools: allowed_tools(job.phase),
                session_dir: session_dir.clone(),
                dispatch_source: DispatchSource::Scheduled,
            },
            now,
        )?;
        (run, version_before)
    };

    let invocation = AgentInvocation {
        binary: context.config.agent_binary.clone(),
        model: context.config.model.clone(),
        task: build_task(&job.ticket, job.phase),
        system_prompt: build_system_prompt(&job.persona, job.phase),
        allowed_tools: run.allowed_tools.clone(),
        timeout: phase_timeout(job.phase),
        session_dir,
        workdir: workspace.path.clone(),
    };
    let result = context.runner.run(&invocation).await;
    let finished_at = Utc::now();

    if result.timed_out {
        let guard = lock_store(&context.store)?;
        guard.finish_run(
            &run.run_id,
            RunStatus::Timeout,
            Some(&format!(
                "timed out after {}s",
                invocation.timeout.as_secs()
            )),
            finished_at,
        )?;
        guard.set_agent_activity(&ticket_id, None)?;
        tracing::warn!(
            ticket = ticket_id.as_str(),
            phase = job.phase.as_str(),
            "agent run timed out"
        );
        return Ok(JobOutcome {
            ticket_id,
            run_status: Some(RunStatus::Timeout),
            phase_completed: false,
        });
    }

    let stdout_chars = result.stdout.chars().count();
    let run_status = if result.exit_code == Some(0) && stdout_chars > MIN_OUTPUT_CHARS {
        RunStatus::Completed
    } else {
        RunStatus::Failed
    };

    if run_status == RunStatus::Failed {
        let captured = format!("{}\n{}", result.stderr, result.stdout);
        match context.classifier.classify(&captured) {
            FailureKind::CredentialExpiry => {
                {
                    let guard = lock_store(&context.store)?;
                    record_auth_expired(&guard, result.stderr.trim())?;
                    guard.set_agent_activity(&ticket_id, None)?;
                    guard.finish_run(
                        &run.run_id,
                        RunStatus::Failed,
                        Some("credentials expired"),
                        finished_at,
                    )?;
                }
                tracing::warn!(
                    ticket = ticket_id.as_str(),
                    "credential expiry detected, halting dispatch until reauthenticated"
                );
                match context.api.reauthorize().await {
                    Ok(response) if response.ok => {
                        tracing::info!("reauthorization request accepted");
                    }
                    Ok(response) => {
                        tracing::warn!(
                            error = response.error.as_deref().unwrap_or("unknown"),
                            "reauthorization request rejected"
                        );
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "reauthorization request failed");
                    }
                }
                return Ok(JobOutcome {
                    ticket_id,
                    run_status: Some(RunStatus::Failed),
                    phase_completed: false,
                });
            }
            FailureKind::QuotaExhausted => {
                let resume_at = quota_resume_time(&captured, finished_at);
                {
                    let guard = lock_store(&context.store)?;
                    record_quota_pause(&guard, resume_at, captured.trim())?;
                    guard.set_agent_activity(&ticket_id, None)?;
                    guard.finish_run(
                        &run.run_id,
                        RunStatus::Failed,
                        Some("quota exhausted"),
                        finished_at,
                    )?;
                }
                tracing::warn!(
                    ticket = ticket_id.as_str(),
                    resume_at = %resume_at,
                    "quota exhaustion detected, pausing dispatch"
                );
                return Ok(JobOutcome {
                    ticket_id,
                    run_status: Some(RunStatus::Failed),
                    phase_completed: false,
                });
            }
            FailureKind::Other => {}
        }
    }

    {
        let guard = lock_store(&context.store)?;
        match run_status {
            RunStatus::Completed => guard.finish_run(&run.run_id, run_status, None, finished_at)?,
            _ => guard.finish_run(
                &run.run_id,
                run_status,
                Some(&format!(
                    "exit code {}, stdout length {stdout_chars}",
                    result
                        .exit_code
                        .map(|code| code.to_string())
                        .unwrap_or_else(|| "none".to_owned())
                )),
                finished_at,
            )?,
        }
    }

    // Reconcile: the agent normally delivers its artifact through the side
    // channel while running; captured stdout is the fallback.
    let version_after = {
        let guard = lock_store(&context.store)?;
        guard.latest_document_version(&ticket_id, document_kind)?
    };

    let document_content = if version_after > version_before {
        let guard = lock_store(&context.store)?;
        guard
            .latest_document(&ticket_id, document_kind)?
            .map(|document| document.content)
    } else if run_status == RunStatus::Completed {
        match context.side_channel.save_document(
            &ticket_id,
            document_kind,
            &result.stdout,
            Some(&job.persona.persona_id),
        ) {
            Ok(version) => {
                tracing::info!(
                    ticket = ticket_id.as_str(),
                    version,
                    "stored captured stdout as the phase document"
                );
                Some(result.stdout.clone())
            }
            Err(error) => {
                tracing::warn!(
                    ticket = ticket_id.as_str(),
                    error = %error,
                    "failed to store fallback document"
                );
                None
            }
        }
    } else {
        None
    };

    let Some(content) = document_content else {
        let guard = lock_store(&context.store)?;
        guard.set_agent_activity(&ticket_id, None)?;
        return Ok(JobOutcome {
            ticket_id,
            run_status: Some(run_status),
            phase_completed: false,
        });
    };

    {
        let guard = lock_store(&context.store)?;
        guard.mark_phase_complete(&ticket_id, job.phase, &job.persona.persona_id, finished_at)?;
    }
    let summary = extract_summary(&content);
    if let Err(error) = context.side_channel.report(
        &ticket_id,
        Some(&job.persona.persona_id),
        &format!("{} phase complete. {summary}", job.phase.as_str()),
    ) {
        tracing::warn!(
            ticket = ticket_id.as_str(),
            error = %error,
            "failed to post phase summary comment"
        );
    }
    tracing::info!(
        ticket = ticket_id.as_str(),
        phase = job.phase.as_str(),
        persona = job.persona.persona_id.as_str(),
        "phase reconciled as complete"
    );

    Ok(JobOutcome {
        ticket_id,
        run_status: Some(run_status),
        phase_completed: true,
    })
}
