use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{
    AgentRun, Comment, Criterion, DispatchSource, Document, DocumentKind, Persona, Phase, Project,
    RunStatus, Ticket, TicketState,
};
use crate::error::CoreError;
use crate::ids::{CommentId, DocumentId, PersonaId, ProjectId, RunId, TicketId};

/// Running rows older than this are reclassified to `timeout` on read.
pub const RUN_STALENESS_MINUTES: i64 = 30;

static ROW_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str, now: DateTime<Utc>) -> String {
    let seq = ROW_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{seq}", now.timestamp_millis())
}

fn encode_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| CoreError::Persistence(format!("invalid timestamp '{value}': {err}")))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, CoreError> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_json_list<T: serde::de::DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<Vec<T>, CoreError> {
    serde_json::from_str(value)
        .map_err(|err| CoreError::Persistence(format!("invalid JSON in column {column}: {err}")))
}

fn encode_json_list<T: serde::Serialize>(column: &str, value: &[T]) -> Result<String, CoreError> {
    serde_json::to_string(value)
        .map_err(|err| CoreError::Persistence(format!("failed to encode column {column}: {err}")))
}

/// Fields the dispatcher supplies when opening a new run row.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub ticket_id: TicketId,
    pub persona_id: PersonaId,
    pub phase: Phase,
    pub allowed_tools: Vec<String>,
    pub session_dir: PathBuf,
    pub dispatch_source: DispatchSource,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let conn = Connection::open(path).map_err(|err| CoreError::Persistence(err.to_string()))?;
        let store = Self { conn };
        store.bootstrap()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, CoreError> {
        let conn =
            Connection::open_in_memory().map_err(|err| CoreError::Persistence(err.to_string()))?;
        let store = Self { conn };
        store.bootstrap()?;
        Ok(store)
    }

    fn bootstrap(&self) -> Result<(), CoreError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    project_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    repo_path TEXT
                );
                CREATE TABLE IF NOT EXISTS personas (
                    persona_id TEXT PRIMARY KEY,
                    display_name TEXT NOT NULL,
                    role TEXT NOT NULL,
                    project_id TEXT,
                    skills TEXT NOT NULL DEFAULT '[]'
                );
                CREATE TABLE IF NOT EXISTS tickets (
                    ticket_id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    ticket_type TEXT NOT NULL DEFAULT 'feature',
                    state TEXT NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 0,
                    project_id TEXT NOT NULL,
                    assignee_persona_id TEXT,
                    last_agent_activity TEXT,
                    last_human_comment_at TEXT,
                    returned_from_verification INTEGER NOT NULL DEFAULT 0,
                    research_completed_at TEXT,
                    research_completed_by TEXT,
                    research_approved_at TEXT,
                    research_approved_by TEXT,
                    plan_completed_at TEXT,
                    plan_completed_by TEXT,
                    plan_approved_at TEXT,
                    plan_approved_by TEXT,
                    criteria TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS agent_runs (
                    run_id TEXT PRIMARY KEY,
                    ticket_id TEXT NOT NULL,
                    persona_id TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    status TEXT NOT NULL,
                    allowed_tools TEXT NOT NULL DEFAULT '[]',
                    session_dir TEXT NOT NULL,
                    dispatch_source TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    duration_ms INTEGER,
                    error_message TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_agent_runs_persona_status
                    ON agent_runs (persona_id, status);
                CREATE TABLE IF NOT EXISTS documents (
                    document_id TEXT PRIMARY KEY,
                    ticket_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    content TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    author_persona_id TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE (ticket_id, kind, version)
                );
                CREATE TABLE IF NOT EXISTS comments (
                    comment_id TEXT PRIMARY KEY,
                    ticket_id TEXT NOT NULL,
                    author_persona_id TEXT,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                ",
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))
    }

    // --- projects ---

    pub fn upsert_project(&self, project: &Project) -> Result<(), CoreError> {
        self.conn
            .execute(
                "
                INSERT INTO projects (project_id, name, repo_path)
                VALUES (?1, ?2, ?3)
                ON CONFLICT (project_id) DO UPDATE SET name = ?2, repo_path = ?3
                ",
                params![
                    project.project_id.as_str(),
                    project.name,
                    project
                        .repo_path
                        .as_ref()
                        .map(|path| path.to_string_lossy().to_string()),
                ],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, CoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT project_id, name, repo_path FROM projects ORDER BY name ASC")
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|err| CoreError::Persistence(err.to_string()))?;

        let mut projects = Vec::new();
        for row in rows {
            let (project_id, name, repo_path) =
                row.map_err(|err| CoreError::Persistence(err.to_string()))?;
            projects.push(Project {
                project_id: ProjectId::new(project_id),
                name,
                repo_path: repo_path.map(PathBuf::from),
            });
        }
        Ok(projects)
    }

    // --- personas ---

    pub fn upsert_persona(&self, persona: &Persona) -> Result<(), CoreError> {
        let skills = encode_json_list("skills", &persona.skills)?;
        self.conn
            .execute(
                "
                INSERT INTO personas (persona_id, display_name, role, project_id, skills)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (persona_id) DO UPDATE SET
                    display_name = ?2, role = ?3, project_id = ?4, skills = ?5
                ",
                params![
                    persona.persona_id.as_str(),
                    persona.display_name,
                    persona.role,
                    persona.project_id.as_ref().map(|id| id.as_str().to_owned()),
                    skills,
                ],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }

    pub fn list_personas(&self) -> Result<Vec<Persona>, CoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT persona_id, display_name, role, project_id, skills
                 FROM personas ORDER BY persona_id ASC",
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|err| CoreError::Persistence(err.to_string()))?;

        let mut personas = Vec::new();
        for row in rows {
            let (persona_id, display_name, role, project_id, skills) =
                row.map_err(|err| CoreError::Persistence(err.to_string()))?;
            personas.push(Persona {
                persona_id: PersonaId::new(persona_id),
                display_name,
                role,
                project_id: project_id.map(ProjectId::new),
                skills: parse_json_list("skills", &skills)?,
            });
        }
        Ok(personas)
    }

    // --- tickets ---

    pub fn upsert_ticket(&self, ticket: &Ticket) -> Result<(), CoreError> {
        let criteria = encode_json_list("criteria", &ticket.criteria)?;
        self.conn
            .execute(
                "
                INSERT INTO tickets (
                    ticket_id, title, description, ticket_type, state, priority, project_id,
                    assignee_persona_id, last_agent_activity, last_human_comment_at,
                    returned_from_verification,
                    research_completed_at, research_completed_by,
                    research_approved_at, research_approved_by,
                    plan_completed_at, plan_completed_by,
                    plan_approved_at, plan_approved_by,
                    criteria, created_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                    ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21
                )
                ON CONFLICT (ticket_id) DO UPDATE SET
                    title = ?2, description = ?3, ticket_type = ?4, state = ?5, priority = ?6,
                    project_id = ?7, assignee_persona_id = ?8, last_agent_activity = ?9,
                    last_human_comment_at = ?10, returned_from_verification = ?11,
                    research_completed_at = ?12, research_completed_by = ?13,
                    research_approved_at = ?14, research_approved_by = ?15,
                    plan_completed_at = ?16, plan_completed_by = ?17,
                    plan_approved_at = ?18, plan_approved_by = ?19,
                    criteria = ?20, created_at = ?21
                ",
                params![
                    ticket.ticket_id.as_str(),
                    ticket.title,
                    ticket.description,
                    ticket.ticket_type,
                    ticket.state.as_str(),
                    ticket.priority,
                    ticket.project_id.as_str(),
                    ticket
                        .assignee_persona_id
                        .as_ref()
                        .map(|id| id.as_str().to_owned()),
                    ticket.last_agent_activity.map(encode_ts),
                    ticket.last_human_comment_at.map(encode_ts),
                    ticket.returned_from_verification,
                    ticket.research_completed_at.map(encode_ts),
                    ticket
                        .research_completed_by
                        .as_ref()
                        .map(|id| id.as_str().to_owned()),
                    ticket.research_approved_at.map(encode_ts),
                    ticket
                        .research_approved_by
                        .as_ref()
                        .map(|id| id.as_str().to_owned()),
                    ticket.plan_completed_at.map(encode_ts),
                    ticket
                        .plan_completed_by
                        .as_ref()
                        .map(|id| id.as_str().to_owned()),
                    ticket.plan_approved_at.map(encode_ts),
                    ticket
                        .plan_approved_by
                        .as_ref()
                        .map(|id| id.as_str().to_owned()),
                    criteria,
                    encode_ts(ticket.created_at),
                ],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }

    pub fn get_ticket(&self, ticket_id: &TicketId) -> Result<Option<Ticket>, CoreError> {
        let row = self
            .conn
            .query_row(
                &format!("{TICKET_SELECT} WHERE ticket_id = ?1"),
                params![ticket_id.as_str()],
                map_ticket_columns,
            )
            .optional()
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        row.map(ticket_from_columns).transpose()
    }

    /// Tickets in a dispatchable column for one project. Lock-window
    /// filtering and ordering happen in the scheduler.
    pub fn list_dispatchable_tickets(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<Ticket>, CoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{TICKET_SELECT} WHERE project_id = ?1 AND state IN ('backlog', 'planning', 'building')"
            ))
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        let rows = stmt
            .query_map(params![project_id.as_str()], map_ticket_columns)
            .map_err(|err| CoreError::Persistence(err.to_string()))?;

        let mut tickets = Vec::new();
        for row in rows {
            let columns = row.map_err(|err| CoreError::Persistence(err.to_string()))?;
            tickets.push(ticket_from_columns(columns)?);
        }
        Ok(tickets)
    }

    pub fn set_agent_activity(
        &self,
        ticket_id: &TicketId,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        self.conn
            .execute(
                "UPDATE tickets SET last_agent_activity = ?2 WHERE ticket_id = ?1",
                params![ticket_id.as_str(), at.map(encode_ts)],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }

    pub fn set_ticket_state(
        &self,
        ticket_id: &TicketId,
        state: TicketState,
    ) -> Result<(), CoreError> {
        self.conn
            .execute(
                "UPDATE tickets SET state = ?2 WHERE ticket_id = ?1",
                params![ticket_id.as_str(), state.as_str()],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }

    /// Research and plan completions stamp the phase pair; an implement
    /// completion moves the ticket to the verification column instead.
    pub fn mark_phase_complete(
        &self,
        ticket_id: &TicketId,
        phase: Phase,
        persona_id: &PersonaId,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let statement = match phase {
            Phase::Research => {
                "UPDATE tickets SET research_completed_at = ?2, research_completed_by = ?3
                 WHERE ticket_id = ?1"
            }
            Phase::Plan => {
                "UPDATE tickets SET plan_completed_at = ?2, plan_completed_by = ?3
                 WHERE ticket_id = ?1"
            }
            Phase::Implement => {
                "UPDATE tickets SET state = 'test', returned_from_verification = 0,
                     last_agent_activity = ?2, assignee_persona_id = ?3
                 WHERE ticket_id = ?1"
            }
        };
        self.conn
            .execute(
                statement,
                params![ticket_id.as_str(), encode_ts(now), persona_id.as_str()],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }

    pub fn mark_criterion_satisfied(
        &self,
        ticket_id: &TicketId,
        index: usize,
    ) -> Result<(), CoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT criteria FROM tickets WHERE ticket_id = ?1",
                params![ticket_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        let Some(raw) = raw else {
            return Err(CoreError::Persistence(format!(
                "ticket '{}' not found while marking criterion",
                ticket_id.as_str()
            )));
        };

        let mut criteria: Vec<Criterion> = parse_json_list("criteria", &raw)?;
        let Some(criterion) = criteria.get_mut(index) else {
            return Err(CoreError::Configuration(format!(
                "ticket '{}' has no acceptance criterion at index {index}",
                ticket_id.as_str()
            )));
        };
        criterion.satisfied = true;

        let encoded = encode_json_list("criteria", &criteria)?;
        self.conn
            .execute(
                "UPDATE tickets SET criteria = ?2 WHERE ticket_id = ?1",
                params![ticket_id.as_str(), encoded],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }

    // --- agent runs ---

    /// Opens a `running` row. Any other `running` row for the same persona is
    /// first marked `abandoned`; a leftover row means a previous invocation
    /// crashed mid-run.
    pub fn start_run(&mut self, new_run: NewRun, now: DateTime<Utc>) -> Result<AgentRun, CoreError> {
        let allowed_tools = encode_json_list("allowed_tools", &new_run.allowed_tools)?;
        let run_id = RunId::new(next_id("run", now));

        let tx = self
            .conn
            .transaction()
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        tx.execute(
            "UPDATE agent_runs SET status = 'abandoned', completed_at = ?2,
                 error_message = 'superseded by a newer dispatch for this persona'
             WHERE persona_id = ?1 AND status = 'running'",
            params![new_run.persona_id.as_str(), encode_ts(now)],
        )
        .map_err(|err| CoreError::Persistence(err.to_string()))?;
        tx.execute(
            "
            INSERT INTO agent_runs (
                run_id, ticket_id, persona_id, phase, status, allowed_tools,
                session_dir, dispatch_source, started_at
            ) VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6, ?7, ?8)
            ",
            params![
                run_id.as_str(),
                new_run.ticket_id.as_str(),
                new_run.persona_id.as_str(),
                new_run.phase.as_str(),
                allowed_tools,
                new_run.session_dir.to_string_lossy().to_string(),
                new_run.dispatch_source.as_str(),
                encode_ts(now),
            ],
        )
        .map_err(|err| CoreError::Persistence(err.to_string()))?;
        tx.commit()
            .map_err(|err| CoreError::Persistence(err.to_string()))?;

        Ok(AgentRun {
            run_id,
            ticket_id: new_run.ticket_id,
            persona_id: new_run.persona_id,
            phase: new_run.phase,
            status: RunStatus::Running,
            allowed_tools: new_run.allowed_tools,
            session_dir: new_run.session_dir,
            dispatch_source: new_run.dispatch_source,
            started_at: now,
            completed_at: None,
            duration_ms: None,
            error_message: None,
        })
    }

    pub fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let started_at: Option<String> = self
            .conn
            .query_row(
                "SELECT started_at FROM agent_runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        let Some(started_at) = started_at else {
            return Err(CoreError::Persistence(format!(
                "agent run '{}' not found while finishing",
                run_id.as_str()
            )));
        };
        let duration_ms = (now - parse_ts(&started_at)?).num_milliseconds().max(0);

        self.conn
            .execute(
                "UPDATE agent_runs SET status = ?2, completed_at = ?3, duration_ms = ?4,
                     error_message = ?5
                 WHERE run_id = ?1",
                params![
                    run_id.as_str(),
                    status.as_str(),
                    encode_ts(now),
                    duration_ms,
                    error_message,
                ],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }

    /// Read-time sweep: no run is ever reported as perpetually running.
    fn reclassify_stale_runs(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        let cutoff = now - Duration::minutes(RUN_STALENESS_MINUTES);
        self.conn
            .execute(
                "UPDATE agent_runs SET status = 'timeout', completed_at = ?2,
                     error_message = 'reclassified: running row exceeded the staleness threshold'
                 WHERE status = 'running' AND started_at < ?1",
                params![encode_ts(cutoff), encode_ts(now)],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }

    pub fn list_runs_for_ticket(
        &self,
        ticket_id: &TicketId,
        now: DateTime<Utc>,
    ) -> Result<Vec<AgentRun>, CoreError> {
        self.reclassify_stale_runs(now)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{RUN_SELECT} WHERE ticket_id = ?1 ORDER BY started_at ASC"
            ))
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        let rows = stmt
            .query_map(params![ticket_id.as_str()], map_run_columns)
            .map_err(|err| CoreError::Persistence(err.to_string()))?;

        let mut runs = Vec::new();
        for row in rows {
            let columns = row.map_err(|err| CoreError::Persistence(err.to_string()))?;
            runs.push(run_from_columns(columns)?);
        }
        Ok(runs)
    }

    pub fn has_running_run(
        &self,
        ticket_id: &TicketId,
        persona_id: &PersonaId,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.reclassify_stale_runs(now)?;
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM agent_runs
                 WHERE ticket_id = ?1 AND persona_id = ?2 AND status = 'running'",
                params![ticket_id.as_str(), persona_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(count > 0)
    }

    /// Personas with a live running row anywhere; used to derive busy state
    /// at the start of a cycle.
    pub fn running_personas(&self, now: DateTime<Utc>) -> Result<Vec<PersonaId>, CoreError> {
        self.reclassify_stale_runs(now)?;
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT persona_id FROM agent_runs WHERE status = 'running'")
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| CoreError::Persistence(err.to_string()))?;

        let mut personas = Vec::new();
        for row in rows {
            personas.push(PersonaId::new(
                row.map_err(|err| CoreError::Persistence(err.to_string()))?,
            ));
        }
        Ok(personas)
    }

    // --- documents ---

    pub fn latest_document_version(
        &self,
        ticket_id: &TicketId,
        kind: DocumentKind,
    ) -> Result<i64, CoreError> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(version) FROM documents WHERE ticket_id = ?1 AND kind = ?2",
                params![ticket_id.as_str(), kind.as_str()],
                |row| row.get(0),
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(version.unwrap_or(0))
    }

    pub fn latest_document(
        &self,
        ticket_id: &TicketId,
        kind: DocumentKind,
    ) -> Result<Option<Document>, CoreError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "{DOCUMENT_SELECT} WHERE ticket_id = ?1 AND kind = ?2
                     ORDER BY version DESC LIMIT 1"
                ),
                params![ticket_id.as_str(), kind.as_str()],
                map_document_columns,
            )
            .optional()
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        row.map(document_from_columns).transpose()
    }

    /// Appends the next version for (ticket, kind). Versions are monotonic;
    /// the UNIQUE constraint backstops concurrent writers.
    pub fn append_document(
        &mut self,
        ticket_id: &TicketId,
        kind: DocumentKind,
        content: &str,
        author_persona_id: Option<&PersonaId>,
        now: DateTime<Utc>,
    ) -> Result<Document, CoreError> {
        let document_id = DocumentId::new(next_id("doc", now));
        let tx = self
            .conn
            .transaction()
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        let version: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM documents
                 WHERE ticket_id = ?1 AND kind = ?2",
                params![ticket_id.as_str(), kind.as_str()],
                |row| row.get(0),
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        tx.execute(
            "
            INSERT INTO documents (
                document_id, ticket_id, kind, content, version, author_persona_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                document_id.as_str(),
                ticket_id.as_str(),
                kind.as_str(),
                content,
                version,
                author_persona_id.map(|id| id.as_str().to_owned()),
                encode_ts(now),
            ],
        )
        .map_err(|err| CoreError::Persistence(err.to_string()))?;
        tx.commit()
            .map_err(|err| CoreError::Persistence(err.to_string()))?;

        Ok(Document {
            document_id,
            ticket_id: ticket_id.clone(),
            kind,
            content: content.to_owned(),
            version,
            author_persona_id: author_persona_id.cloned(),
            created_at: now,
        })
    }

    // --- comments ---

    pub fn insert_comment(
        &self,
        ticket_id: &TicketId,
        author_persona_id: Option<&PersonaId>,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Comment, CoreError> {
        let comment_id = CommentId::new(next_id("comment", now));
        self.conn
            .execute(
                "
                INSERT INTO comments (comment_id, ticket_id, author_persona_id, content, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![
                    comment_id.as_str(),
                    ticket_id.as_str(),
                    author_persona_id.map(|id| id.as_str().to_owned()),
                    content,
                    encode_ts(now),
                ],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;

        if author_persona_id.is_none() {
            self.conn
                .execute(
                    "UPDATE tickets SET last_human_comment_at = ?2 WHERE ticket_id = ?1",
                    params![ticket_id.as_str(), encode_ts(now)],
                )
                .map_err(|err| CoreError::Persistence(err.to_string()))?;
        }

        Ok(Comment {
            comment_id,
            ticket_id: ticket_id.clone(),
            author_persona_id: author_persona_id.cloned(),
            content: content.to_owned(),
            created_at: now,
        })
    }

    /// Agent-authored comments newer than `since` on non-terminal tickets.
    pub fn recent_agent_comments(&self, since: DateTime<Utc>) -> Result<Vec<Comment>, CoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT c.comment_id, c.ticket_id, c.author_persona_id, c.content, c.created_at
                FROM comments c
                JOIN tickets t ON t.ticket_id = c.ticket_id
                WHERE c.author_persona_id IS NOT NULL
                  AND c.created_at >= ?1
                  AND t.state != 'shipped'
                ORDER BY c.created_at ASC
                ",
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        let rows = stmt
            .query_map(params![encode_ts(since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|err| CoreError::Persistence(err.to_string()))?;

        let mut comments = Vec::new();
        for row in rows {
            let (comment_id, ticket_id, author, content, created_at) =
                row.map_err(|err| CoreError::Persistence(err.to_string()))?;
            comments.push(Comment {
                comment_id: CommentId::new(comment_id),
                ticket_id: TicketId::new(ticket_id),
                author_persona_id: author.map(PersonaId::new),
                content,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(comments)
    }

    pub fn latest_comment_at_by(
        &self,
        ticket_id: &TicketId,
        persona_id: &PersonaId,
    ) -> Result<Option<DateTime<Utc>>, CoreError> {
        let created_at: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(created_at) FROM comments
                 WHERE ticket_id = ?1 AND author_persona_id = ?2",
                params![ticket_id.as_str(), persona_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        parse_opt_ts(created_at)
    }

    // --- settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, CoreError> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| CoreError::Persistence(err.to_string()))
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = ?2",
                params![key, value],
            )
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<(), CoreError> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        Ok(())
    }
}

const TICKET_SELECT: &str = "
    SELECT ticket_id, title, description, ticket_type, state, priority, project_id,
           assignee_persona_id, last_agent_activity, last_human_comment_at,
           returned_from_verification,
           research_completed_at, research_completed_by,
           research_approved_at, research_approved_by,
           plan_completed_at, plan_completed_by,
           plan_approved_at, plan_approved_by,
           criteria, created_at
    FROM tickets";

type TicketColumns = (
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    bool,
    [Option<String>; 8],
    String,
    String,
);

fn map_ticket_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<TicketColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        [
            row.get(11)?,
            row.get(12)?,
            row.get(13)?,
            row.get(14)?,
            row.get(15)?,
            row.get(16)?,
            row.get(17)?,
            row.get(18)?,
        ],
        row.get(19)?,
        row.get(20)?,
    ))
}

fn ticket_from_columns(columns: TicketColumns) -> Result<Ticket, CoreError> {
    let (
        ticket_id,
        title,
        description,
        ticket_type,
        state,
        priority,
        project_id,
        assignee,
        last_agent_activity,
        last_human_comment_at,
        returned_from_verification,
        [research_completed_at, research_completed_by, research_approved_at, research_approved_by, plan_completed_at, plan_completed_by, plan_approved_at, plan_approved_by],
        criteria,
        created_at,
    ) = columns;

    let state = TicketState::parse(&state)
        .ok_or_else(|| CoreError::Persistence(format!("unknown ticket state '{state}'")))?;

    Ok(Ticket {
        ticket_id: TicketId::new(ticket_id),
        title,
        description,
        ticket_type,
        state,
        priority,
        project_id: ProjectId::new(project_id),
        assignee_persona_id: assignee.map(PersonaId::new),
        last_agent_activity: parse_opt_ts(last_agent_activity)?,
        last_human_comment_at: parse_opt_ts(last_human_comment_at)?,
        returned_from_verification,
        research_completed_at: parse_opt_ts(research_completed_at)?,
        research_completed_by: research_completed_by.map(PersonaId::new),
        research_approved_at: parse_opt_ts(research_approved_at)?,
        research_approved_by: research_approved_by.map(PersonaId::new),
        plan_completed_at: parse_opt_ts(plan_completed_at)?,
        plan_completed_by: plan_completed_by.map(PersonaId::new),
        plan_approved_at: parse_opt_ts(plan_approved_at)?,
        plan_approved_by: plan_approved_by.map(PersonaId::new),
        criteria: parse_json_list("criteria", &criteria)?,
        created_at: parse_ts(&created_at)?,
    })
}

const RUN_SELECT: &str = "
    SELECT run_id, ticket_id, persona_id, phase, status, allowed_tools, session_dir,
           dispatch_source, started_at, completed_at, duration_ms, error_message
    FROM agent_runs";

type RunColumns = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    Option<String>,
);

fn map_run_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn run_from_columns(columns: RunColumns) -> Result<AgentRun, CoreError> {
    let (
        run_id,
        ticket_id,
        persona_id,
        phase,
        status,
        allowed_tools,
        session_dir,
        dispatch_source,
        started_at,
        completed_at,
        duration_ms,
        error_message,
    ) = columns;

    let phase = Phase::parse(&phase)
        .ok_or_else(|| CoreError::Persistence(format!("unknown run phase '{phase}'")))?;
    let status = RunStatus::parse(&status)
        .ok_or_else(|| CoreError::Persistence(format!("unknown run status '{status}'")))?;
    let dispatch_source = DispatchSource::parse(&dispatch_source).ok_or_else(|| {
        CoreError::Persistence(format!("unknown dispatch source '{dispatch_source}'"))
    })?;

    Ok(AgentRun {
        run_id: RunId::new(run_id),
        ticket_id: TicketId::new(ticket_id),
        persona_id: PersonaId::new(persona_id),
        phase,
        status,
        allowed_tools: parse_json_list("allowed_tools", &allowed_tools)?,
        session_dir: PathBuf::from(session_dir),
        dispatch_source,
        started_at: parse_ts(&started_at)?,
        completed_at: parse_opt_ts(completed_at)?,
        duration_ms,
        error_message,
    })
}

const DOCUMENT_SELECT: &str = "
    SELECT document_id, ticket_id, kind, content, version, author_persona_id, created_at
    FROM documents";

type DocumentColumns = (
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    String,
);

fn map_document_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn document_from_columns(columns: DocumentColumns) -> Result<Document, CoreError> {
    let (document_id, ticket_id, kind, content, version, author, created_at) = columns;
    let kind = DocumentKind::parse(&kind)
        .ok_or_else(|| CoreError::Persistence(format!("unknown document kind '{kind}'")))?;
    Ok(Document {
        document_id: DocumentId::new(document_id),
        ticket_id: TicketId::new(ticket_id),
        kind,
        content,
        version,
        author_persona_id: author.map(PersonaId::new),
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_project(store: &SqliteStore) -> Project {
        let project = Project {
            project_id: ProjectId::new("p-1"),
            name: "gateway".to_owned(),
            repo_path: None,
        };
        store.upsert_project(&project).expect("upsert project");
        project
    }

    fn sample_ticket(store: &SqliteStore, id: &str) -> Ticket {
        let ticket = Ticket {
            ticket_id: TicketId::new(id),
            title: format!("ticket {id}"),
            description: "Add request tracing to the gateway.".to_owned(),
            ticket_type: "feature".to_owned(),
            state: TicketState::Backlog,
            priority: 1,
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
                text: "traces include the ticket id".to_owned(),
                satisfied: false,
            }],
            created_at: Utc::now(),
        };
        store.upsert_ticket(&ticket).expect("upsert ticket");
        ticket
    }

    fn sample_new_run(ticket_id: &str, persona_id: &str) -> NewRun {
        NewRun {
            ticket_id: TicketId::new(ticket_id),
            persona_id: PersonaId::new(persona_id),
            phase: Phase::Research,
            allowed_tools: vec!["read".to_owned(), "grep".to_owned()],
            session_dir: PathBuf::from("/tmp/foreman/sessions/t-1/research"),
            dispatch_source: DispatchSource::Scheduled,
        }
    }

    #[test]
    fn ticket_round_trips_through_the_store() {
        let store = SqliteStore::in_memory().expect("store");
        sample_project(&store);
        let ticket = sample_ticket(&store, "t-1");

        let loaded = store
            .get_ticket(&ticket.ticket_id)
            .expect("get ticket")
            .expect("ticket exists");
        assert_eq!(loaded.title, ticket.title);
        assert_eq!(loaded.state, TicketState::Backlog);
        assert_eq!(loaded.criteria.len(), 1);
        assert!(!loaded.criteria[0].satisfied);
    }

    #[test]
    fn dispatchable_listing_excludes_test_and_shipped_columns() {
        let store = SqliteStore::in_memory().expect("store");
        let project = sample_project(&store);
        sample_ticket(&store, "t-1");
        let mut shipped = sample_ticket(&store, "t-2");
        shipped.state = TicketState::Shipped;
        store.upsert_ticket(&shipped).expect("upsert");
        let mut in_test = sample_ticket(&store, "t-3");
        in_test.state = TicketState::Test;
        store.upsert_ticket(&in_test).expect("upsert");

        let tickets = store
            .list_dispatchable_tickets(&project.project_id)
            .expect("list");
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].ticket_id.as_str(), "t-1");
    }

    #[test]
    fn starting_a_run_abandons_the_personas_previous_running_row() {
        let mut store = SqliteStore::in_memory().expect("store");
        sample_project(&store);
        sample_ticket(&store, "t-1");
        let now = Utc::now();

        let first = store
            .start_run(sample_new_run("t-1", "per-1"), now)
            .expect("first run");
        let second = store
            .start_run(sample_new_run("t-1", "per-1"), now + Duration::seconds(5))
            .expect("second run");

        let runs = store
            .list_runs_for_ticket(&TicketId::new("t-1"), now + Duration::seconds(10))
            .expect("list runs");
        assert_eq!(runs.len(), 2);
        let first_row = runs
            .iter()
            .find(|run| run.run_id == first.run_id)
            .expect("first row");
        assert_eq!(first_row.status, RunStatus::Abandoned);
        let second_row = runs
            .iter()
            .find(|run| run.run_id == second.run_id)
            .expect("second row");
        assert_eq!(second_row.status, RunStatus::Running);
    }

    #[test]
    fn stale_running_rows_read_back_as_timeout() {
        let mut store = SqliteStore::in_memory().expect("store");
        sample_project(&store);
        sample_ticket(&store, "t-1");
        let started = Utc::now();

        store
            .start_run(sample_new_run("t-1", "per-1"), started)
            .expect("run");

        let just_inside = started + Duration::minutes(RUN_STALENESS_MINUTES - 1);
        let runs = store
            .list_runs_for_ticket(&TicketId::new("t-1"), just_inside)
            .expect("list");
        assert_eq!(runs[0].status, RunStatus::Running);

        let past_threshold = started + Duration::minutes(RUN_STALENESS_MINUTES + 1);
        let runs = store
            .list_runs_for_ticket(&TicketId::new("t-1"), past_threshold)
            .expect("list");
        assert_eq!(runs[0].status, RunStatus::Timeout);
    }

    #[test]
    fn finish_run_records_duration_and_error() {
        let mut store = SqliteStore::in_memory().expect("store");
        sample_project(&store);
        sample_ticket(&store, "t-1");
        let started = Utc::now();

        let run = store
            .start_run(sample_new_run("t-1", "per-1"), started)
            .expect("run");
        store
            .finish_run(
                &run.run_id,
                RunStatus::Failed,
                Some("exit code 2, stdout length 12"),
                started + Duration::seconds(30),
            )
            .expect("finish");

        let runs = store
            .list_runs_for_ticket(&TicketId::new("t-1"), started + Duration::seconds(31))
            .expect("list");
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].duration_ms, Some(30_000));
        assert_eq!(
            runs[0].error_message.as_deref(),
            Some("exit code 2, stdout length 12")
        );
    }

    #[test]
    fn document_versions_increase_monotonically_per_kind() {
        let mut store = SqliteStore::in_memory().expect("store");
        sample_project(&store);
        sample_ticket(&store, "t-1");
        let now = Utc::now();
        let ticket_id = TicketId::new("t-1");

        let first = store
            .append_document(&ticket_id, DocumentKind::Research, "findings", None, now)
            .expect("first");
        let second = store
            .append_document(&ticket_id, DocumentKind::Research, "more findings", None, now)
            .expect("second");
        let plan = store
            .append_document(
                &ticket_id,
                DocumentKind::ImplementationPlan,
                "steps",
                None,
                now,
            )
            .expect("plan");

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(plan.version, 1);
        assert_eq!(
            store
                .latest_document_version(&ticket_id, DocumentKind::Research)
                .expect("version"),
            2
        );
    }

    #[test]
    fn human_comments_stamp_last_human_comment_at() {
        let store = SqliteStore::in_memory().expect("store");
        sample_project(&store);
        let ticket = sample_ticket(&store, "t-1");
        let now = Utc::now();

        store
            .insert_comment(&ticket.ticket_id, None, "please prioritize this", now)
            .expect("comment");

        let loaded = store
            .get_ticket(&ticket.ticket_id)
            .expect("get")
            .expect("exists");
        assert!(loaded.last_human_comment_at.is_some());
    }

    #[test]
    fn recent_agent_comments_skip_human_authors_and_shipped_tickets() {
        let store = SqliteStore::in_memory().expect("store");
        sample_project(&store);
        let ticket = sample_ticket(&store, "t-1");
        let mut shipped = sample_ticket(&store, "t-2");
        shipped.state = TicketState::Shipped;
        store.upsert_ticket(&shipped).expect("upsert");
        let now = Utc::now();
        let persona = PersonaId::new("per-1");

        store
            .insert_comment(&ticket.ticket_id, Some(&persona), "@reviewer take a look", now)
            .expect("agent comment");
        store
            .insert_comment(&ticket.ticket_id, None, "human note", now)
            .expect("human comment");
        store
            .insert_comment(&shipped.ticket_id, Some(&persona), "@reviewer ping", now)
            .expect("shipped comment");

        let comments = store
            .recent_agent_comments(now - Duration::minutes(15))
            .expect("recent");
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].ticket_id, ticket.ticket_id);
    }

    #[test]
    fn mark_criterion_satisfied_is_idempotent() {
        let store = SqliteStore::in_memory().expect("store");
        sample_project(&store);
        let ticket = sample_ticket(&store, "t-1");

        store
            .mark_criterion_satisfied(&ticket.ticket_id, 0)
            .expect("first mark");
        store
            .mark_criterion_satisfied(&ticket.ticket_id, 0)
            .expect("second mark");

        let loaded = store
            .get_ticket(&ticket.ticket_id)
            .expect("get")
            .expect("exists");
        assert!(loaded.criteria[0].satisfied);

        let err = store
            .mark_criterion_satisfied(&ticket.ticket_id, 7)
            .expect_err("out of range");
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn settings_round_trip_and_delete() {
        let store = SqliteStore::in_memory().expect("store");
        store
            .set_setting("heartbeat.status", "running")
            .expect("set");
        assert_eq!(
            store.get_setting("heartbeat.status").expect("get").as_deref(),
            Some("running")
        );
        store
            .set_setting("heartbeat.status", "idle")
            .expect("overwrite");
        assert_eq!(
            store.get_setting("heartbeat.status").expect("get").as_deref(),
            Some("idle")
        );
        store.delete_setting("heartbeat.status").expect("delete");
        assert_eq!(store.get_setting("heartbeat.status").expect("get"), None);
    }

    #[test]
    fn implement_completion_moves_ticket_to_test() {
        let store = SqliteStore::in_memory().expect("store");
        sample_project(&store);
        let mut ticket = sample_ticket(&store, "t-1");
        ticket.state = TicketState::Building;
        ticket.returned_from_verification = true;
        store.upsert_ticket(&ticket).expect("upsert");

        store
            .mark_phase_complete(
                &ticket.ticket_id,
                Phase::Implement,
                &PersonaId::new("per-1"),
                Utc::now(),
            )
            .expect("complete");

        let loaded = store
            .get_ticket(&ticket.ticket_id)
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.state, TicketState::Test);
        assert!(!loaded.returned_from_verification);
    }
}
