use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CommentId, DocumentId, PersonaId, ProjectId, RunId, TicketId};

/// Kanban column a ticket sits in. Distinct from [`Phase`], which names the
/// unit of agent work; a ticket in `Planning` may still need its research
/// phase run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Backlog,
    Planning,
    Building,
    Test,
    Shipped,
}

impl TicketState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Planning => "planning",
            Self::Building => "building",
            Self::Test => "test",
            Self::Shipped => "shipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backlog" => Some(Self::Backlog),
            "planning" => Some(Self::Planning),
            "building" => Some(Self::Building),
            "test" => Some(Self::Test),
            "shipped" => Some(Self::Shipped),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Shipped)
    }

    /// Columns the dispatcher pulls work from. `Test` waits on human
    /// verification and `Shipped` is terminal.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Backlog | Self::Planning | Self::Building)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Plan,
    Implement,
}

impl Phase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Implement => "implement",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "research" => Some(Self::Research),
            "plan" => Some(Self::Plan),
            "implement" => Some(Self::Implement),
            _ => None,
        }
    }

    /// Artifact the phase is expected to deliver through the side channel.
    pub const fn document_kind(self) -> DocumentKind {
        match self {
            Self::Research => DocumentKind::Research,
            Self::Plan => DocumentKind::ImplementationPlan,
            Self::Implement => DocumentKind::Design,
        }
    }
}

/// What a ticket needs next, derived from its phase timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeededPhase {
    Run(Phase),
    /// A completed phase is waiting on human approval; the ticket is not
    /// dispatchable until the approval lands.
    AwaitingApproval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    Abandoned,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchSource {
    Scheduled,
    Mention,
}

impl DispatchSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Mention => "mention",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "mention" => Some(Self::Mention),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Research,
    ImplementationPlan,
    Design,
}

impl DocumentKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::ImplementationPlan => "implementation_plan",
            Self::Design => "design",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "research" => Some(Self::Research),
            "implementation_plan" => Some(Self::ImplementationPlan),
            "design" => Some(Self::Design),
            _ => None,
        }
    }
}

/// One acceptance-criterion line on a ticket. Stored as a JSON array column
/// and parsed once at the row boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub text: String,
    #[serde(default)]
    pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub project_id: ProjectId,
    pub name: String,
    pub repo_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub persona_id: PersonaId,
    pub display_name: String,
    pub role: String,
    /// `None` scopes the persona company-wide.
    pub project_id: Option<ProjectId>,
    pub skills: Vec<String>,
}

impl Persona {
    pub fn is_scoped_to(&self, project_id: &ProjectId) -> bool {
        match &self.project_id {
            Some(scope) => scope == project_id,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub ticket_id: TicketId,
    pub title: String,
    pub description: String,
    pub ticket_type: String,
    pub state: TicketState,
    pub priority: i64,
    pub project_id: ProjectId,
    pub assignee_persona_id: Option<PersonaId>,
    /// Soft lock: stamped when a cycle claims the ticket, cleared when the
    /// attempt fails so the next cycle retries without waiting out the
    /// lock window.
    pub last_agent_activity: Option<DateTime<Utc>>,
    pub last_human_comment_at: Option<DateTime<Utc>>,
    pub returned_from_verification: bool,
    pub research_completed_at: Option<DateTime<Utc>>,
    pub research_completed_by: Option<PersonaId>,
    pub research_approved_at: Option<DateTime<Utc>>,
    pub research_approved_by: Option<PersonaId>,
    pub plan_completed_at: Option<DateTime<Utc>>,
    pub plan_completed_by: Option<PersonaId>,
    pub plan_approved_at: Option<DateTime<Utc>>,
    pub plan_approved_by: Option<PersonaId>,
    pub criteria: Vec<Criterion>,
    pub created_at: DateTime<Utc>,
}

impl Ticket {
    /// Phase order is strictly research → plan → implement; a phase is
    /// needed only once its predecessor is both completed and approved.
    pub fn needed_phase(&self) -> NeededPhase {
        if self.research_completed_at.is_none() {
            return NeededPhase::Run(Phase::Research);
        }
        if self.research_approved_at.is_none() {
            return NeededPhase::AwaitingApproval;
        }
        if self.plan_completed_at.is_none() {
            return NeededPhase::Run(Phase::Plan);
        }
        if self.plan_approved_at.is_none() {
            return NeededPhase::AwaitingApproval;
        }
        NeededPhase::Run(Phase::Implement)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub run_id: RunId,
    pub ticket_id: TicketId,
    pub persona_id: PersonaId,
    pub phase: Phase,
    pub status: RunStatus,
    pub allowed_tools: Vec<String>,
    pub session_dir: PathBuf,
    pub dispatch_source: DispatchSource,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub document_id: DocumentId,
    pub ticket_id: TicketId,
    pub kind: DocumentKind,
    pub content: String,
    pub version: i64,
    pub author_persona_id: Option<PersonaId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub comment_id: CommentId,
    pub ticket_id: TicketId,
    /// `None` marks a human author.
    pub author_persona_id: Option<PersonaId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ticket() -> Ticket {
        Ticket {
            ticket_id: TicketId::new("t-1"),
            title: "Add retry backoff to sync".to_owned(),
            description: String::new(),
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
            criteria: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ticket_with_no_research_needs_research() {
        assert_eq!(
            sample_ticket().needed_phase(),
            NeededPhase::Run(Phase::Research)
        );
    }

    #[test]
    fn completed_but_unapproved_research_awaits_approval() {
        let mut ticket = sample_ticket();
        ticket.research_completed_at = Some(Utc::now());
        assert_eq!(ticket.needed_phase(), NeededPhase::AwaitingApproval);
    }

    #[test]
    fn approved_research_needs_plan() {
        let mut ticket = sample_ticket();
        ticket.research_completed_at = Some(Utc::now());
        ticket.research_approved_at = Some(Utc::now());
        assert_eq!(ticket.needed_phase(), NeededPhase::Run(Phase::Plan));
    }

    #[test]
    fn completed_but_unapproved_plan_awaits_approval() {
        let mut ticket = sample_ticket();
        ticket.research_completed_at = Some(Utc::now());
        ticket.research_approved_at = Some(Utc::now());
        ticket.plan_completed_at = Some(Utc::now());
        assert_eq!(ticket.needed_phase(), NeededPhase::AwaitingApproval);
    }

    #[test]
    fn fully_approved_plan_needs_implement() {
        let mut ticket = sample_ticket();
        ticket.research_completed_at = Some(Utc::now());
        ticket.research_approved_at = Some(Utc::now());
        ticket.plan_completed_at = Some(Utc::now());
        ticket.plan_approved_at = Some(Utc::now());
        assert_eq!(ticket.needed_phase(), NeededPhase::Run(Phase::Implement));
    }

    #[test]
    fn only_shipped_is_terminal() {
        assert!(TicketState::Shipped.is_terminal());
        assert!(!TicketState::Test.is_terminal());
        assert!(!TicketState::Building.is_terminal());
    }

    #[test]
    fn test_column_is_not_dispatchable() {
        assert!(TicketState::Building.is_dispatchable());
        assert!(!TicketState::Test.is_dispatchable());
        assert!(!TicketState::Shipped.is_dispatchable());
    }
}
