//! Domain records, identifiers, and the sqlite-backed store shared by the
//! dispatcher and the application binary.

mod domain;
mod error;
mod ids;
mod store;

pub use domain::{
    AgentRun, Comment, Criterion, Document, DocumentKind, DispatchSource, NeededPhase, Persona,
    Phase, Project, RunStatus, Ticket, TicketState,
};
pub use error::CoreError;
pub use ids::{CommentId, DocumentId, PersonaId, ProjectId, RunId, TicketId};
pub use store::{NewRun, SqliteStore, RUN_STALENESS_MINUTES};
