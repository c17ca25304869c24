use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use foreman_core::{CoreError, ProjectId, SqliteStore, Ticket, TicketId, TicketState};

/// Minimum elapsed time since `last_agent_activity` before a ticket is
/// eligible for re-dispatch. Bounds double-dispatch between overlapping
/// cycles without a database-level lock.
pub const LOCK_WINDOW_MINUTES: i64 = 30;
pub const DEFAULT_SCHEDULE_BATCH_SIZE: usize = 5;

#[derive(Debug, Clone)]
pub struct Scheduler {
    pub batch_size: usize,
    pub lock_window: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SCHEDULE_BATCH_SIZE,
            lock_window: Duration::minutes(LOCK_WINDOW_MINUTES),
        }
    }
}

impl Scheduler {
    /// Candidates for one project: dispatchable column, lock window elapsed,
    /// not yet claimed this cycle, ordered, truncated to the batch size.
    pub fn candidates(
        &self,
        store: &SqliteStore,
        project_id: &ProjectId,
        claimed: &HashSet<TicketId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, CoreError> {
        let mut tickets: Vec<Ticket> = store
            .list_dispatchable_tickets(project_id)?
            .into_iter()
            .filter(|ticket| self.lock_elapsed(ticket, now))
            .filter(|ticket| !claimed.contains(&ticket.ticket_id))
            .collect();
        order_candidates(&mut tickets);
        tickets.truncate(self.batch_size);
        Ok(tickets)
    }

    fn lock_elapsed(&self, ticket: &Ticket, now: DateTime<Utc>) -> bool {
        match ticket.last_agent_activity {
            None => true,
            Some(at) => now - at > self.lock_window,
        }
    }
}

/// Ordered tie-break predicates, not a numeric score: unresolved human
/// comment, returned from verification, mid-implementation, unstarted, then
/// priority descending and age ascending.
pub fn order_candidates(tickets: &mut [Ticket]) {
    tickets.sort_by(|a, b| {
        b.last_human_comment_at
            .is_some()
            .cmp(&a.last_human_comment_at.is_some())
            .then_with(|| {
                b.returned_from_verification
                    .cmp(&a.returned_from_verification)
            })
            .then_with(|| {
                (b.state == TicketState::Building).cmp(&(a.state == TicketState::Building))
            })
            .then_with(|| {
                (b.state == TicketState::Backlog).cmp(&(a.state == TicketState::Backlog))
            })
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}
