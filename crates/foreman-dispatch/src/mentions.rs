use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use foreman_core::{CoreError, Persona, Ticket, TicketId};
use regex::Regex;

use crate::control_api::{ControlApi, MentionDispatchRequest};
use crate::sidechannel::{lock_store, SharedStore};

/// How far back the secondary pass looks for agent comments.
pub const MENTION_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MentionReport {
    pub scanned: usize,
    pub dispatched: usize,
}

/// Word-boundary `@name` / `@role` matcher for one persona. `None` when the
/// persona has neither a usable name nor role.
pub fn mention_pattern(persona: &Persona) -> Option<Regex> {
    let mut alternatives = Vec::new();
    let name = persona.display_name.trim();
    if !name.is_empty() {
        alternatives.push(regex::escape(name));
    }
    let role = persona.role.trim();
    if !role.is_empty() {
        alternatives.push(regex::escape(role));
    }
    if alternatives.is_empty() {
        return None;
    }
    Regex::new(&format!(r"(?i)@(?:{})\b", alternatives.join("|"))).ok()
}

pub struct MentionDispatcher {
    window: Duration,
}

impl Default for MentionDispatcher {
    fn default() -> Self {
        Self {
            window: Duration::minutes(MENTION_WINDOW_MINUTES),
        }
    }
}

impl MentionDispatcher {
    /// Scans recent agent comments for directed mentions and fires reactive
    /// dispatches through the external API. Fire-and-forget: dispatch
    /// failures are logged and the scan continues. This path does not touch
    /// the scheduler's claim/lock bookkeeping.
    pub async fn run(
        &self,
        store: &SharedStore,
        personas: &[Persona],
        api: &dyn ControlApi,
        now: DateTime<Utc>,
    ) -> Result<MentionReport, CoreError> {
        let since = now - self.window;
        let (comments, tickets) = {
            let guard = lock_store(store)?;
            let comments = guard.recent_agent_comments(since)?;
            let mut tickets: HashMap<TicketId, Ticket> = HashMap::new();
            for comment in &comments {
                if tickets.contains_key(&comment.ticket_id) {
                    continue;
                }
                if let Some(ticket) = guard.get_ticket(&comment.ticket_id)? {
                    tickets.insert(comment.ticket_id.clone(), ticket);
                }
            }
            (comments, tickets)
        };

        let mut report = MentionReport {
            scanned: comments.len(),
            ..MentionReport::default()
        };

        for comment in &comments {
            let Some(author) = &comment.author_persona_id else {
                continue;
            };
            let Some(ticket) = tickets.get(&comment.ticket_id) else {
                continue;
            };

            for persona in personas {
                if &persona.persona_id == author {
                    continue;
                }
                if !persona.is_scoped_to(&ticket.project_id) {
                    continue;
                }
                let Some(pattern) = mention_pattern(persona) else {
                    continue;
                };
                if !pattern.is_match(&comment.content) {
                    continue;
                }

                let (already_running, latest_reply) = {
                    let guard = lock_store(store)?;
                    (
                        guard.has_running_run(&comment.ticket_id, &persona.persona_id, now)?,
                        guard.latest_comment_at_by(&comment.ticket_id, &persona.persona_id)?,
                    )
                };
                if already_running {
                    continue;
                }
                if latest_reply.is_some_and(|at| at > comment.created_at) {
                    continue;
                }

                let request = MentionDispatchRequest {
                    comment_content: comment.content.clone(),
                    target_persona_id: persona.persona_id.as_str().to_owned(),
                    conversational: true,
                };
                match api.dispatch_mention(request).await {
                    Ok(()) => {
                        report.dispatched += 1;
                        tracing::info!(
                            ticket = comment.ticket_id.as_str(),
                            persona = persona.persona_id.as_str(),
                            "dispatched reactive mention"
                        );
                    }
                    Err(error) => {
                        tracing::warn!(
                            ticket = comment.ticket_id.as_str(),
                            persona = persona.persona_id.as_str(),
                            error = %error,
                            "mention dispatch failed"
                        );
                    }
                }
            }
        }

        Ok(report)
    }
}
