use std::fmt::Write as _;
use std::time::Duration;

use foreman_core::{Persona, Phase, Ticket};

/// Research and plan runs may only inspect; implement runs may change the
/// workspace and execute commands.
pub const READ_ONLY_TOOLS: &[&str] = &["Read", "Grep", "Glob", "WebSearch"];
pub const IMPLEMENT_TOOLS: &[&str] = &["Read", "Grep", "Glob", "Edit", "Write", "Bash"];

pub const RESEARCH_PLAN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const IMPLEMENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub fn allowed_tools(phase: Phase) -> Vec<String> {
    let tools = match phase {
        Phase::Research | Phase::Plan => READ_ONLY_TOOLS,
        Phase::Implement => IMPLEMENT_TOOLS,
    };
    tools.iter().map(|tool| (*tool).to_owned()).collect()
}

pub fn phase_timeout(phase: Phase) -> Duration {
    match phase {
        Phase::Research | Phase::Plan => RESEARCH_PLAN_TIMEOUT,
        Phase::Implement => IMPLEMENT_TIMEOUT,
    }
}

/// The work item description written to `task.md`.
pub fn build_task(ticket: &Ticket, phase: Phase) -> String {
    let mut task = format!("# {}\n\n{}\n", ticket.title, ticket.description.trim());
    if !ticket.criteria.is_empty() {
        task.push_str("\n## Acceptance criteria\n\n");
        for criterion in &ticket.criteria {
            let marker = if criterion.satisfied { "x" } else { " " };
            let _ = writeln!(task, "- [{marker}] {}", criterion.text);
        }
    }
    let directive = match phase {
        Phase::Research => {
            "Research this ticket: map the relevant code, prior art, and constraints."
        }
        Phase::Plan => "Write an implementation plan for this ticket based on the approved research.",
        Phase::Implement => "Implement this ticket according to the approved plan.",
    };
    let _ = write!(task, "\n## Your assignment\n\n{directive}\n");
    task
}

/// Persona identity, role guidance, phase output format, and side-channel
/// usage instructions, assembled into `system-prompt.txt`.
pub fn build_system_prompt(persona: &Persona, phase: Phase) -> String {
    let mut prompt = format!(
        "You are {}. Your role on this project: {}.\n",
        persona.display_name, persona.role
    );
    if !persona.skills.is_empty() {
        let _ = writeln!(prompt, "Your strengths: {}.", persona.skills.join(", "));
    }

    let output_format = match phase {
        Phase::Research => {
            "Produce a research document in markdown. Start with a `## Summary` \
             section, then findings with file references."
        }
        Phase::Plan => {
            "Produce an implementation plan in markdown. Start with a `## Summary` \
             section, then ordered steps with the files each step touches."
        }
        Phase::Implement => {
            "Make the changes in the working directory, then produce a change \
             summary in markdown starting with a `## Summary` section."
        }
    };
    let _ = write!(prompt, "\n{output_format}\n");

    prompt.push_str(
        "\nUse the provided side-channel operations as you work: `report` to post \
         a one-line progress update, `save-document` to upload your finished \
         document, and `check-criteria` to mark an acceptance criterion as \
         satisfied (zero-indexed). Save your document before exiting; empty \
         documents are rejected.\n",
    );
    prompt
}
