use std::collections::HashSet;

use foreman_core::{Persona, PersonaId, Phase, ProjectId};

/// Role slug preferred for research phases when any such persona is in scope.
pub const RESEARCH_ROLE: &str = "researcher";
/// General-purpose role required for plan and implement phases, and the
/// research fallback.
pub const IMPLEMENTER_ROLE: &str = "implementer";

/// Binds an idle persona to a ticket's needed phase. Scoping admits personas
/// assigned to the project and company-wide personas; busy exclusion is the
/// caller's per-cycle claim set plus personas with live running rows.
pub fn match_persona<'a>(
    personas: &'a [Persona],
    project_id: &ProjectId,
    phase: Phase,
    busy: &HashSet<PersonaId>,
) -> Option<&'a Persona> {
    let available = |persona: &&Persona| {
        persona.is_scoped_to(project_id) && !busy.contains(&persona.persona_id)
    };

    match phase {
        Phase::Research => personas
            .iter()
            .filter(available)
            .find(|persona| persona.role == RESEARCH_ROLE)
            .or_else(|| {
                personas
                    .iter()
                    .filter(available)
                    .find(|persona| persona.role == IMPLEMENTER_ROLE)
            }),
        Phase::Plan | Phase::Implement => personas
            .iter()
            .filter(available)
            .find(|persona| persona.role == IMPLEMENTER_ROLE),
    }
}
