//! Prompt construction for the two extraction families.

use crate::llm::client::{EntityExtractionRequest, FactExtractionRequest};
use crate::types::{Episode, EpisodeKind};

/// How many characters of each previous episode to show as context.
const CONTEXT_SNIPPET_CHARS: usize = 400;

fn render_body(episode: &Episode) -> String {
    match episode.kind {
        EpisodeKind::Text | EpisodeKind::Structured => episode.body.clone(),
        EpisodeKind::Conversation => format!("(conversation transcript)\n{}", episode.body),
    }
}

fn render_previous(previous: &[Episode]) -> String {
    if previous.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nEarlier context from the same group:\n");
    for episode in previous {
        let snippet: String = episode.body.chars().take(CONTEXT_SNIPPET_CHARS).collect();
        out.push_str(&format!("- [{}] {}\n", episode.name, snippet));
    }
    out
}

pub fn entity_extraction_system(request: &EntityExtractionRequest<'_>) -> String {
    format!(
        "You extract entities from text into a knowledge graph.\n\
         Return every distinct real-world entity mentioned in the episode.\n\
         Each entity gets exactly one label from this ontology:\n{}\n\
         Rules:\n\
         - If an entity in the episode refers to one of the known entities \
           listed by the user, reuse that exact name.\n\
         - Fill attribute values only when the episode states them; \
           leave unknown attributes out.\n\
         - Do not invent entities that are not in the episode.",
        request.ontology.describe()
    )
}

pub fn entity_extraction_user(request: &EntityExtractionRequest<'_>) -> String {
    let known = if request.known_entities.is_empty() {
        String::from("(none)")
    } else {
        request.known_entities.join(", ")
    };
    format!(
        "Known entities in this graph: {}\n{}\nEpisode \"{}\" ({}):\n{}",
        known,
        render_previous(request.previous_episodes),
        request.episode.name,
        request.episode.kind.as_str(),
        render_body(request.episode),
    )
}

pub fn fact_extraction_system() -> String {
    "You extract relationships between known entities from text.\n\
     Return one fact per directed relation the episode asserts.\n\
     Rules:\n\
     - source_name and target_name must be names from the provided entity list.\n\
     - relation_name is a short snake_case verb phrase, e.g. works_at.\n\
     - fact is one self-contained sentence stating the relation.\n\
     - valid_at / invalid_at are RFC 3339 timestamps when the episode says \
       when the relation started or ended; otherwise leave them empty.\n\
     - Set negates to true when the fact states that a previously true \
       relation between the two entities has ceased."
        .to_string()
}

pub fn fact_extraction_user(request: &FactExtractionRequest<'_>) -> String {
    let entities: Vec<String> = request
        .entities
        .iter()
        .map(|e| format!("{} ({})", e.canonical_name, e.primary_label()))
        .collect();
    format!(
        "Entities: {}\n{}\nEpisode \"{}\" (reference time {}):\n{}",
        entities.join(", "),
        render_previous(request.previous_episodes),
        request.episode.name,
        request.episode.reference_time.to_rfc3339(),
        render_body(request.episode),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::Ontology;

    #[test]
    fn entity_prompt_carries_ontology_and_known_names() {
        let ontology = Ontology::builtin();
        let episode = Episode::new(
            "e1".into(),
            "Alice joined Acme.".into(),
            EpisodeKind::Text,
            "test".into(),
            "g1".into(),
        );
        let known = vec!["Acme".to_string()];
        let request = EntityExtractionRequest {
            episode: &episode,
            known_entities: &known,
            previous_episodes: &[],
            ontology: &ontology,
        };
        let system = entity_extraction_system(&request);
        let user = entity_extraction_user(&request);
        assert!(system.contains("Person"));
        assert!(user.contains("Acme"));
        assert!(user.contains("Alice joined Acme."));
    }
}
