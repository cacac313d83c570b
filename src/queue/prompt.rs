//! Worksheet prompts

use crate::types::catalog::SubjectCatalog;
use crate::types::job::GenerationJob;
use crate::types::message::ChatMessage;

/// Output recorded when the model finished without producing any text
pub const EMPTY_OUTPUT_MARKER: &str = "⚠️ Das Modell hat keine Ausgabe geliefert.";

/// Error message used when a failure carries no message of its own
pub const GENERIC_ERROR: &str = "Unbekannter Fehler bei der Generierung.";

pub const SYSTEM_PROMPT: &str = "Du bist eine Grundschul-Fachautor*in. Du erstellst altersgerechte Unterrichtsmaterialien, die exakt zur angegebenen Klassenstufe passen. Jede Ausgabe enthält strukturierte Aufgaben, klare Anweisungen und einen vollständigen Lösungsteil.";

const SECTIONS: [&str; 7] = [
    "Erstelle ein vollständiges Unterrichtsmaterial in deutscher Sprache mit folgenden Abschnitten:",
    "1. Titel",
    "2. Lernziele (2-3 Bulletpoints)",
    "3. Einleitungstext für die Schüler (2-3 Sätze)",
    "4. Aufgabenbereich mit mindestens drei Aufgaben (markiere jede Aufgabe mit leicht/mittel/schwer und nenne benötigtes Material)",
    "5. Differenzierungsidee (für Förder- und Forderkinder)",
    "6. Lösungsteil mit eindeutigen Antworten",
];

/// Build the user prompt for a job.
///
/// A specific prompt replaces the topic's sample prompts as inspiration.
pub fn user_prompt(job: &GenerationJob, catalog: &dyn SubjectCatalog) -> String {
    let topic = &job.topic;
    let subject_title = catalog
        .subject_title(&job.subject_id)
        .unwrap_or_else(|| job.subject_id.clone());

    let mut parts = vec![
        format!("Fach: {}", subject_title),
        format!("Klassenstufe: {}", job.grade),
        format!("Thema: {}", topic.label),
        format!("Beschreibung: {}", topic.description),
    ];

    if !topic.focus.is_empty() {
        parts.push(format!("Fokusthemen: {}.", topic.focus.join(", ")));
    }

    let inspiration: Vec<&str> = match job.specific_prompt.as_deref() {
        Some(prompt) if !prompt.trim().is_empty() => vec![prompt],
        _ => topic.sample_prompts.iter().map(String::as_str).collect(),
    };
    if !inspiration.is_empty() {
        parts.push(format!(
            "Inspiration aus der Themenbibliothek:\n- {}",
            inspiration.join("\n- ")
        ));
    }

    parts.extend(SECTIONS.iter().map(|s| s.to_string()));
    parts.join("\n\n")
}

/// System and user message for a job
pub fn build_messages(job: &GenerationJob, catalog: &dyn SubjectCatalog) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(user_prompt(job, catalog)),
    ]
}
