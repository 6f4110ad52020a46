//! Practice persona catalogue
//!
//! Difficulty ids (`easy`, `medium`, `aggressive`) are what users pick; the
//! conversation server and session API know the personas by their backend
//! ids (`marcus`, `sarah`, `robert`).

use serde::Serialize;

/// Backend persona used when a difficulty id is not recognized.
pub const DEFAULT_BACKEND_ID: &str = "marcus";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Persona {
    pub id: &'static str,
    pub name: &'static str,
    pub difficulty: Difficulty,
    pub description: &'static str,
    pub backend_id: &'static str,
    /// Name the prospect introduces themselves with.
    pub prospect_name: &'static str,
}

pub const PERSONAS: [Persona; 3] = [
    Persona {
        id: "easy",
        name: "Friendly Client",
        difficulty: Difficulty::Easy,
        description: "A friendly client who is open to suggestions and easy to talk to.",
        backend_id: "marcus",
        prospect_name: "Marcus Johnson",
    },
    Persona {
        id: "medium",
        name: "Busy Professional",
        difficulty: Difficulty::Medium,
        description: "Has some questions and limited time. Requires concise communication.",
        backend_id: "sarah",
        prospect_name: "Sarah Mitchell",
    },
    Persona {
        id: "aggressive",
        name: "Skeptical Investor",
        difficulty: Difficulty::Aggressive,
        description: "Highly skeptical, interrupts frequently, and challenges your expertise.",
        backend_id: "robert",
        prospect_name: "Robert Chen",
    },
];

/// Look up a persona by difficulty id.
pub fn find(id: &str) -> Option<&'static Persona> {
    PERSONAS.iter().find(|p| p.id.eq_ignore_ascii_case(id.trim()))
}

/// Look up a persona by its backend id, as stored on sessions.
pub fn find_by_backend_id(backend_id: &str) -> Option<&'static Persona> {
    PERSONAS.iter().find(|p| p.backend_id == backend_id)
}

pub fn backend_persona_id(id: &str) -> &'static str {
    match find(id) {
        Some(persona) => persona.backend_id,
        None => {
            log::warn!(
                "Unknown persona '{}', falling back to {}",
                id,
                DEFAULT_BACKEND_ID
            );
            DEFAULT_BACKEND_ID
        }
    }
}

/// Human label for a backend persona id, e.g. `Robert Chen (Aggressive)`.
pub fn display_name(backend_id: &str) -> String {
    match find_by_backend_id(backend_id) {
        Some(p) => format!("{} ({:?})", p.prospect_name, p.difficulty),
        None => backend_id.to_string(),
    }
}
