//! Persona profiles and the system prompts built from them.

use serde::{Deserialize, Serialize};

use crate::update::PersonaSummary;

/// A named response profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub age: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_sector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communication_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_in_debate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub income_bracket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub political_leanings: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geographic_context: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

const GUARDRAILS: &str = "\
# Core Behavior Rules
- Respond only as the persona defined below. Never speak in another persona's voice or step out of character.
- Earlier turns may contain a transcript of other personas' replies labeled [Name]: .... Do not adopt their names, styles or views.
- Keep answers brief (1-3 sentences) unless the user asks for detail, and ask a natural follow-up question when it helps.
- Sound like a real person. No meta-commentary, no speaker tags, no transcript headers.
- Never fabricate statistics; express uncertainty instead.
- Let your views evolve through conversation while keeping your core values.

# Official Persona Details:

";

impl Persona {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// System prompt for this persona: fixed behavior rules, then each non-empty attribute
    /// as a `Field: value` line.
    pub fn system_prompt(&self) -> String {
        let fields: [(&str, Option<&str>); 10] = [
            ("Name", Some(self.name.as_str())),
            ("Age", Some(self.age.as_str())),
            ("Gender", Some(self.gender.as_str())),
            ("Job Sector", self.job_sector.as_deref()),
            ("Stance", self.stance.as_deref()),
            ("Communication Style", self.communication_style.as_deref()),
            ("Debate Goal", self.goal_in_debate.as_deref()),
            ("Income Bracket", self.income_bracket.as_deref()),
            ("Political Leanings", self.political_leanings.as_deref()),
            ("Geographic Context", self.geographic_context.as_deref()),
        ];
        let details: Vec<String> = fields
            .into_iter()
            .filter_map(|(label, value)| {
                value
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| format!("{}: {}", label, v))
            })
            .collect();
        format!("{}{}", GUARDRAILS, details.join("\n"))
    }

    pub fn summary(&self) -> PersonaSummary {
        PersonaSummary {
            persona_id: self.id.clone(),
            persona_name: self.name.clone(),
            persona_occupation: self.job_sector.clone(),
            persona_stance: self.stance.clone(),
        }
    }
}

/// Minimal persona identity used for display-name lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl PersonaRef {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
        }
    }
}

impl From<&Persona> for PersonaRef {
    fn from(p: &Persona) -> Self {
        Self {
            id: p.id.clone(),
            name: Some(p.name.clone()),
        }
    }
}

/// Active, non-archived personas in the order of `active_ids`.
pub fn resolve_active(all: &[Persona], active_ids: &[String]) -> Vec<Persona> {
    active_ids
        .iter()
        .filter_map(|id| all.iter().find(|p| &p.id == id && !p.archived))
        .cloned()
        .collect()
}

/// Display name for `persona_id`, falling back to the id itself.
pub fn display_name(all: &[Persona], persona_id: &str) -> String {
    all.iter()
        .find(|p| p.id == persona_id)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| persona_id.to_string())
}
