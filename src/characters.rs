use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Vietnamese third-person pronouns a character may be bound to.
pub const VI_PRONOUNS: [&str; 17] = [
    "anh", "cô", "ông", "bà", "hắn", "y", "nàng", "nó", "chị", "em", "cậu", "lão", "gã", "mụ",
    "thị", "chàng", "họ",
];

#[must_use]
pub fn is_known_pronoun(p: &str) -> bool {
    let p = p.trim().to_lowercase();
    VI_PRONOUNS.iter().any(|k| *k == p)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub description: String,
    /// Pronoun used for every third-person reference to this character.
    pub pronoun: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,
    pub introduced_in: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_in: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterProposal {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub description: String,
    pub pronoun: String,
    #[serde(default)]
    pub register: Option<String>,
    /// Set only when the chapter explicitly shows the earlier pronoun was wrong.
    #[serde(default)]
    pub correction: bool,
}

impl CharacterProposal {
    #[must_use]
    pub fn new(name: impl Into<String>, pronoun: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: String::new(),
            description: String::new(),
            pronoun: pronoun.into(),
            register: None,
            correction: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CharacterMergeEvent {
    Added {
        name: String,
        pronoun: String,
    },
    Kept {
        name: String,
        existing: String,
        proposed: String,
    },
    Corrected {
        name: String,
        from: String,
        to: String,
    },
    Invalid {
        name: String,
        reason: &'static str,
    },
}

/// Character identity to pronoun/register attributes.
///
/// The earliest established attributes win. A later proposal replaces them
/// only when flagged as a correction and carrying a known pronoun.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterContext {
    characters: BTreeMap<String, CharacterProfile>,
}

impl CharacterContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.characters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CharacterProfile> {
        self.characters.get(name.trim())
    }

    pub fn profiles(&self) -> impl Iterator<Item = &CharacterProfile> {
        self.characters.values()
    }

    pub fn merge(
        &mut self,
        proposals: impl IntoIterator<Item = CharacterProposal>,
        ordinal: u32,
    ) -> Vec<CharacterMergeEvent> {
        let mut events = Vec::new();
        for p in proposals {
            let name = p.name.trim().to_string();
            if name.is_empty() {
                continue;
            }
            let pronoun = p.pronoun.trim().to_lowercase();
            let register = p
                .register
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());

            let Some(existing) = self.characters.get_mut(&name) else {
                if !is_known_pronoun(&pronoun) {
                    events.push(CharacterMergeEvent::Invalid {
                        name,
                        reason: "unknown pronoun",
                    });
                    continue;
                }
                events.push(CharacterMergeEvent::Added {
                    name: name.clone(),
                    pronoun: pronoun.clone(),
                });
                self.characters.insert(
                    name.clone(),
                    CharacterProfile {
                        name,
                        role: p.role.trim().to_string(),
                        description: p.description.trim().to_string(),
                        pronoun,
                        register,
                        introduced_in: ordinal,
                        corrected_in: None,
                    },
                );
                continue;
            };

            if !p.description.trim().is_empty() {
                existing.description = p.description.trim().to_string();
            }
            if !p.role.trim().is_empty() {
                existing.role = p.role.trim().to_string();
            }
            if existing.pronoun == pronoun {
                continue;
            }
            if p.correction && is_known_pronoun(&pronoun) {
                events.push(CharacterMergeEvent::Corrected {
                    name: name.clone(),
                    from: existing.pronoun.clone(),
                    to: pronoun.clone(),
                });
                existing.pronoun = pronoun;
                if register.is_some() {
                    existing.register = register;
                }
                existing.corrected_in = Some(ordinal);
            } else {
                events.push(CharacterMergeEvent::Kept {
                    name,
                    existing: existing.pronoun.clone(),
                    proposed: pronoun,
                });
            }
        }
        events
    }

    /// Characters added or corrected by commits after `since_ordinal` and named in `text`.
    #[must_use]
    pub fn changed_after<'a>(&'a self, since_ordinal: u32, text: &str) -> Vec<&'a CharacterProfile> {
        self.characters
            .values()
            .filter(|c| {
                let changed = c.introduced_in > since_ordinal
                    || c.corrected_in.is_some_and(|o| o > since_ordinal);
                changed && text.contains(&c.name)
            })
            .collect()
    }

    /// Hard pronoun constraints for the translation prompt.
    #[must_use]
    pub fn render_pronoun_rules(&self) -> String {
        if self.characters.is_empty() {
            return String::new();
        }
        let mut out = String::from(
            "CHARACTER PRONOUN RULES (absolute):\n\
             - Translate he/him/his/she/her for these characters with exactly the pronoun given.\n\
             - Do not vary pronouns for style and do not replace them with names.\n\n\
             Pronoun mapping:\n",
        );
        for c in self.characters.values() {
            out.push_str(&format!("- \"{}\" MUST be referred to as \"{}\"", c.name, c.pronoun));
            if let Some(reg) = c.register.as_deref() {
                out.push_str(&format!(" (register: {reg})"));
            }
            out.push('\n');
        }
        out
    }

    /// `- Name | role | description | pronoun` lines, the format the character model reads back.
    #[must_use]
    pub fn render_lines(&self) -> String {
        self.characters
            .values()
            .map(|c| format!("- {} | {} | {} | {}", c.name, c.role, c.description, c.pronoun))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
