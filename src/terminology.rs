use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Ordinal of the chapter whose commit introduced the entry.
    pub introduced_in: u32,
}

/// A glossary entry proposed by the translation invoker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermProposal {
    pub source: String,
    pub target: String,
    #[serde(default, alias = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl TermProposal {
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: None,
            note: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TermApplyEvent {
    Added {
        source: String,
        target: String,
    },
    Rejected {
        source: String,
        existing_target: String,
        proposed_target: String,
    },
    Invalid {
        source: String,
        reason: &'static str,
    },
}

/// Append-only term mapping. Entries are never altered or removed once present.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Glossary {
    entries: BTreeMap<String, GlossaryEntry>,
}

fn clean(s: Option<&String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn target_problem(target: &str) -> Option<&'static str> {
    if target.is_empty() {
        return Some("empty target");
    }
    if target.contains('(') || target.contains(')') {
        return Some("target carries a parenthetical");
    }
    None
}

impl Glossary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, source: &str) -> Option<&GlossaryEntry> {
        self.entries.get(source.trim())
    }

    pub fn entries(&self) -> impl Iterator<Item = &GlossaryEntry> {
        self.entries.values()
    }

    /// Merges proposals; the existing mapping always wins over a new proposal.
    pub fn apply_additions(
        &mut self,
        proposals: impl IntoIterator<Item = TermProposal>,
        ordinal: u32,
    ) -> Vec<TermApplyEvent> {
        let mut events = Vec::new();
        for p in proposals {
            let source = p.source.trim();
            let target = p.target.trim();
            if source.is_empty() {
                continue;
            }
            if let Some(existing) = self.entries.get(source) {
                if existing.target != target {
                    events.push(TermApplyEvent::Rejected {
                        source: source.to_string(),
                        existing_target: existing.target.clone(),
                        proposed_target: target.to_string(),
                    });
                }
                continue;
            }
            if let Some(reason) = target_problem(target) {
                events.push(TermApplyEvent::Invalid {
                    source: source.to_string(),
                    reason,
                });
                continue;
            }
            self.entries.insert(
                source.to_string(),
                GlossaryEntry {
                    source: source.to_string(),
                    target: target.to_string(),
                    kind: clean(p.kind.as_ref()),
                    note: clean(p.note.as_ref()),
                    introduced_in: ordinal,
                },
            );
            events.push(TermApplyEvent::Added {
                source: source.to_string(),
                target: target.to_string(),
            });
        }
        events
    }

    /// Entries whose source term occurs in `text`, longest terms first.
    #[must_use]
    pub fn relevant_for_text<'a>(&'a self, text: &str, max_items: usize) -> Vec<&'a GlossaryEntry> {
        if self.entries.is_empty() || text.is_empty() || max_items == 0 {
            return Vec::new();
        }
        let mut items: Vec<&GlossaryEntry> = self
            .entries
            .values()
            .filter(|e| text.contains(&e.source))
            .collect();
        items.sort_by(|a, b| {
            b.source
                .len()
                .cmp(&a.source.len())
                .then_with(|| a.source.cmp(&b.source))
        });
        items.truncate(max_items);
        items
    }

    /// Entries introduced by commits after `since_ordinal` whose term occurs in `text`.
    #[must_use]
    pub fn introduced_after<'a>(&'a self, since_ordinal: u32, text: &str) -> Vec<&'a GlossaryEntry> {
        self.entries
            .values()
            .filter(|e| e.introduced_in > since_ordinal && text.contains(&e.source))
            .collect()
    }

    #[must_use]
    pub fn render_for_prompt(terms: &[&GlossaryEntry]) -> String {
        if terms.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        out.push_str("GLOSSARY (mandatory; always use these exact translations):\n");
        for t in terms {
            out.push_str("- ");
            out.push_str(&t.source);
            out.push_str(" => ");
            out.push_str(&t.target);
            if let Some(kind) = t.kind.as_deref() {
                out.push_str(" [");
                out.push_str(kind);
                out.push(']');
            }
            if let Some(note) = t.note.as_deref() {
                out.push_str(" (");
                out.push_str(note);
                out.push(')');
            }
            out.push('\n');
        }
        out
    }
}
