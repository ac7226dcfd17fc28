use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SegmentationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading(u8),
    ListItem,
    Quote,
}

impl BlockKind {
    /// Maps a (prefix-free, lowercase) element name to a block kind.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "p" => Some(Self::Paragraph),
            "li" => Some(Self::ListItem),
            "blockquote" => Some(Self::Quote),
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                tag[1..].parse::<u8>().ok().map(Self::Heading)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn tag(&self) -> String {
        match self {
            Self::Paragraph => "p".to_string(),
            Self::Heading(level) => format!("h{level}"),
            Self::ListItem => "li".to_string(),
            Self::Quote => "blockquote".to_string(),
        }
    }

    #[must_use]
    pub fn is_heading(&self) -> bool {
        matches!(self, Self::Heading(_))
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Smallest translation unit. `index` and `kind` never change after segmentation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: usize,
    pub kind: BlockKind,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Block {
    #[must_use]
    pub fn new(index: usize, kind: BlockKind, source: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            source: source.into(),
            target: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterKind {
    FrontMatter,
    Narrative,
}

impl ChapterKind {
    #[must_use]
    pub fn is_narrative(&self) -> bool {
        matches!(self, Self::Narrative)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FrontMatter => "front_matter",
            Self::Narrative => "narrative",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chapter {
    pub ordinal: u32,
    pub kind: ChapterKind,
    pub title: Option<String>,
    pub blocks: Vec<Block>,
}

impl Chapter {
    #[must_use]
    pub fn source_text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.source.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[must_use]
    pub fn label(&self) -> String {
        match self.title.as_deref() {
            Some(t) => format!("chapter {} ({t})", self.ordinal),
            None => format!("chapter {}", self.ordinal),
        }
    }
}

/// Ordered chapters of one source EPUB.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Book {
    pub source_id: String,
    chapters: Vec<Chapter>,
}

impl Book {
    /// Ordinals must run 1..=n and block indexes 0..len inside each chapter.
    pub fn new(
        source_id: impl Into<String>,
        chapters: Vec<Chapter>,
    ) -> Result<Self, SegmentationError> {
        if chapters.is_empty() {
            return Err(SegmentationError::Empty);
        }
        for (i, ch) in chapters.iter().enumerate() {
            let expected = i as u32 + 1;
            if ch.ordinal != expected {
                return Err(SegmentationError::Ordinal {
                    expected,
                    found: ch.ordinal,
                });
            }
            for (j, b) in ch.blocks.iter().enumerate() {
                if b.index != j {
                    return Err(SegmentationError::BlockIndex {
                        ordinal: ch.ordinal,
                        expected: j,
                        found: b.index,
                    });
                }
            }
        }
        Ok(Self {
            source_id: source_id.into(),
            chapters,
        })
    }

    #[must_use]
    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    #[must_use]
    pub fn chapter(&self, ordinal: u32) -> Option<&Chapter> {
        let idx = (ordinal as usize).checked_sub(1)?;
        self.chapters.get(idx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }
}

/// Lifecycle of a chapter inside the transaction manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterState {
    Pending,
    Translating,
    ValidatingTranslation,
    Editing,
    ValidatingEdit,
    Committing,
    Committed,
    Failed,
    Aborted,
}

impl ChapterState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    #[must_use]
    pub fn can_transition_to(&self, next: ChapterState) -> bool {
        use ChapterState::*;
        match (self, next) {
            (Committed | Aborted, _) => false,
            (_, Failed) => !matches!(self, Failed),
            (Pending, Translating | Committed) => true,
            (Translating, ValidatingTranslation) => true,
            (ValidatingTranslation, Translating | Editing | ValidatingEdit) => true,
            (Editing, ValidatingEdit) => true,
            (ValidatingEdit, Committing) => true,
            (Committing, Committed | ValidatingTranslation | Translating) => true,
            (Failed, Pending | Aborted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ChapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Translating => "translating",
            Self::ValidatingTranslation => "validating_translation",
            Self::Editing => "editing",
            Self::ValidatingEdit => "validating_edit",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}
