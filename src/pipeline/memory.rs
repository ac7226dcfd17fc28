//! Human-inspectable copies of the narrative state, rewritten after each commit.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

use crate::characters::CharacterProfile;
use crate::pipeline::state::NarrativeSnapshot;
use crate::terminology::GlossaryEntry;

pub const GLOSSARY_FILE: &str = "glossary.json";
pub const CHARACTERS_FILE: &str = "characters.json";
pub const SUMMARY_FILE: &str = "summary.txt";

#[derive(Serialize)]
struct GlossaryFile<'a> {
    schema: &'static str,
    version: u64,
    last_ordinal: u32,
    entries: Vec<&'a GlossaryEntry>,
}

#[derive(Serialize)]
struct CharactersFile<'a> {
    schema: &'static str,
    version: u64,
    last_ordinal: u32,
    characters: Vec<&'a CharacterProfile>,
}

pub struct StateExport {
    dir: PathBuf,
}

impl StateExport {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, snapshot: &NarrativeSnapshot) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create state dir: {}", self.dir.display()))?;

        let glossary = GlossaryFile {
            schema: "epub-bilingual.glossary.v1",
            version: snapshot.version,
            last_ordinal: snapshot.last_ordinal,
            entries: snapshot.glossary.entries().collect(),
        };
        write_json(&self.dir.join(GLOSSARY_FILE), &glossary)?;

        let characters = CharactersFile {
            schema: "epub-bilingual.characters.v1",
            version: snapshot.version,
            last_ordinal: snapshot.last_ordinal,
            characters: snapshot.characters.profiles().collect(),
        };
        write_json(&self.dir.join(CHARACTERS_FILE), &characters)?;

        let path = self.dir.join(SUMMARY_FILE);
        std::fs::write(&path, &snapshot.summary)
            .with_context(|| format!("write summary: {}", path.display()))?;
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    std::fs::write(path, json).with_context(|| format!("write state: {}", path.display()))?;
    Ok(())
}
