use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

use anyhow::Context;
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::SegmentationError;

/// Every zip entry of an EPUB, in archive order, with the metadata needed to copy it unchanged.
pub struct EpubPackage {
    pub entries: Vec<EpubEntry>,
    source_id: String,
}

pub struct EpubEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub compression: CompressionMethod,
    pub last_modified: zip::DateTime,
    pub unix_mode: Option<u32>,
    pub is_dir: bool,
}

/// An entry that does not exist in the source package.
pub struct NewEntry {
    pub name: String,
    pub data: Vec<u8>,
}

impl EpubPackage {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let mut f = File::open(path).with_context(|| format!("open epub: {}", path.display()))?;
        let mut bytes = Vec::new();
        f.read_to_end(&mut bytes)
            .with_context(|| format!("read epub: {}", path.display()))?;
        Ok(Self::from_bytes(&bytes)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SegmentationError> {
        let mut zip = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| SegmentationError::Package(format!("read zip: {e}")))?;
        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut file = zip
                .by_index(i)
                .map_err(|e| SegmentationError::Package(format!("zip entry {i}: {e}")))?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data).map_err(|e| {
                SegmentationError::Package(format!("read zip entry {}: {e}", file.name()))
            })?;
            entries.push(EpubEntry {
                name: file.name().to_string(),
                data,
                compression: file.compression(),
                last_modified: file.last_modified().unwrap_or_default(),
                unix_mode: file.unix_mode(),
                is_dir: file.is_dir(),
            });
        }
        Ok(Self {
            entries,
            source_id: hex::encode(Sha256::digest(bytes)),
        })
    }

    /// SHA-256 of the package bytes; identifies the book in checkpoints.
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&EpubEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&EpubEntry, SegmentationError> {
        self.entry(name)
            .ok_or_else(|| SegmentationError::MissingEntry(name.to_string()))
    }

    /// Rewrites the archive in source order: replaced entries keep their zip metadata,
    /// added entries follow at the end stamped with the `stamp_like` entry's time.
    pub fn write_to<W: Write + Seek>(
        &self,
        out: W,
        replacements: &HashMap<String, Vec<u8>>,
        additions: &[NewEntry],
        stamp_like: &str,
    ) -> anyhow::Result<W> {
        let mut zout = ZipWriter::new(out);
        for ent in &self.entries {
            let data = replacements.get(&ent.name).unwrap_or(&ent.data);
            let mut opts = SimpleFileOptions::default()
                .compression_method(ent.compression)
                .last_modified_time(ent.last_modified);
            if let Some(mode) = ent.unix_mode {
                opts = opts.unix_permissions(mode);
            }
            if ent.is_dir || ent.name.ends_with('/') {
                zout.add_directory(&ent.name, opts)
                    .with_context(|| format!("add zip dir: {}", ent.name))?;
            } else {
                zout.start_file(&ent.name, opts)
                    .with_context(|| format!("start zip file: {}", ent.name))?;
                zout.write_all(data)
                    .with_context(|| format!("write zip file: {}", ent.name))?;
            }
        }

        let stamp = self
            .entry(stamp_like)
            .map(|e| e.last_modified)
            .unwrap_or_default();
        for add in additions {
            if self.entry(&add.name).is_some() {
                continue;
            }
            let opts = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .last_modified_time(stamp);
            zout.start_file(&add.name, opts)
                .with_context(|| format!("start zip file: {}", add.name))?;
            zout.write_all(&add.data)
                .with_context(|| format!("write zip file: {}", add.name))?;
        }
        zout.finish().context("finish zip")
    }

    pub fn write_file(
        &self,
        output_path: &Path,
        replacements: &HashMap<String, Vec<u8>>,
        additions: &[NewEntry],
        stamp_like: &str,
    ) -> anyhow::Result<()> {
        let f = File::create(output_path)
            .with_context(|| format!("create output epub: {}", output_path.display()))?;
        self.write_to(f, replacements, additions, stamp_like)?;
        Ok(())
    }
}

/// Builds small in-memory EPUBs for tests.
#[cfg(test)]
pub(crate) fn build_test_epub(files: &[(&str, &str)]) -> Vec<u8> {
    let mut zout = ZipWriter::new(Cursor::new(Vec::new()));
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    zout.start_file("mimetype", stored).expect("mimetype");
    zout.write_all(b"application/epub+zip").expect("write");
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, body) in files {
        zout.start_file(*name, deflated).expect("start");
        zout.write_all(body.as_bytes()).expect("write");
    }
    zout.finish().expect("finish").into_inner()
}
