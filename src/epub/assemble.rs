use std::collections::HashMap;
use std::io::{Cursor, Seek, Write};
use std::path::Path;

use anyhow::{anyhow, Context};
use tracing::info;

use crate::epub::opf::{parent_dir, relative_href};
use crate::epub::package::{EpubPackage, NewEntry};
use crate::epub::segment::{BlockSite, ChapterDocument, SegmentedBook};
use crate::epub::xml::{encode_document, render_start_tag, splice};
use crate::pipeline::book::CommittedBook;

pub const SOURCE_CLASS: &str = "bi-en";
pub const TARGET_CLASS: &str = "bi-vi";
pub const STYLESHEET_NAME: &str = "styles/bilingual.css";
const STYLESHEET_ID: &str = "bilingual-css";

pub const BILINGUAL_CSS: &str = ".bi-en {\n  margin-bottom: 0.2em;\n}\n\
.bi-vi {\n  margin-top: 0;\n  margin-bottom: 1em;\n  color: #1f3a5f;\n}\n";

/// Writes the bilingual EPUB: chapter documents and the OPF are rewritten, everything else is copied.
pub fn assemble_to<W: Write + Seek>(
    pkg: &EpubPackage,
    seg: &SegmentedBook,
    committed: &CommittedBook,
    out: W,
) -> anyhow::Result<W> {
    if committed.source_id != seg.book.source_id {
        return Err(anyhow!(
            "committed book {} does not belong to source {}",
            committed.source_id,
            seg.book.source_id
        ));
    }

    let css_path = join_path(seg.opf.dir(), STYLESHEET_NAME);
    let mut replacements: HashMap<String, Vec<u8>> = HashMap::new();
    for doc in &seg.documents {
        let chapter = committed
            .chapter(doc.ordinal)
            .ok_or_else(|| anyhow!("chapter {} is not committed", doc.ordinal))?;
        let targets: Vec<&str> = chapter
            .blocks
            .iter()
            .map(|b| {
                b.target.as_deref().ok_or_else(|| {
                    anyhow!("chapter {} block {} has no target text", doc.ordinal, b.index)
                })
            })
            .collect::<anyhow::Result<_>>()?;
        let text = bilingual_document(doc, &targets, &css_path)
            .with_context(|| format!("assemble {}", doc.path))?;
        replacements.insert(doc.path.clone(), encode_document(&text, doc.source_encoding));
    }

    replacements.insert(seg.opf.path.clone(), manifest_with_stylesheet(seg, &css_path).into_bytes());
    let additions = [NewEntry {
        name: css_path,
        data: BILINGUAL_CSS.as_bytes().to_vec(),
    }];
    pkg.write_to(out, &replacements, &additions, &seg.opf.path)
}

pub fn assemble_bytes(
    pkg: &EpubPackage,
    seg: &SegmentedBook,
    committed: &CommittedBook,
) -> anyhow::Result<Vec<u8>> {
    Ok(assemble_to(pkg, seg, committed, Cursor::new(Vec::new()))?.into_inner())
}

pub fn assemble_file(
    pkg: &EpubPackage,
    seg: &SegmentedBook,
    committed: &CommittedBook,
    output: &Path,
) -> anyhow::Result<()> {
    let bytes = assemble_bytes(pkg, seg, committed)?;
    std::fs::write(output, bytes)
        .with_context(|| format!("write output epub: {}", output.display()))?;
    info!(path = %output.display(), chapters = seg.documents.len(), "wrote bilingual epub");
    Ok(())
}

fn bilingual_document(doc: &ChapterDocument, targets: &[&str], css_path: &str) -> anyhow::Result<String> {
    if targets.len() != doc.sites.len() {
        return Err(anyhow!(
            "{} committed blocks for {} source blocks",
            targets.len(),
            doc.sites.len()
        ));
    }
    let mut edits = Vec::with_capacity(doc.sites.len() * 2 + 1);
    for (site, target) in doc.sites.iter().zip(targets) {
        edits.push((site.start_tag.clone(), source_start_tag(site)));
        let end = site.end_tag.end;
        edits.push((end..end, target_element(site, target)));
    }
    if let Some(head_end) = doc.head_end.as_ref() {
        let href = relative_href(parent_dir(&doc.path), css_path);
        let link = format!("<link rel=\"stylesheet\" type=\"text/css\" href=\"{href}\"/>");
        edits.push((head_end.start..head_end.start, link));
    }
    Ok(splice(&doc.text, edits))
}

fn source_start_tag(site: &BlockSite) -> String {
    let mut attrs = site.attrs.clone();
    match attrs.iter_mut().find(|(k, _)| k == "class") {
        Some((_, v)) => {
            if !v.split_whitespace().any(|c| c == SOURCE_CLASS) {
                v.push(' ');
                v.push_str(SOURCE_CLASS);
            }
        }
        None => attrs.push(("class".to_string(), SOURCE_CLASS.to_string())),
    }
    render_start_tag(&site.name, &attrs, false)
}

fn target_element(site: &BlockSite, target: &str) -> String {
    let attrs = [
        ("class".to_string(), TARGET_CLASS.to_string()),
        ("xml:lang".to_string(), "vi".to_string()),
    ];
    format!(
        "{}{}</{}>",
        render_start_tag(&site.name, &attrs, false),
        html_escape::encode_text(target),
        site.name
    )
}

fn manifest_with_stylesheet(seg: &SegmentedBook, css_path: &str) -> String {
    let opf = &seg.opf;
    if opf.manifest.iter().any(|m| m.path == css_path) {
        return opf.text.clone();
    }
    let mut id = STYLESHEET_ID.to_string();
    let mut n = 1;
    while opf.item(&id).is_some() {
        n += 1;
        id = format!("{STYLESHEET_ID}-{n}");
    }
    let item = format!("<item id=\"{id}\" href=\"{STYLESHEET_NAME}\" media-type=\"text/css\"/>\n");
    let at = opf.manifest_end.start;
    splice(&opf.text, vec![(at..at, item)])
}

fn join_path(dir: &str, rel: &str) -> String {
    if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{dir}/{rel}")
    }
}
