use std::ops::Range;

use encoding_rs::Encoding;
use tracing::debug;

use crate::epub::opf::PackageDocument;
use crate::epub::package::EpubPackage;
use crate::epub::xml::{decode_document, local_name, scan, XmlEventKind};
use crate::error::SegmentationError;
use crate::ir::{Block, BlockKind, Book, Chapter, ChapterKind};
use crate::textutil::{is_translatable_block, normalize_ws};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentOptions {
    /// Chapters with a smaller ordinal are front matter.
    pub first_narrative: u32,
    pub max_chapters: Option<usize>,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            first_narrative: 1,
            max_chapters: None,
        }
    }
}

/// Where one block lives in its source document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSite {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub start_tag: Range<usize>,
    pub end_tag: Range<usize>,
}

/// A spine document that became a chapter; `sites[i]` is block `i`.
pub struct ChapterDocument {
    pub ordinal: u32,
    pub path: String,
    pub text: String,
    pub source_encoding: &'static Encoding,
    pub sites: Vec<BlockSite>,
    pub head_end: Option<Range<usize>>,
}

pub struct SegmentedBook {
    pub book: Book,
    pub opf: PackageDocument,
    pub documents: Vec<ChapterDocument>,
}

struct OpenBlock {
    name: String,
    kind: BlockKind,
    attrs: Vec<(String, String)>,
    start_tag: Range<usize>,
    text: String,
    nested: bool,
}

/// Translatable leaf blocks of one XHTML document, in document order.
pub(crate) struct DocumentBlocks {
    pub blocks: Vec<(BlockKind, String, BlockSite)>,
    pub head_end: Option<Range<usize>>,
}

pub(crate) fn document_blocks(text: &str) -> Result<DocumentBlocks, String> {
    let events = scan(text)?;
    let mut stack: Vec<OpenBlock> = Vec::new();
    let mut blocks = Vec::new();
    let mut head_end = None;

    for ev in events {
        match ev.kind {
            XmlEventKind::Start { name, attrs } => {
                if let Some(kind) = BlockKind::from_tag(&local_name(&name)) {
                    stack.push(OpenBlock {
                        name,
                        kind,
                        attrs,
                        start_tag: ev.span,
                        text: String::new(),
                        nested: false,
                    });
                }
            }
            XmlEventKind::Empty { name, .. } => {
                if local_name(&name) == "br" {
                    if let Some(top) = stack.last_mut() {
                        top.text.push(' ');
                    }
                }
            }
            XmlEventKind::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t);
                }
            }
            XmlEventKind::End { name } => {
                let local = local_name(&name);
                if local == "head" {
                    head_end = Some(ev.span);
                    continue;
                }
                if BlockKind::from_tag(&local).is_none() {
                    continue;
                }
                let Some(open) = stack.pop() else {
                    continue;
                };
                if let Some(parent) = stack.last_mut() {
                    parent.nested = true;
                }
                if open.nested {
                    continue;
                }
                let text = normalize_ws(&open.text);
                if !is_translatable_block(&text, open.kind) {
                    continue;
                }
                blocks.push((
                    open.kind,
                    text,
                    BlockSite {
                        name: open.name,
                        attrs: open.attrs,
                        start_tag: open.start_tag,
                        end_tag: ev.span,
                    },
                ));
            }
            XmlEventKind::Other => {}
        }
    }
    Ok(DocumentBlocks { blocks, head_end })
}

/// Splits the spine into chapters: one per document holding at least one translatable block.
pub fn segment(pkg: &EpubPackage, opts: &SegmentOptions) -> Result<SegmentedBook, SegmentationError> {
    let opf = PackageDocument::load(pkg)?;
    let mut chapters = Vec::new();
    let mut documents = Vec::new();

    for item in opf.spine_documents()? {
        if opts
            .max_chapters
            .is_some_and(|max| chapters.len() >= max)
        {
            break;
        }
        let decoded = decode_document(&pkg.require(&item.path)?.data);
        let found = document_blocks(&decoded.text).map_err(|detail| SegmentationError::Document {
            name: item.path.clone(),
            detail,
        })?;
        if found.blocks.is_empty() {
            debug!(path = %item.path, "no translatable blocks; copied through");
            continue;
        }

        let ordinal = chapters.len() as u32 + 1;
        let kind = if ordinal < opts.first_narrative {
            ChapterKind::FrontMatter
        } else {
            ChapterKind::Narrative
        };
        let title = found
            .blocks
            .iter()
            .find(|(k, _, _)| k.is_heading())
            .map(|(_, t, _)| t.clone());
        let mut blocks = Vec::with_capacity(found.blocks.len());
        let mut sites = Vec::with_capacity(found.blocks.len());
        for (index, (kind, text, site)) in found.blocks.into_iter().enumerate() {
            blocks.push(Block::new(index, kind, text));
            sites.push(site);
        }
        debug!(ordinal, path = %item.path, blocks = blocks.len(), kind = kind.as_str(), "segmented chapter");
        chapters.push(Chapter {
            ordinal,
            kind,
            title,
            blocks,
        });
        documents.push(ChapterDocument {
            ordinal,
            path: item.path.clone(),
            text: decoded.text,
            source_encoding: decoded.source_encoding,
            sites,
            head_end: found.head_end,
        });
    }

    let book = Book::new(pkg.source_id(), chapters)?;
    Ok(SegmentedBook {
        book,
        opf,
        documents,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::epub::package::build_test_epub;

    pub const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#;

    pub const OPF: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <manifest>
    <item id="cover" href="cover.xhtml" media-type="application/xhtml+xml"/>
    <item id="title" href="title.xhtml" media-type="application/xhtml+xml"/>
    <item id="c1" href="text/c1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="text/c2.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine><itemref idref="cover"/><itemref idref="title"/><itemref idref="c1"/><itemref idref="c2"/></spine>
</package>"#;

    pub const COVER: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>Cover</title></head>
<body><p><img src="cover.jpg" alt=""/></p></body></html>"#;

    pub const TITLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>Title</title></head>
<body><h1>Nineteen Eighty-Four</h1><p>A novel by George Orwell</p></body></html>"#;

    pub const CH1: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>One</title></head>
<body>
<h2 id="c1">Chapter One</h2>
<p class="first">It was a bright cold day in April, and the clocks were striking thirteen.</p>
<blockquote><p>BIG BROTHER IS WATCHING YOU</p></blockquote>
<ul><li>Winston <em>Smith</em>&nbsp;stared at the telescreen.</li></ul>
<p>***</p>
</body></html>"#;

    pub const CH2: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>Two</title></head>
<body><p>The telescreen received and transmitted simultaneously.</p></body></html>"#;

    pub fn sample_epub() -> Vec<u8> {
        build_test_epub(&[
            ("META-INF/container.xml", CONTAINER),
            ("OEBPS/content.opf", OPF),
            ("OEBPS/cover.xhtml", COVER),
            ("OEBPS/title.xhtml", TITLE),
            ("OEBPS/text/c1.xhtml", CH1),
            ("OEBPS/text/c2.xhtml", CH2),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::sample_epub;
    use super::{document_blocks, segment, SegmentOptions};
    use crate::epub::package::EpubPackage;
    use crate::ir::{BlockKind, ChapterKind};

    #[test]
    fn segments_leaf_blocks_in_spine_order() {
        let pkg = EpubPackage::from_bytes(&sample_epub()).expect("pkg");
        let seg = segment(
            &pkg,
            &SegmentOptions {
                first_narrative: 2,
                max_chapters: None,
            },
        )
        .expect("segment");

        let book = &seg.book;
        assert_eq!(book.len(), 3, "cover has no translatable block");
        let title = book.chapter(1).expect("title page");
        assert_eq!(title.kind, ChapterKind::FrontMatter);
        assert_eq!(title.title.as_deref(), Some("Nineteen Eighty-Four"));

        let one = book.chapter(2).expect("chapter one");
        assert_eq!(one.kind, ChapterKind::Narrative);
        let kinds: Vec<BlockKind> = one.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BlockKind::Heading(2),
                BlockKind::Paragraph,
                BlockKind::Paragraph,
                BlockKind::ListItem
            ]
        );
        assert_eq!(one.blocks[2].source, "BIG BROTHER IS WATCHING YOU");
        assert_eq!(one.blocks[3].source, "Winston Smith stared at the telescreen.");
        assert_eq!(seg.documents[1].path, "OEBPS/text/c1.xhtml");
        assert_eq!(seg.documents[1].sites.len(), 4);
    }

    #[test]
    fn segmentation_is_deterministic_and_limited() {
        let bytes = sample_epub();
        let pkg = EpubPackage::from_bytes(&bytes).expect("pkg");
        let a = segment(&pkg, &SegmentOptions::default()).expect("a");
        let b = segment(&pkg, &SegmentOptions::default()).expect("b");
        assert_eq!(a.book, b.book);

        let limited = segment(
            &pkg,
            &SegmentOptions {
                first_narrative: 1,
                max_chapters: Some(2),
            },
        )
        .expect("limited");
        assert_eq!(limited.book.len(), 2);
    }

    #[test]
    fn blockquote_with_paragraph_is_not_a_leaf() {
        let found = document_blocks(
            "<html><head></head><body><blockquote>Intro text here<p>Nested paragraph text.</p></blockquote></body></html>",
        )
        .expect("blocks");
        assert_eq!(found.blocks.len(), 1);
        assert_eq!(found.blocks[0].0, BlockKind::Paragraph);
        assert!(found.head_end.is_some());
    }

    #[test]
    fn malformed_document_is_a_segmentation_error() {
        let bytes = crate::epub::package::build_test_epub(&[
            ("META-INF/container.xml", super::fixtures::CONTAINER),
            ("OEBPS/content.opf", super::fixtures::OPF),
            ("OEBPS/cover.xhtml", "<html><body><p>broken</div></body></html>"),
        ]);
        let pkg = EpubPackage::from_bytes(&bytes).expect("pkg");
        assert!(segment(&pkg, &SegmentOptions::default()).is_err());
    }
}
