//! Position-preserving scan of XHTML documents.
//!
//! Documents are never re-serialized: every event keeps the byte span of its
//! source text so the assembler can splice new markup into the original string.

use std::ops::Range;

use encoding_rs::{Encoding, UTF_8};
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

static DECL_ENCODING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*<\?xml[^>]*?encoding\s*=\s*["']([A-Za-z0-9._:-]+)["']"#)
        .expect("decl encoding regex")
});

/// A document decoded to UTF-8, remembering whether its declaration must be rewritten.
pub struct DecodedDocument {
    pub text: String,
    pub source_encoding: &'static Encoding,
}

pub fn decode_document(bytes: &[u8]) -> DecodedDocument {
    if let Some((enc, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = enc.decode_without_bom_handling(&bytes[bom_len..]);
        return DecodedDocument {
            text: text.into_owned(),
            source_encoding: enc,
        };
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]);
    let declared = DECL_ENCODING_RE
        .captures(&head)
        .and_then(|c| c.get(1))
        .and_then(|m| Encoding::for_label(m.as_str().as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _) = declared.decode_without_bom_handling(bytes);
    DecodedDocument {
        text: text.into_owned(),
        source_encoding: declared,
    }
}

/// UTF-8 bytes of an edited document; a legacy encoding declaration is rewritten to utf-8.
pub fn encode_document(text: &str, source_encoding: &'static Encoding) -> Vec<u8> {
    if source_encoding == UTF_8 {
        return text.as_bytes().to_vec();
    }
    let Some(m) = DECL_ENCODING_RE.captures(text).and_then(|c| c.get(1)) else {
        return text.as_bytes().to_vec();
    };
    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..m.start()]);
    out.push_str("utf-8");
    out.push_str(&text[m.end()..]);
    out.into_bytes()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XmlEventKind {
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    Empty {
        name: String,
        attrs: Vec<(String, String)>,
    },
    /// Entity-decoded character data (text or CDATA).
    Text(String),
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmlEvent {
    pub kind: XmlEventKind,
    pub span: Range<usize>,
}

/// Lowercased element name without namespace prefix.
#[must_use]
pub fn local_name(name: &str) -> String {
    name.rsplit(':').next().unwrap_or(name).to_ascii_lowercase()
}

/// Raw (still escaped) attribute value by local name.
#[must_use]
pub fn attr<'a>(attrs: &'a [(String, String)], local: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| local_name(k) == local)
        .map(|(_, v)| v.as_str())
}

/// Decoded attribute value by local name.
#[must_use]
pub fn attr_text(attrs: &[(String, String)], local: &str) -> Option<String> {
    attr(attrs, local).map(|v| html_escape::decode_html_entities(v).into_owned())
}

pub fn scan(text: &str) -> Result<Vec<XmlEvent>, String> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = true;

    let mut events = Vec::new();
    loop {
        let start = reader.buffer_position() as usize;
        let ev = reader
            .read_event()
            .map_err(|e| format!("at byte {}: {e}", reader.error_position()))?;
        let end = reader.buffer_position() as usize;
        let kind = match ev {
            Event::Eof => break,
            Event::Start(s) => XmlEventKind::Start {
                name: bytes_to_string(s.name().as_ref()),
                attrs: collect_attrs(&s)?,
            },
            Event::End(e) => XmlEventKind::End {
                name: bytes_to_string(e.name().as_ref()),
            },
            Event::Empty(s) => XmlEventKind::Empty {
                name: bytes_to_string(s.name().as_ref()),
                attrs: collect_attrs(&s)?,
            },
            Event::Text(t) => {
                let raw = bytes_to_string(t.into_inner());
                XmlEventKind::Text(html_escape::decode_html_entities(&raw).into_owned())
            }
            Event::CData(t) => XmlEventKind::Text(bytes_to_string(t.into_inner())),
            _ => XmlEventKind::Other,
        };
        events.push(XmlEvent {
            kind,
            span: start..end,
        });
    }
    Ok(events)
}

fn collect_attrs(s: &BytesStart<'_>) -> Result<Vec<(String, String)>, String> {
    let mut attrs = Vec::new();
    for a in s.attributes() {
        let a = a.map_err(|e| format!("attribute: {e}"))?;
        // Raw value: written back as found.
        attrs.push((
            bytes_to_string(a.key.as_ref()),
            bytes_to_string(a.value.as_ref()),
        ));
    }
    Ok(attrs)
}

fn bytes_to_string(bytes: impl AsRef<[u8]>) -> String {
    String::from_utf8_lossy(bytes.as_ref()).into_owned()
}

/// Renders a start tag from a name and raw attribute values.
#[must_use]
pub fn render_start_tag(name: &str, attrs: &[(String, String)], empty: bool) -> String {
    let mut out = String::from("<");
    out.push_str(name);
    for (k, v) in attrs {
        let quote = if v.contains('"') { '\'' } else { '"' };
        out.push(' ');
        out.push_str(k);
        out.push('=');
        out.push(quote);
        out.push_str(v);
        out.push(quote);
    }
    out.push_str(if empty { "/>" } else { ">" });
    out
}

/// Applies non-overlapping `(range, replacement)` edits to `text`.
pub fn splice(text: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by(|a, b| a.0.start.cmp(&b.0.start).then(a.0.end.cmp(&b.0.end)));
    let mut out = String::with_capacity(text.len() + edits.iter().map(|e| e.1.len()).sum::<usize>());
    let mut cursor = 0usize;
    for (range, replacement) in edits {
        if range.start < cursor {
            continue;
        }
        out.push_str(&text[cursor..range.start]);
        out.push_str(&replacement);
        cursor = range.end;
    }
    out.push_str(&text[cursor..]);
    out
}
