use std::ops::Range;

use crate::epub::package::EpubPackage;
use crate::epub::xml::{attr_text, decode_document, local_name, scan, XmlEventKind};
use crate::error::SegmentationError;

pub const CONTAINER_PATH: &str = "META-INF/container.xml";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestItem {
    pub id: String,
    /// Zip entry name, resolved against the OPF directory.
    pub path: String,
    pub media_type: String,
}

#[derive(Clone, Debug)]
pub struct PackageDocument {
    pub path: String,
    pub text: String,
    pub manifest: Vec<ManifestItem>,
    /// Manifest ids in reading order.
    pub spine: Vec<String>,
    /// Span of the `</manifest>` end tag inside `text`.
    pub manifest_end: Range<usize>,
}

impl PackageDocument {
    pub fn load(pkg: &EpubPackage) -> Result<Self, SegmentationError> {
        let path = rootfile_path(pkg)?;
        let doc = decode_document(&pkg.require(&path)?.data);
        let events = scan(&doc.text).map_err(|detail| SegmentationError::Document {
            name: path.clone(),
            detail,
        })?;

        let base = parent_dir(&path);
        let mut manifest = Vec::new();
        let mut spine = Vec::new();
        let mut manifest_end = None;
        for ev in &events {
            match &ev.kind {
                XmlEventKind::Start { name, attrs } | XmlEventKind::Empty { name, attrs } => {
                    match local_name(name).as_str() {
                        "item" => {
                            let (Some(id), Some(href)) =
                                (attr_text(attrs, "id"), attr_text(attrs, "href"))
                            else {
                                continue;
                            };
                            manifest.push(ManifestItem {
                                id,
                                path: resolve_href(base, &href),
                                media_type: attr_text(attrs, "media-type").unwrap_or_default(),
                            });
                        }
                        "itemref" => {
                            if let Some(idref) = attr_text(attrs, "idref") {
                                spine.push(idref);
                            }
                        }
                        _ => {}
                    }
                }
                XmlEventKind::End { name } if local_name(name) == "manifest" => {
                    manifest_end = Some(ev.span.clone());
                }
                _ => {}
            }
        }

        let manifest_end = manifest_end.ok_or_else(|| SegmentationError::Document {
            name: path.clone(),
            detail: "no <manifest> element".to_string(),
        })?;
        if spine.is_empty() {
            return Err(SegmentationError::Document {
                name: path,
                detail: "empty spine".to_string(),
            });
        }
        Ok(Self {
            path,
            text: doc.text,
            manifest,
            spine,
            manifest_end,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &str {
        parent_dir(&self.path)
    }

    #[must_use]
    pub fn item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|m| m.id == id)
    }

    /// Spine XHTML documents in reading order.
    pub fn spine_documents(&self) -> Result<Vec<&ManifestItem>, SegmentationError> {
        let mut docs = Vec::with_capacity(self.spine.len());
        for idref in &self.spine {
            let item = self.item(idref).ok_or_else(|| SegmentationError::Document {
                name: self.path.clone(),
                detail: format!("spine references unknown item {idref}"),
            })?;
            if is_xhtml(&item.media_type, &item.path) {
                docs.push(item);
            }
        }
        Ok(docs)
    }
}

fn is_xhtml(media_type: &str, path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    media_type == "application/xhtml+xml"
        || media_type == "text/html"
        || lowered.ends_with(".xhtml")
        || lowered.ends_with(".html")
        || lowered.ends_with(".htm")
}

fn rootfile_path(pkg: &EpubPackage) -> Result<String, SegmentationError> {
    let doc = decode_document(&pkg.require(CONTAINER_PATH)?.data);
    let events = scan(&doc.text).map_err(|detail| SegmentationError::Document {
        name: CONTAINER_PATH.to_string(),
        detail,
    })?;
    events
        .iter()
        .find_map(|ev| match &ev.kind {
            XmlEventKind::Start { name, attrs } | XmlEventKind::Empty { name, attrs }
                if local_name(name) == "rootfile" =>
            {
                attr_text(attrs, "full-path")
            }
            _ => None,
        })
        .ok_or_else(|| SegmentationError::Document {
            name: CONTAINER_PATH.to_string(),
            detail: "no rootfile full-path".to_string(),
        })
}

/// Directory part of a zip path, without trailing slash; `""` at the root.
#[must_use]
pub fn parent_dir(path: &str) -> &str {
    path.rfind('/').map_or("", |i| &path[..i])
}

/// Resolves `href` (relative, possibly with `..` and `%20`) against `base`.
#[must_use]
pub fn resolve_href(base: &str, href: &str) -> String {
    let href = href.split(['#', '?']).next().unwrap_or(href);
    let href = percent_decode(href);
    let mut parts: Vec<&str> = if href.starts_with('/') {
        Vec::new()
    } else {
        base.split('/').filter(|s| !s.is_empty()).collect()
    };
    for seg in href.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Relative href from the directory `from_dir` to the zip path `to`.
#[must_use]
pub fn relative_href(from_dir: &str, to: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();
    let common = from
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count();
    let mut out: Vec<&str> = vec![".."; from.len() - common];
    out.extend(&to_parts[common..]);
    out.join("/")
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::{relative_href, resolve_href, PackageDocument};
    use crate::epub::package::{build_test_epub, EpubPackage};

    const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#;

    const OPF: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <manifest>
    <item id="c1" href="text/ch%201.xhtml" media-type="application/xhtml+xml"/>
    <item id="img" href="../images/cover.jpg" media-type="image/jpeg"/>
    <item id="css" href="style.css" media-type="text/css"/>
  </manifest>
  <spine><itemref idref="c1"/><itemref idref="img"/></spine>
</package>"#;

    #[test]
    fn reads_manifest_and_spine() {
        let bytes = build_test_epub(&[
            ("META-INF/container.xml", CONTAINER),
            ("OEBPS/content.opf", OPF),
        ]);
        let pkg = EpubPackage::from_bytes(&bytes).expect("pkg");
        let opf = PackageDocument::load(&pkg).expect("opf");
        assert_eq!(opf.dir(), "OEBPS");
        assert_eq!(opf.item("img").expect("img").path, "images/cover.jpg");
        let docs = opf.spine_documents().expect("spine");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "OEBPS/text/ch 1.xhtml");
        assert_eq!(&opf.text[opf.manifest_end.clone()], "</manifest>");
    }

    #[test]
    fn missing_container_is_reported() {
        let bytes = build_test_epub(&[("OEBPS/content.opf", OPF)]);
        let pkg = EpubPackage::from_bytes(&bytes).expect("pkg");
        assert!(PackageDocument::load(&pkg).is_err());
    }

    #[test]
    fn paths() {
        assert_eq!(resolve_href("OEBPS/text", "../styles/a.css#x"), "OEBPS/styles/a.css");
        assert_eq!(relative_href("OEBPS/text", "OEBPS/styles/bilingual.css"), "../styles/bilingual.css");
        assert_eq!(relative_href("", "styles/bilingual.css"), "styles/bilingual.css");
    }
}
