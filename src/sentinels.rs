use anyhow::{anyhow, Context};
use once_cell::sync::Lazy;
use regex::Regex;

pub const BLOCK_ID_WIDTH: usize = 4;

pub fn block_start(id: usize) -> String {
    format!("<<BLOCK:{id:0BLOCK_ID_WIDTH$}>>")
}

pub fn block_end(id: usize) -> String {
    format!("<<END:{id:0BLOCK_ID_WIDTH$}>>")
}

// Anything shaped like our markers; used to detect markers leaking into block text.
pub static ANY_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<<(?:BLOCK|END):\d{1,8}>>").expect("marker regex"));

/// Wraps each text in numbered markers, one block per marker pair.
pub fn wrap_blocks<'a>(items: impl IntoIterator<Item = (usize, &'a str)>) -> String {
    let mut out = String::new();
    for (id, text) in items {
        out.push_str(&block_start(id));
        out.push('\n');
        out.push_str(text);
        out.push('\n');
        out.push_str(&block_end(id));
        out.push('\n');
    }
    out
}

/// Extracts the text between each expected marker pair, in order.
pub fn parse_segmented_output(text: &str, expected_ids: &[usize]) -> anyhow::Result<Vec<String>> {
    let mut segments = Vec::with_capacity(expected_ids.len());
    let mut cursor = 0usize;
    for &id in expected_ids {
        let start_marker = block_start(id);
        let end_marker = block_end(id);

        let start_idx = text[cursor..]
            .find(&start_marker)
            .map(|i| cursor + i)
            .with_context(|| format!("missing block start for id={id}"))?;
        let start_end = start_idx + start_marker.len();

        let end_idx = text[start_end..]
            .find(&end_marker)
            .map(|i| start_end + i)
            .with_context(|| format!("missing block end for id={id}"))?;

        let body = text[start_end..end_idx].trim();
        if ANY_MARKER_RE.is_match(body) {
            return Err(anyhow!("nested marker inside block id={id}"));
        }
        segments.push(body.to_string());
        cursor = end_idx + end_marker.len();
    }
    Ok(segments)
}

/// Like [`parse_segmented_output`] but tolerates missing blocks, returning `None` for them.
pub fn parse_segmented_output_lenient(text: &str, expected_ids: &[usize]) -> Vec<Option<String>> {
    expected_ids
        .iter()
        .map(|&id| {
            let start_marker = block_start(id);
            let end_marker = block_end(id);
            let start = text.find(&start_marker)? + start_marker.len();
            let end = text[start..].find(&end_marker)? + start;
            let body = text[start..end].trim();
            if body.is_empty() || ANY_MARKER_RE.is_match(body) {
                None
            } else {
                Some(body.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{parse_segmented_output, parse_segmented_output_lenient, wrap_blocks};

    #[test]
    fn parses_in_order() {
        let text = format!("noise\n{}", wrap_blocks([(1, "một"), (2, "hai")]));
        let out = parse_segmented_output(&text, &[1, 2]).expect("parse");
        assert_eq!(out, vec!["một".to_string(), "hai".to_string()]);
    }

    #[test]
    fn missing_block_is_an_error() {
        let text = wrap_blocks([(1, "một")]);
        let err = parse_segmented_output(&text, &[1, 2]).expect_err("missing");
        assert!(err.to_string().contains("id=2"));
        let lenient = parse_segmented_output_lenient(&text, &[1, 2]);
        assert_eq!(lenient, vec![Some("một".to_string()), None]);
    }
}
