//! Element and attribute extraction for archive XML payloads.
//!
//! Archive documents are shallow and regular: the elements we read never
//! nest inside an element of the same name. That lets a handful of regular
//! expressions stand in for a full XML parser.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static ATTRIBUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("attribute pattern is valid")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern is valid"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub attributes: BTreeMap<String, String>,
    /// Raw inner markup; empty for self-closing elements.
    pub body: String,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Text of the first child element called `tag`.
    pub fn child_text(&self, tag: &str) -> Option<String> {
        child_text(&self.body, tag)
    }

    /// Body with nested tags stripped and entities decoded.
    pub fn text(&self) -> String {
        unescape(TAG_RE.replace_all(&self.body, "").trim())
    }

    pub fn children(&self, tag: &str) -> Vec<Element> {
        elements(&self.body, tag)
    }
}

/// Every element named `tag` anywhere in `doc`, in document order.
pub fn elements(doc: &str, tag: &str) -> Vec<Element> {
    let pattern = format!(
        r"(?s)<{tag}\b([^>]*?)(?:/>|>(.*?)</{tag}\s*>)",
        tag = regex::escape(tag)
    );
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.captures_iter(doc)
        .map(|cap| Element {
            attributes: parse_attributes(cap.get(1).map(|m| m.as_str()).unwrap_or_default()),
            body: cap
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        })
        .collect()
}

pub fn first(doc: &str, tag: &str) -> Option<Element> {
    elements(doc, tag).into_iter().next()
}

pub fn child_text(doc: &str, tag: &str) -> Option<String> {
    first(doc, tag)
        .map(|element| element.text())
        .filter(|text| !text.is_empty())
}

fn parse_attributes(raw: &str) -> BTreeMap<String, String> {
    ATTRIBUTE_RE
        .captures_iter(raw)
        .filter_map(|cap| {
            let name = cap.get(1)?.as_str().to_string();
            let value = cap.get(2).or_else(|| cap.get(3))?.as_str();
            Some((name, unescape(value)))
        })
        .collect()
}

pub fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0"?>
<SAMPLE_SET>
  <SAMPLE accession="ERS001" center_name='UCL'>
    <TITLE>plasma &amp; serum</TITLE>
    <SAMPLE_ATTRIBUTES>
      <SAMPLE_ATTRIBUTE><TAG>tissue</TAG><VALUE>blood</VALUE></SAMPLE_ATTRIBUTE>
    </SAMPLE_ATTRIBUTES>
  </SAMPLE>
  <SAMPLE accession="ERS002"/>
</SAMPLE_SET>"#;

    #[test]
    fn finds_elements_without_matching_prefixed_tags() {
        let samples = elements(DOC, "SAMPLE");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].attr("accession"), Some("ERS001"));
        assert_eq!(samples[0].attr("center_name"), Some("UCL"));
        assert_eq!(samples[1].attr("accession"), Some("ERS002"));
        assert!(samples[1].body.is_empty());
    }

    #[test]
    fn reads_child_text_and_decodes_entities() {
        let sample = first(DOC, "SAMPLE").unwrap();
        assert_eq!(sample.child_text("TITLE").as_deref(), Some("plasma & serum"));
        let attrs = sample.children("SAMPLE_ATTRIBUTE");
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].child_text("TAG").as_deref(), Some("tissue"));
        assert_eq!(attrs[0].child_text("VALUE").as_deref(), Some("blood"));
    }

    #[test]
    fn text_strips_nested_tags() {
        let element = first("<Platform instrument_model=\"X\"><b>ILLUMINA</b></Platform>", "Platform")
            .unwrap();
        assert_eq!(element.text(), "ILLUMINA");
        assert_eq!(element.attr("instrument_model"), Some("X"));
    }

    #[test]
    fn empty_attribute_reads_as_missing() {
        let element = first(r#"<Sample acc="SRS1" name=""/>"#, "Sample").unwrap();
        assert_eq!(element.attr("name"), None);
    }
}
