use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::SamlError;

// Canonical form shared by the signing and validating sides: the XML
// declaration, comments, processing instructions and doctype are dropped,
// empty elements are expanded, namespace declarations precede attributes
// with each group sorted by name, and text is re-escaped after entity
// resolution. Namespace declarations are kept where they are written
// instead of being pruned to visibly utilized ones. Digests agree because
// both sides canonicalize with this same routine.
pub(crate) fn canonicalize(xml: &str) -> Result<String, SamlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut out = String::with_capacity(xml.len());
    loop {
        match reader
            .read_event()
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?
        {
            Event::Start(e) => write_open_tag(&mut out, &e)?,
            Event::Empty(e) => {
                write_open_tag(&mut out, &e)?;
                out.push_str("</");
                out.push_str(tag_name(&e)?);
                out.push('>');
            }
            Event::End(e) => {
                let name = std::str::from_utf8(e.name().into_inner())
                    .map_err(|err| SamlError::InvalidXml(err.to_string()))?;
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|err| SamlError::InvalidXml(err.to_string()))?;
                push_escaped_text(&mut out, &text);
            }
            Event::CData(e) => {
                let text = std::str::from_utf8(&e)
                    .map_err(|err| SamlError::InvalidXml(err.to_string()))?;
                push_escaped_text(&mut out, text);
            }
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }
    Ok(out)
}

fn tag_name<'a>(element: &'a BytesStart) -> Result<&'a str, SamlError> {
    std::str::from_utf8(element.name().into_inner())
        .map_err(|err| SamlError::InvalidXml(err.to_string()))
}

fn write_open_tag(out: &mut String, element: &BytesStart) -> Result<(), SamlError> {
    out.push('<');
    out.push_str(tag_name(element)?);

    let mut namespaces: Vec<(String, String)> = Vec::new();
    let mut attributes: Vec<(String, String)> = Vec::new();
    for attr in element.attributes().flatten() {
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?
            .to_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?
            .into_owned();
        if key == "xmlns" || key.starts_with("xmlns:") {
            namespaces.push((key, value));
        } else {
            attributes.push((key, value));
        }
    }
    namespaces.sort();
    attributes.sort();

    for (key, value) in namespaces.iter().chain(attributes.iter()) {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        push_escaped_attribute(out, value);
        out.push('"');
    }
    out.push('>');
    Ok(())
}

fn push_escaped_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn push_escaped_attribute(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_prolog_and_comments_and_expands_empty_elements() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?><a><!-- note --><b x="1"/></a>"#;
        assert_eq!(canonicalize(xml).unwrap(), r#"<a><b x="1"></b></a>"#);
    }

    #[test]
    fn sorts_namespace_declarations_before_attributes() {
        let xml = r#"<e b="2" a="1" xmlns:z="urn:z" xmlns:m="urn:m">t</e>"#;
        assert_eq!(
            canonicalize(xml).unwrap(),
            r#"<e xmlns:m="urn:m" xmlns:z="urn:z" a="1" b="2">t</e>"#
        );
    }

    #[test]
    fn default_namespace_sorts_ahead_of_prefixed_ones() {
        let xml = r#"<e xmlns:a="urn:a" xmlns="urn:default"/>"#;
        assert_eq!(
            canonicalize(xml).unwrap(),
            r#"<e xmlns="urn:default" xmlns:a="urn:a"></e>"#
        );
    }

    #[test]
    fn normalizes_escaping_of_text_and_attributes() {
        let xml = "<a note=\"x &#38; y\">1 &#60; 2 &amp; 3</a>";
        assert_eq!(
            canonicalize(xml).unwrap(),
            r#"<a note="x &amp; y">1 &lt; 2 &amp; 3</a>"#
        );
    }

    #[test]
    fn preserves_whitespace_between_elements() {
        let xml = "<a>\n  <b>v</b>\n</a>";
        assert_eq!(canonicalize(xml).unwrap(), "<a>\n  <b>v</b>\n</a>");
    }

    #[test]
    fn canonical_output_is_a_fixed_point() {
        let xml = r#"<a xmlns:s="urn:s" q="1"><s:b><!-- c -->text</s:b><d/></a>"#;
        let once = canonicalize(xml).unwrap();
        assert_eq!(canonicalize(&once).unwrap(), once);
    }
}
