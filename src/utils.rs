use base64::{prelude::BASE64_STANDARD, Engine};
use quick_xml::events::BytesStart;
use rand::distributions::{Alphanumeric, DistString};

use crate::SamlError;

pub(crate) fn random_string(length: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), length)
}

// Lenient decoding for base64 arriving inside XML documents or form posts,
// which is often wrapped or indented.
pub(crate) fn decode_xml_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

pub(crate) fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub(crate) fn attr_value(element: &BytesStart, name: &[u8]) -> Result<Option<String>, SamlError> {
    for attr in element.attributes().flatten() {
        if attr.key.as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|err| SamlError::InvalidXml(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}
