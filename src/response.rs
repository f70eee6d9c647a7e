use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use time::{format_description::well_known::Iso8601, OffsetDateTime};

use crate::utils::{attr_value, decode_xml_base64};
use crate::validation::{validate_assertion_xml, ValidationContext};
use crate::SamlError;

pub fn decode_response(input: &str) -> Result<Vec<u8>, SamlError> {
    decode_xml_base64(input).map_err(SamlError::InvalidBase64)
}

// Issuer directly under the Response element, not the assertion's copy.
pub fn extract_response_issuer(input: &[u8]) -> Result<String, SamlError> {
    let xml = std::str::from_utf8(input).map_err(|err| SamlError::InvalidXml(err.to_string()))?;
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    loop {
        let event = reader
            .read_event()
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?;
        match &event {
            Event::Start(e) => path.push(local_name_string(e)?),
            Event::End(_) => {
                path.pop();
            }
            Event::Text(e) if path_is(&path, &["Response", "Issuer"]) => {
                return Ok(e
                    .unescape()
                    .map_err(|err| SamlError::InvalidXml(err.to_string()))?
                    .into_owned());
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(SamlError::MissingIssuer)
}

pub fn extract_response_subject(input: &[u8], name_format: &str) -> Result<String, SamlError> {
    let xml = std::str::from_utf8(input).map_err(|err| SamlError::InvalidXml(err.to_string()))?;
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut in_name_id = false;
    loop {
        let event = reader
            .read_event()
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?;
        match &event {
            Event::Start(e) => {
                path.push(local_name_string(e)?);
                if path_is(&path, &["Response", "Assertion", "Subject", "NameID"]) {
                    in_name_id = attr_value(e, b"Format")?.as_deref() == Some(name_format);
                }
            }
            Event::End(_) => {
                path.pop();
                in_name_id = false;
            }
            Event::Text(e) if in_name_id => {
                return Ok(e
                    .unescape()
                    .map_err(|err| SamlError::InvalidXml(err.to_string()))?
                    .into_owned());
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(SamlError::SubjectNotFound)
}

// Signature first, then the validity window and audience, then the subject
// is handed back. Permissive contexts log failures and serve the subject
// anyway.
pub fn validate_response(
    input: &[u8],
    ctx: &ValidationContext,
    name_format: &str,
    now: OffsetDateTime,
    audience: &str,
) -> Result<String, SamlError> {
    let xml = std::str::from_utf8(input).map_err(|err| SamlError::InvalidXml(err.to_string()))?;

    let outcome =
        validate_assertion_xml(xml, ctx).and_then(|()| check_conditions(xml, now, audience));
    if let Err(err) = outcome {
        // Permissive mode forgives signature and condition failures, not
        // structural ones: a document with no assertion or no signature has
        // nothing to be lenient about, and letting it fall through would
        // resurface as a less diagnostic extraction error.
        let structural = matches!(
            err,
            SamlError::InvalidXml(_) | SamlError::AssertionNotFound | SamlError::SignatureNotFound
        );
        if ctx.is_permissive() && !structural {
            tracing::warn!("serving a response that failed validation: {:?}", err);
        } else {
            return Err(err);
        }
    }

    extract_response_subject(input, name_format)
}

fn check_conditions(xml: &str, now: OffsetDateTime, audience: &str) -> Result<(), SamlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut not_before = None;
    let mut not_on_or_after = None;
    let mut expected_audience: Option<String> = None;
    let mut in_conditions = false;
    let mut in_audience = false;
    loop {
        let event = reader
            .read_event()
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?;
        match &event {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"Conditions" => {
                    not_before = attr_value(e, b"NotBefore")?;
                    not_on_or_after = attr_value(e, b"NotOnOrAfter")?;
                    in_conditions = matches!(&event, Event::Start(_));
                }
                b"Audience" if in_conditions => in_audience = matches!(&event, Event::Start(_)),
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"Conditions" => in_conditions = false,
                b"Audience" => in_audience = false,
                _ => {}
            },
            Event::Text(e) if in_audience => {
                expected_audience = Some(
                    e.unescape()
                        .map_err(|err| SamlError::InvalidXml(err.to_string()))?
                        .into_owned(),
                );
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(not_before) = not_before {
        let not_before = OffsetDateTime::parse(&not_before, &Iso8601::DEFAULT)
            .map_err(|_| SamlError::InvalidCondition)?;
        if now < not_before {
            return Err(SamlError::ConditionNotMet);
        }
    }
    if let Some(not_on_or_after) = not_on_or_after {
        let not_on_or_after = OffsetDateTime::parse(&not_on_or_after, &Iso8601::DEFAULT)
            .map_err(|_| SamlError::InvalidCondition)?;
        if now >= not_on_or_after {
            return Err(SamlError::ConditionNotMet);
        }
    }
    if let Some(expected) = expected_audience {
        if expected != audience {
            return Err(SamlError::ConditionNotMet);
        }
    }
    Ok(())
}

fn local_name_string(element: &BytesStart) -> Result<String, SamlError> {
    Ok(std::str::from_utf8(element.local_name().into_inner())
        .map_err(|err| SamlError::InvalidXml(err.to_string()))?
        .to_string())
}

fn path_is(path: &[String], expected: &[&str]) -> bool {
    path.len() == expected.len() && path.iter().zip(expected).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use crate::assertion::AssertionBuilder;
    use crate::keys::KeyMaterial;
    use crate::signing::Signer;
    use crate::validation::ValidationMode;
    use crate::{NAME_ID_FORMAT_EMAIL_ADDRESS, NAME_ID_FORMAT_UNSPECIFIED};

    use super::*;

    const TEST_KEY_PEM: &str = include_str!("../static/test_key.pem");
    const TEST_CERT_PEM: &str = include_str!("../static/test_cert.pem");

    fn signer() -> Signer {
        Signer::new(KeyMaterial::from_pem(TEST_KEY_PEM, TEST_CERT_PEM).unwrap())
    }

    fn instant() -> OffsetDateTime {
        OffsetDateTime::parse("2026-01-01T12:00:00Z", &Iso8601::DEFAULT).unwrap()
    }

    fn encoded_response() -> String {
        AssertionBuilder::new()
            .issue_instant(instant())
            .issuer("http://idp.example.org")
            .in_response_to("_12345")
            .recipient("https://sp.example.org/acs")
            .audience("http://sp.example.org")
            .subject("user-42")
            .attribute("email", "user-42@example.org")
            .build_and_encode(&signer())
            .unwrap()
    }

    fn sp_context() -> ValidationContext {
        ValidationContext::new()
            .trust_certificate_pem(TEST_CERT_PEM)
            .unwrap()
    }

    #[test]
    fn accepts_a_fresh_response_for_the_right_audience() {
        let decoded = decode_response(&encoded_response()).unwrap();
        let subject = validate_response(
            &decoded,
            &sp_context(),
            NAME_ID_FORMAT_UNSPECIFIED,
            instant() + Duration::minutes(5),
            "http://sp.example.org",
        )
        .unwrap();
        assert_eq!(subject, "user-42");
    }

    #[test]
    fn rejects_an_expired_response() {
        let decoded = decode_response(&encoded_response()).unwrap();
        assert!(matches!(
            validate_response(
                &decoded,
                &sp_context(),
                NAME_ID_FORMAT_UNSPECIFIED,
                instant() + Duration::hours(3),
                "http://sp.example.org",
            ),
            Err(SamlError::ConditionNotMet)
        ));
    }

    #[test]
    fn rejects_a_response_before_its_window() {
        let decoded = decode_response(&encoded_response()).unwrap();
        assert!(matches!(
            validate_response(
                &decoded,
                &sp_context(),
                NAME_ID_FORMAT_UNSPECIFIED,
                instant() - Duration::minutes(10),
                "http://sp.example.org",
            ),
            Err(SamlError::ConditionNotMet)
        ));
    }

    #[test]
    fn rejects_the_wrong_audience() {
        let decoded = decode_response(&encoded_response()).unwrap();
        assert!(matches!(
            validate_response(
                &decoded,
                &sp_context(),
                NAME_ID_FORMAT_UNSPECIFIED,
                instant() + Duration::minutes(5),
                "http://other.example.org",
            ),
            Err(SamlError::ConditionNotMet)
        ));
    }

    #[test]
    fn enforce_mode_rejects_a_tampered_response() {
        let decoded = decode_response(&encoded_response()).unwrap();
        let tampered = String::from_utf8(decoded)
            .unwrap()
            .replace("user-42", "admin");
        assert!(matches!(
            validate_response(
                tampered.as_bytes(),
                &sp_context(),
                NAME_ID_FORMAT_UNSPECIFIED,
                instant() + Duration::minutes(5),
                "http://sp.example.org",
            ),
            Err(SamlError::DigestMismatch)
        ));
    }

    #[test]
    fn permissive_mode_serves_the_subject_anyway() {
        let decoded = decode_response(&encoded_response()).unwrap();
        let tampered = String::from_utf8(decoded)
            .unwrap()
            .replace("user-42", "admin");
        let ctx = sp_context().mode(ValidationMode::Permissive);
        let subject = validate_response(
            tampered.as_bytes(),
            &ctx,
            NAME_ID_FORMAT_UNSPECIFIED,
            instant() + Duration::minutes(5),
            "http://sp.example.org",
        )
        .unwrap();
        assert_eq!(subject, "admin");
    }

    #[test]
    fn permissive_mode_still_rejects_structural_failures() {
        let xml = br#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_1"/>"#;
        let ctx = sp_context().mode(ValidationMode::Permissive);
        assert!(matches!(
            validate_response(
                xml,
                &ctx,
                NAME_ID_FORMAT_UNSPECIFIED,
                instant(),
                "http://sp.example.org",
            ),
            Err(SamlError::AssertionNotFound)
        ));
    }

    #[test]
    fn extracts_the_response_issuer() {
        let decoded = decode_response(&encoded_response()).unwrap();
        assert_eq!(
            extract_response_issuer(&decoded).unwrap(),
            "http://idp.example.org"
        );
    }

    #[test]
    fn issuer_extraction_requires_a_response_document() {
        let xml = br#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"><saml:Issuer>x</saml:Issuer></saml:Assertion>"#;
        assert!(matches!(
            extract_response_issuer(xml),
            Err(SamlError::MissingIssuer)
        ));
    }

    #[test]
    fn subject_extraction_honors_the_name_format() {
        let decoded = decode_response(&encoded_response()).unwrap();
        assert!(matches!(
            extract_response_subject(&decoded, NAME_ID_FORMAT_EMAIL_ADDRESS),
            Err(SamlError::SubjectNotFound)
        ));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert!(matches!(
            decode_response("!!"),
            Err(SamlError::InvalidBase64(_))
        ));
    }
}
