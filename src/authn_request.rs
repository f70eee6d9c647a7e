use std::{fmt::Display, str::FromStr};

use quick_xml::events::Event;
use quick_xml::Reader;
use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::utils::random_string;
use crate::{wire, SamlError, DATE_TIME_FORMAT};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct AuthnRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "ProtocolBinding")]
    protocol_binding: String,
    #[yaserde(attribute = true, rename = "AssertionConsumerServiceURL")]
    assertion_consumer_service_url: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "NameIDPolicy", prefix = "samlp")]
    name_id_policy: NameIdPolicy,
    #[yaserde(rename = "Subject", prefix = "saml")]
    subject: Option<Subject>,
}

#[derive(YaSerialize)]
struct Issuer {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct NameIdPolicy {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(attribute = true, rename = "AllowCreate")]
    allow_create: bool,
}

#[derive(YaSerialize)]
struct Subject {
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: NameId,
}

#[derive(YaSerialize)]
struct NameId {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolBinding {
    Post,
    #[default]
    Redirect,
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolBinding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            ProtocolBinding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
        }
    }
}

impl FromStr for ProtocolBinding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(ProtocolBinding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(ProtocolBinding::Redirect),
            _ => Err(()),
        }
    }
}

// Request fields as seen by the identity provider after decoding the
// redirect binding. Everything except the ID and the issuer is optional on
// the wire.
#[derive(Debug)]
#[non_exhaustive]
pub struct ParsedAuthnRequest {
    pub id: String,
    pub version: Option<String>,
    pub issue_instant: Option<String>,
    pub destination: Option<String>,
    pub protocol_binding: Option<ProtocolBinding>,
    pub consumer_url: Option<String>,
    pub issuer: String,
}

pub fn parse_authn_request(input: &[u8]) -> Result<ParsedAuthnRequest, SamlError> {
    let xml = std::str::from_utf8(input).map_err(|err| SamlError::InvalidXml(err.to_string()))?;
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut found_request = false;
    let mut id = None;
    let mut version = None;
    let mut issue_instant = None;
    let mut destination = None;
    let mut protocol_binding = None;
    let mut consumer_url = None;
    let mut issuer: Option<String> = None;
    let mut in_issuer = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?;
        match &event {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"AuthnRequest" => {
                    found_request = true;
                    for attr in e.attributes().flatten() {
                        let value = attr
                            .unescape_value()
                            .map_err(|err| SamlError::InvalidXml(err.to_string()))?
                            .into_owned();
                        match attr.key.as_ref() {
                            b"ID" => id = Some(value),
                            b"Version" => version = Some(value),
                            b"IssueInstant" => issue_instant = Some(value),
                            b"Destination" => destination = Some(value),
                            b"ProtocolBinding" => protocol_binding = value.parse().ok(),
                            b"AssertionConsumerServiceURL" => consumer_url = Some(value),
                            _ => {}
                        }
                    }
                }
                b"Issuer" => in_issuer = matches!(&event, Event::Start(_)),
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"Issuer" => in_issuer = false,
            Event::Text(e) if in_issuer => {
                issuer = Some(
                    e.unescape()
                        .map_err(|err| SamlError::InvalidXml(err.to_string()))?
                        .into_owned(),
                )
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !found_request {
        return Err(SamlError::RequestElementNotFound);
    }
    let id = id.ok_or(SamlError::MissingRequestId)?;
    let issuer = issuer
        .filter(|value| !value.is_empty())
        .ok_or(SamlError::MissingIssuer)?;

    Ok(ParsedAuthnRequest {
        id,
        version,
        issue_instant,
        destination,
        protocol_binding,
        consumer_url,
        issuer,
    })
}

pub fn sso_redirect_url(sso_url: &str, saml_request: &str, relay_state: Option<&str>) -> String {
    let mut url = format!(
        "{}{}SAMLRequest={}",
        sso_url,
        if sso_url.contains('?') { '&' } else { '?' },
        urlencoding::encode(saml_request),
    );
    if let Some(state) = relay_state {
        url.push_str("&RelayState=");
        url.push_str(&urlencoding::encode(state));
    }
    url
}

#[derive(Default)]
pub struct AuthnRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    protocol_binding: ProtocolBinding,
    consumer_url: Option<String>,
    name_format: Option<String>,
    deny_create: bool,
    subject: Option<String>,
}

impl AuthnRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: &str) -> Self {
        AuthnRequestBuilder {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Self {
        AuthnRequestBuilder {
            id: Some(format!("_id{}", random_string(32))),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issued_now(self) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(OffsetDateTime::now_utc()),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        AuthnRequestBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        AuthnRequestBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn protocol_binding(self, binding: ProtocolBinding) -> Self {
        AuthnRequestBuilder {
            protocol_binding: binding,
            ..self
        }
    }

    pub fn consumer_url(self, url: &str) -> Self {
        AuthnRequestBuilder {
            consumer_url: Some(url.into()),
            ..self
        }
    }

    pub fn name_format(self, format: &str) -> Self {
        AuthnRequestBuilder {
            name_format: Some(format.into()),
            ..self
        }
    }

    pub fn allow_create(self, allow: bool) -> Self {
        AuthnRequestBuilder {
            deny_create: !allow,
            ..self
        }
    }

    pub fn subject(self, subject: &str) -> Self {
        AuthnRequestBuilder {
            subject: Some(subject.into()),
            ..self
        }
    }

    pub fn build(self) -> String {
        let req = AuthnRequest {
            id: self.id.expect("ID is required"),
            version: "2.0".to_string(),
            issue_instant: self
                .issue_instant
                .expect("IssueInstant is required")
                .format(&DATE_TIME_FORMAT)
                .expect("Infallible formatting"),
            destination: self.destination.expect("Destination is required"),
            protocol_binding: self.protocol_binding.to_string(),
            assertion_consumer_service_url: self.consumer_url.expect("Consumer URL is required"),
            issuer: Issuer {
                format: "urn:oasis:names:tc:SAML:2.0:nameid-format:entity".to_string(),
                content: self.issuer.expect("Issuer is required"),
            },
            name_id_policy: NameIdPolicy {
                format: self.name_format.clone().expect("Name format is required"),
                allow_create: !self.deny_create,
            },
            subject: self.subject.map(|subject| Subject {
                name_id: NameId {
                    format: self.name_format.clone().expect("Name format is required"),
                    content: subject,
                },
            }),
        };
        yaserde::ser::to_string(&req).expect("Infallible serialization")
    }

    pub fn build_and_encode(self) -> String {
        wire::encode(self.build().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use crate::{wire, NAME_ID_FORMAT_EMAIL_ADDRESS};

    use super::*;

    fn builder() -> AuthnRequestBuilder {
        AuthnRequestBuilder::new()
            .issued_now()
            .issuer("http://sp.example.org")
            .destination("https://idp.example.org/logon")
            .consumer_url("https://sp.example.org/acs")
            .name_format(NAME_ID_FORMAT_EMAIL_ADDRESS)
    }

    #[test]
    fn can_build_authn_request() {
        let xml = builder().auto_id().subject("user@example.org").build();
        assert!(xml.contains("<samlp:AuthnRequest"));
        assert!(xml.contains(r#"Destination="https://idp.example.org/logon""#));
        assert!(xml.contains(r#"AssertionConsumerServiceURL="https://sp.example.org/acs""#));
        assert!(xml.contains("user@example.org"));
    }

    #[test]
    fn generated_ids_are_unique() {
        let first = parse_authn_request(builder().auto_id().build().as_bytes()).unwrap();
        let second = parse_authn_request(builder().auto_id().build().as_bytes()).unwrap();
        assert!(first.id.starts_with("_id"));
        assert_eq!(first.id.len(), "_id".len() + 32);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn round_trips_through_the_redirect_binding() {
        let encoded = builder().id("_12345").build_and_encode();
        let xml = wire::decode(&encoded).unwrap();
        let parsed = parse_authn_request(&xml).unwrap();
        assert_eq!(parsed.id, "_12345");
        assert_eq!(parsed.issuer, "http://sp.example.org");
        assert_eq!(
            parsed.consumer_url.as_deref(),
            Some("https://sp.example.org/acs")
        );
        assert_eq!(parsed.protocol_binding, Some(ProtocolBinding::Redirect));
        assert_eq!(parsed.version.as_deref(), Some("2.0"));
    }

    #[test]
    fn parse_requires_an_id() {
        let xml = br#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" Version="2.0"><saml:Issuer>http://sp.example.org</saml:Issuer></samlp:AuthnRequest>"#;
        assert!(matches!(
            parse_authn_request(xml),
            Err(SamlError::MissingRequestId)
        ));
    }

    #[test]
    fn parse_requires_an_issuer() {
        let xml = br#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_1" Version="2.0"/>"#;
        assert!(matches!(
            parse_authn_request(xml),
            Err(SamlError::MissingIssuer)
        ));
    }

    #[test]
    fn parse_treats_an_empty_issuer_as_missing() {
        let xml = br#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_1"><saml:Issuer></saml:Issuer></samlp:AuthnRequest>"#;
        assert!(matches!(
            parse_authn_request(xml),
            Err(SamlError::MissingIssuer)
        ));
    }

    #[test]
    fn parse_rejects_non_request_documents() {
        let xml = br#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_1"/>"#;
        assert!(matches!(
            parse_authn_request(xml),
            Err(SamlError::RequestElementNotFound)
        ));
    }

    #[test]
    fn parse_rejects_broken_xml() {
        assert!(matches!(
            parse_authn_request(b"<samlp:AuthnRequest ID="),
            Err(SamlError::InvalidXml(_))
        ));
    }

    #[test]
    fn redirect_url_carries_request_and_relay_state() {
        let url = sso_redirect_url("https://idp.example.org/sso", "abc+/=", Some("st ate"));
        assert_eq!(
            url,
            "https://idp.example.org/sso?SAMLRequest=abc%2B%2F%3D&RelayState=st%20ate"
        );
    }

    #[test]
    fn redirect_url_appends_to_an_existing_query() {
        let url = sso_redirect_url("https://idp.example.org/sso?tenant=t1", "req", None);
        assert_eq!(url, "https://idp.example.org/sso?tenant=t1&SAMLRequest=req");
    }
}
