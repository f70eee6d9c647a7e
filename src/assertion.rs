use base64::{prelude::BASE64_STANDARD, Engine};
use time::{Duration, OffsetDateTime};

use crate::signing::Signer;
use crate::utils::{random_string, xml_escape};
use crate::{
    SamlError, AUTHN_CONTEXT_PASSWORD_PROTECTED_TRANSPORT, DATE_TIME_FORMAT,
    NAME_ID_FORMAT_UNSPECIFIED,
};

const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
const XML_SCHEMA_NS: &str = "http://www.w3.org/2001/XMLSchema";
const XML_SCHEMA_INSTANCE_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
const CONFIRMATION_METHOD_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";
const ATTRIBUTE_NAME_FORMAT_BASIC: &str = "urn:oasis:names:tc:SAML:2.0:attrname-format:basic";

// Federation peers rarely agree on the time to the second.
const NOT_BEFORE_SKEW: Duration = Duration::minutes(2);
const DEFAULT_VALIDITY: Duration = Duration::hours(2);

#[derive(Default)]
pub struct AssertionBuilder {
    assertion_id: Option<String>,
    response_id: Option<String>,
    issuer: Option<String>,
    in_response_to: Option<String>,
    destination: Option<String>,
    recipient: Option<String>,
    audience: Option<String>,
    subject: Option<String>,
    name_id_format: Option<String>,
    authn_context: Option<String>,
    attributes: Vec<(String, String)>,
    issue_instant: Option<OffsetDateTime>,
    validity: Option<Duration>,
}

impl AssertionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assertion_id(self, id: &str) -> Self {
        AssertionBuilder {
            assertion_id: Some(id.into()),
            ..self
        }
    }

    pub fn response_id(self, id: &str) -> Self {
        AssertionBuilder {
            response_id: Some(id.into()),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        AssertionBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn in_response_to(self, request_id: &str) -> Self {
        AssertionBuilder {
            in_response_to: Some(request_id.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        AssertionBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn recipient(self, recipient: &str) -> Self {
        AssertionBuilder {
            recipient: Some(recipient.into()),
            ..self
        }
    }

    pub fn audience(self, audience: &str) -> Self {
        AssertionBuilder {
            audience: Some(audience.into()),
            ..self
        }
    }

    pub fn subject(self, subject: &str) -> Self {
        AssertionBuilder {
            subject: Some(subject.into()),
            ..self
        }
    }

    pub fn name_id_format(self, format: &str) -> Self {
        AssertionBuilder {
            name_id_format: Some(format.into()),
            ..self
        }
    }

    pub fn authn_context(self, class_ref: &str) -> Self {
        AssertionBuilder {
            authn_context: Some(class_ref.into()),
            ..self
        }
    }

    pub fn attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AssertionBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issued_now(self) -> Self {
        AssertionBuilder {
            issue_instant: Some(OffsetDateTime::now_utc()),
            ..self
        }
    }

    pub fn validity(self, validity: Duration) -> Self {
        AssertionBuilder {
            validity: Some(validity),
            ..self
        }
    }

    pub fn build(self) -> String {
        self.render_assertion()
    }

    // Signs the assertion first, then wraps it in the Response shell, so the
    // response-level text never participates in the digest.
    pub fn build_signed_response(self, signer: &Signer) -> Result<String, SamlError> {
        let assertion = self.render_assertion();
        let signed = signer.sign_enveloped(&assertion)?;
        Ok(self.render_response(&signed))
    }

    pub fn build_and_encode(self, signer: &Signer) -> Result<String, SamlError> {
        Ok(BASE64_STANDARD.encode(self.build_signed_response(signer)?))
    }

    fn render_assertion(&self) -> String {
        let instant = self.issue_instant.expect("IssueInstant is required");
        let issued = format_instant(instant);
        let not_before = format_instant(instant - NOT_BEFORE_SKEW);
        let not_on_or_after = format_instant(instant + self.validity.unwrap_or(DEFAULT_VALIDITY));
        let assertion_id = self
            .assertion_id
            .clone()
            .unwrap_or_else(|| format!("_id{}", random_string(32)));

        let mut xml = format!(
            "<saml:Assertion xmlns:saml=\"{}\" ID=\"{}\" Version=\"2.0\" IssueInstant=\"{}\">\
             <saml:Issuer>{}</saml:Issuer>",
            ASSERTION_NS,
            xml_escape(&assertion_id),
            issued,
            xml_escape(self.issuer.as_deref().expect("Issuer is required")),
        );
        xml.push_str(&self.subject_block(&not_on_or_after));
        xml.push_str(&self.conditions_block(&not_before, &not_on_or_after));
        xml.push_str(&self.authn_statement_block(&issued));
        xml.push_str(&self.attribute_statement_block());
        xml.push_str("</saml:Assertion>");
        xml
    }

    fn subject_block(&self, not_on_or_after: &str) -> String {
        let name_id_format = self
            .name_id_format
            .as_deref()
            .unwrap_or(NAME_ID_FORMAT_UNSPECIFIED);
        format!(
            "<saml:Subject>\
             <saml:NameID Format=\"{}\">{}</saml:NameID>\
             <saml:SubjectConfirmation Method=\"{}\">\
             <saml:SubjectConfirmationData NotOnOrAfter=\"{}\" Recipient=\"{}\" InResponseTo=\"{}\"/>\
             </saml:SubjectConfirmation>\
             </saml:Subject>",
            xml_escape(name_id_format),
            xml_escape(self.subject.as_deref().expect("Subject is required")),
            CONFIRMATION_METHOD_BEARER,
            not_on_or_after,
            xml_escape(self.recipient.as_deref().expect("Recipient is required")),
            xml_escape(self.in_response_to.as_deref().expect("InResponseTo is required")),
        )
    }

    fn conditions_block(&self, not_before: &str, not_on_or_after: &str) -> String {
        format!(
            "<saml:Conditions NotBefore=\"{}\" NotOnOrAfter=\"{}\">\
             <saml:AudienceRestriction>\
             <saml:Audience>{}</saml:Audience>\
             </saml:AudienceRestriction>\
             </saml:Conditions>",
            not_before,
            not_on_or_after,
            xml_escape(self.audience.as_deref().expect("Audience is required")),
        )
    }

    fn authn_statement_block(&self, issued: &str) -> String {
        let authn_context = self
            .authn_context
            .as_deref()
            .unwrap_or(AUTHN_CONTEXT_PASSWORD_PROTECTED_TRANSPORT);
        format!(
            "<saml:AuthnStatement AuthnInstant=\"{}\">\
             <saml:AuthnContext>\
             <saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef>\
             </saml:AuthnContext>\
             </saml:AuthnStatement>",
            issued,
            xml_escape(authn_context),
        )
    }

    fn attribute_statement_block(&self) -> String {
        if self.attributes.is_empty() {
            return String::new();
        }
        let mut xml = format!(
            "<saml:AttributeStatement xmlns:xs=\"{}\" xmlns:xsi=\"{}\">",
            XML_SCHEMA_NS, XML_SCHEMA_INSTANCE_NS,
        );
        for (name, value) in &self.attributes {
            xml.push_str(&format!(
                "<saml:Attribute Name=\"{}\" NameFormat=\"{}\">\
                 <saml:AttributeValue xsi:type=\"xs:string\">{}</saml:AttributeValue>\
                 </saml:Attribute>",
                xml_escape(name),
                ATTRIBUTE_NAME_FORMAT_BASIC,
                xml_escape(value),
            ));
        }
        xml.push_str("</saml:AttributeStatement>");
        xml
    }

    fn render_response(&self, signed_assertion: &str) -> String {
        let response_id = self
            .response_id
            .clone()
            .unwrap_or_else(|| format!("_id{}", random_string(32)));
        let issued = format_instant(self.issue_instant.expect("IssueInstant is required"));
        let destination = match self.destination.as_deref() {
            Some(destination) => format!(" Destination=\"{}\"", xml_escape(destination)),
            None => String::new(),
        };
        format!(
            "<samlp:Response xmlns:samlp=\"{}\" xmlns:saml=\"{}\" ID=\"{}\" Version=\"2.0\" IssueInstant=\"{}\" InResponseTo=\"{}\"{}>\
             <saml:Issuer>{}</saml:Issuer>\
             <samlp:Status><samlp:StatusCode Value=\"{}\"/></samlp:Status>\
             {}\
             </samlp:Response>",
            PROTOCOL_NS,
            ASSERTION_NS,
            xml_escape(&response_id),
            issued,
            xml_escape(self.in_response_to.as_deref().expect("InResponseTo is required")),
            destination,
            xml_escape(self.issuer.as_deref().expect("Issuer is required")),
            STATUS_SUCCESS,
            signed_assertion,
        )
    }
}

fn format_instant(instant: OffsetDateTime) -> String {
    instant
        .format(&DATE_TIME_FORMAT)
        .expect("Infallible formatting")
}
