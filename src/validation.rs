use std::fs;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use x509_parser::prelude::*;

use crate::c14n::canonicalize;
use crate::keys::certificate_from_pem;
use crate::signing::{SignatureAlgorithm, XMLDSIG_NS};
use crate::utils::{attr_value, decode_xml_base64};
use crate::SamlError;

// Failure handling for the consuming side. Enforce rejects documents whose
// signature does not check out; Permissive logs the failure and carries on.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ValidationMode {
    #[default]
    Enforce,
    Permissive,
}

pub struct ValidationContext {
    trusted_certificates: Vec<Vec<u8>>,
    id_attribute: String,
    mode: ValidationMode,
}

impl Default for ValidationContext {
    fn default() -> Self {
        ValidationContext::new()
    }
}

impl ValidationContext {
    pub fn new() -> Self {
        ValidationContext {
            trusted_certificates: Vec::new(),
            id_attribute: "ID".to_string(),
            mode: ValidationMode::Enforce,
        }
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, SamlError> {
        let pem = fs::read_to_string(path).map_err(SamlError::Io)?;
        Ok(ValidationContext::new().trust_certificate(certificate_from_pem(&pem)?))
    }

    pub fn trust_certificate(mut self, der: Vec<u8>) -> Self {
        self.trusted_certificates.push(der);
        self
    }

    pub fn trust_certificate_pem(self, pem: &str) -> Result<Self, SamlError> {
        Ok(self.trust_certificate(certificate_from_pem(pem)?))
    }

    pub fn id_attribute(self, name: &str) -> Self {
        ValidationContext {
            id_attribute: name.to_string(),
            ..self
        }
    }

    pub fn mode(self, mode: ValidationMode) -> Self {
        ValidationContext { mode, ..self }
    }

    pub(crate) fn is_permissive(&self) -> bool {
        self.mode == ValidationMode::Permissive
    }
}

// Checks the enveloped signature on the assertion inside `encoded`, which is
// standard base64 of either a whole Response document or a bare assertion.
pub fn validate_assertion(encoded: &str, ctx: &ValidationContext) -> Result<(), SamlError> {
    let decoded = decode_xml_base64(encoded).map_err(SamlError::InvalidBase64)?;
    let xml = std::str::from_utf8(&decoded).map_err(|err| SamlError::InvalidXml(err.to_string()))?;
    validate_assertion_xml(xml, ctx)
}

pub(crate) fn validate_assertion_xml(xml: &str, ctx: &ValidationContext) -> Result<(), SamlError> {
    let assertion = element_span(xml, b"Assertion", &ctx.id_attribute)?
        .ok_or(SamlError::AssertionNotFound)?;
    let assertion_xml = &xml[assertion.start..assertion.end];

    let signature = element_span(assertion_xml, b"Signature", &ctx.id_attribute)?
        .ok_or(SamlError::SignatureNotFound)?;
    let signature_xml = &assertion_xml[signature.start..signature.end];
    require_dsig_namespace(signature_xml)?;
    let info = extract_signature_info(signature_xml)?;

    // The reference must point at the assertion being validated, not at
    // whatever element an attacker re-targeted it to.
    let assertion_id = assertion.id.ok_or(SamlError::ReferenceIdMismatch)?;
    let reference_uri = info
        .reference_uri
        .as_deref()
        .ok_or(SamlError::ReferenceIdMismatch)?;
    if reference_uri.strip_prefix('#') != Some(assertion_id.as_str()) {
        return Err(SamlError::ReferenceIdMismatch);
    }

    // Digest is computed over the assertion with the signature element
    // removed, exactly as the issuing side saw it before splicing.
    let digest_algorithm = SignatureAlgorithm::from_digest_uri(&info.digest_algorithm)
        .ok_or_else(|| SamlError::UnsupportedAlgorithm(info.digest_algorithm.clone()))?;
    let mut unsigned = String::with_capacity(assertion_xml.len());
    unsigned.push_str(&assertion_xml[..signature.start]);
    unsigned.push_str(&assertion_xml[signature.end..]);
    let canonical = canonicalize(&unsigned)?;
    let declared_digest =
        decode_xml_base64(&info.digest_value).map_err(|_| SamlError::DigestMismatch)?;
    if digest_algorithm.digest(canonical.as_bytes()) != declared_digest {
        return Err(SamlError::DigestMismatch);
    }

    let signature_algorithm: SignatureAlgorithm = info
        .signature_algorithm
        .parse()
        .map_err(|_| SamlError::UnsupportedAlgorithm(info.signature_algorithm.clone()))?;
    let signature_bytes =
        decode_xml_base64(&info.signature_value).map_err(|_| SamlError::SignatureMismatch)?;
    let signed_info_digest =
        signature_algorithm.digest(canonicalize(&info.signed_info)?.as_bytes());

    for der in trust_anchors(ctx, info.certificate.as_deref())? {
        if verify_with_certificate(&der, signature_algorithm, &signed_info_digest, &signature_bytes)? {
            return Ok(());
        }
    }
    Err(SamlError::SignatureMismatch)
}

struct ElementSpan {
    start: usize,
    end: usize,
    id: Option<String>,
}

// Byte range of the first element with the given local name, located by
// reader offsets so namespace prefixes don't matter. The range is spliced
// out of or reassembled into the surrounding text verbatim, which is what
// keeps the signer's and validator's canonical inputs identical.
fn element_span(
    xml: &str,
    local: &[u8],
    id_attribute: &str,
) -> Result<Option<ElementSpan>, SamlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut start: Option<usize> = None;
    let mut id = None;
    let mut depth = 0usize;
    loop {
        let pos = reader.buffer_position() as usize;
        match reader
            .read_event()
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?
        {
            Event::Start(e) if e.local_name().as_ref() == local => {
                if start.is_none() {
                    start = Some(pos);
                    id = attr_value(&e, id_attribute.as_bytes())?;
                    depth = 1;
                } else {
                    depth += 1;
                }
            }
            Event::Empty(e) if start.is_none() && e.local_name().as_ref() == local => {
                return Ok(Some(ElementSpan {
                    start: pos,
                    end: reader.buffer_position() as usize,
                    id: attr_value(&e, id_attribute.as_bytes())?,
                }));
            }
            Event::End(e) if e.local_name().as_ref() == local => {
                if let Some(span_start) = start {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(Some(ElementSpan {
                            start: span_start,
                            end: reader.buffer_position() as usize,
                            id,
                        }));
                    }
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

// The whole Signature span is excluded from the digest input, so its bytes
// are never covered by the digest check. The open tag must therefore bind
// its prefix to the XML-DSig namespace, or a lookalike element in a foreign
// namespace would pass for the document's signature.
fn require_dsig_namespace(signature_xml: &str) -> Result<(), SamlError> {
    let mut reader = Reader::from_str(signature_xml);
    loop {
        match reader
            .read_event()
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?
        {
            Event::Start(e) | Event::Empty(e) => {
                let declaration = match e.name().prefix() {
                    Some(prefix) => format!("xmlns:{}", String::from_utf8_lossy(prefix.as_ref())),
                    None => "xmlns".to_string(),
                };
                return match attr_value(&e, declaration.as_bytes())? {
                    Some(uri) if uri == XMLDSIG_NS => Ok(()),
                    _ => Err(SamlError::SignatureNotFound),
                };
            }
            Event::Eof => return Err(SamlError::SignatureNotFound),
            _ => {}
        }
    }
}

struct SignatureInfo {
    signed_info: String,
    signature_value: String,
    digest_value: String,
    reference_uri: Option<String>,
    signature_algorithm: String,
    digest_algorithm: String,
    certificate: Option<String>,
}

enum Capture {
    None,
    SignatureValue,
    Certificate,
}

// Only SignedInfo is covered by the RSA check. Every field that drives the
// verdict (the Reference URI, the algorithm URIs, the declared digest) must
// come from inside it; KeyInfo and the rest of the Signature element are
// unsigned bytes, and a value harvested from there would let a decoy
// override the signed one.
fn extract_signature_info(signature_xml: &str) -> Result<SignatureInfo, SamlError> {
    let signed_info = element_span(signature_xml, b"SignedInfo", "ID")?
        .map(|span| signature_xml[span.start..span.end].to_string())
        .ok_or(SamlError::SignatureNotFound)?;

    let mut reference_uri = None;
    let mut signature_algorithm = None;
    let mut digest_algorithm = None;
    let mut digest_value = None;
    {
        let mut reader = Reader::from_str(&signed_info);
        reader.config_mut().trim_text(true);
        let mut in_digest_value = false;
        loop {
            let event = reader
                .read_event()
                .map_err(|err| SamlError::InvalidXml(err.to_string()))?;
            match &event {
                Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                    b"Reference" => reference_uri = attr_value(e, b"URI")?,
                    b"SignatureMethod" => signature_algorithm = attr_value(e, b"Algorithm")?,
                    b"DigestMethod" => digest_algorithm = attr_value(e, b"Algorithm")?,
                    b"DigestValue" if matches!(&event, Event::Start(_)) => in_digest_value = true,
                    _ => {}
                },
                Event::Text(e) if in_digest_value => {
                    digest_value = Some(
                        e.unescape()
                            .map_err(|err| SamlError::InvalidXml(err.to_string()))?
                            .into_owned(),
                    );
                }
                Event::End(_) => in_digest_value = false,
                Event::Eof => break,
                _ => {}
            }
        }
    }

    let mut reader = Reader::from_str(signature_xml);
    reader.config_mut().trim_text(true);

    let mut capture = Capture::None;
    let mut signature_value = None;
    let mut certificate = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?;
        match &event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"SignatureValue" => capture = Capture::SignatureValue,
                b"X509Certificate" => capture = Capture::Certificate,
                _ => {}
            },
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|err| SamlError::InvalidXml(err.to_string()))?
                    .into_owned();
                match capture {
                    Capture::SignatureValue => {
                        if signature_value.is_none() {
                            signature_value = Some(text);
                        }
                    }
                    // First certificate wins; KeyInfo may carry a chain.
                    Capture::Certificate => {
                        if certificate.is_none() {
                            certificate = Some(text);
                        }
                    }
                    Capture::None => {}
                }
            }
            Event::End(_) => capture = Capture::None,
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(SignatureInfo {
        signed_info,
        signature_value: signature_value.ok_or(SamlError::SignatureMismatch)?,
        digest_value: digest_value.ok_or(SamlError::DigestMismatch)?,
        reference_uri,
        signature_algorithm: signature_algorithm.unwrap_or_default(),
        digest_algorithm: digest_algorithm.unwrap_or_default(),
        certificate,
    })
}

fn trust_anchors(
    ctx: &ValidationContext,
    embedded: Option<&str>,
) -> Result<Vec<Vec<u8>>, SamlError> {
    if !ctx.trusted_certificates.is_empty() {
        return Ok(ctx.trusted_certificates.clone());
    }
    match embedded {
        Some(text) => {
            tracing::debug!(
                "no trust anchors configured, using the certificate embedded in the signature"
            );
            let der = decode_xml_base64(text).map_err(|_| SamlError::InvalidCertificate)?;
            Ok(vec![der])
        }
        None => Err(SamlError::NoCertificateFound),
    }
}

fn verify_with_certificate(
    der: &[u8],
    algorithm: SignatureAlgorithm,
    digest: &[u8],
    signature: &[u8],
) -> Result<bool, SamlError> {
    let (_, certificate) =
        X509Certificate::from_der(der).map_err(|_| SamlError::InvalidCertificate)?;
    let public_key = RsaPublicKey::from_public_key_der(certificate.public_key().raw)
        .map_err(|_| SamlError::InvalidCertificate)?;
    Ok(public_key
        .verify(algorithm.padding(), digest, signature)
        .is_ok())
}
