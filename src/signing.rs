use std::fmt::Display;
use std::str::FromStr;

use base64::{prelude::BASE64_STANDARD, Engine};
use quick_xml::events::Event;
use quick_xml::Reader;
use rsa::Pkcs1v15Sign;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::c14n::canonicalize;
use crate::keys::KeyMaterial;
use crate::utils::attr_value;
use crate::SamlError;

pub(crate) const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Default, Debug, PartialEq, Eq, Clone, Copy)]
pub enum SignatureAlgorithm {
    RsaSha1,
    #[default]
    RsaSha256,
}

impl SignatureAlgorithm {
    pub(crate) fn digest_uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
        }
    }

    pub(crate) fn from_digest_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2000/09/xmldsig#sha1" => Some(SignatureAlgorithm::RsaSha1),
            "http://www.w3.org/2001/04/xmlenc#sha256" => Some(SignatureAlgorithm::RsaSha256),
            _ => None,
        }
    }

    pub(crate) fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            SignatureAlgorithm::RsaSha1 => Sha1::digest(data).to_vec(),
            SignatureAlgorithm::RsaSha256 => Sha256::digest(data).to_vec(),
        }
    }

    pub(crate) fn padding(&self) -> Pkcs1v15Sign {
        match self {
            SignatureAlgorithm::RsaSha1 => Pkcs1v15Sign::new::<Sha1>(),
            SignatureAlgorithm::RsaSha256 => Pkcs1v15Sign::new::<Sha256>(),
        }
    }
}

impl Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureAlgorithm::RsaSha1 => {
                write!(f, "http://www.w3.org/2000/09/xmldsig#rsa-sha1")
            }
            SignatureAlgorithm::RsaSha256 => {
                write!(f, "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256")
            }
        }
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http://www.w3.org/2000/09/xmldsig#rsa-sha1" => Ok(SignatureAlgorithm::RsaSha1),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256" => {
                Ok(SignatureAlgorithm::RsaSha256)
            }
            _ => Err(()),
        }
    }
}

pub struct Signer {
    key_material: KeyMaterial,
    algorithm: SignatureAlgorithm,
}

impl Signer {
    pub fn new(key_material: KeyMaterial) -> Self {
        Signer {
            key_material,
            algorithm: SignatureAlgorithm::default(),
        }
    }

    pub fn algorithm(self, algorithm: SignatureAlgorithm) -> Self {
        Signer { algorithm, ..self }
    }

    pub fn certificate_der(&self) -> &[u8] {
        self.key_material.certificate_der()
    }

    // Digests the canonical form of the whole document, signs a SignedInfo
    // referencing the root's ID attribute, and splices the ds:Signature
    // element in directly after the closing Issuer tag. The document must
    // not already contain a signature.
    pub fn sign_enveloped(&self, xml: &str) -> Result<String, SamlError> {
        let reference_id = root_id_attribute(xml)?.ok_or(SamlError::MissingId)?;

        let canonical = canonicalize(xml)?;
        let digest_value = BASE64_STANDARD.encode(self.algorithm.digest(canonical.as_bytes()));

        let signed_info = format!(
            "<ds:SignedInfo xmlns:ds=\"{ns}\">\
             <ds:CanonicalizationMethod Algorithm=\"{c14n}\"/>\
             <ds:SignatureMethod Algorithm=\"{signature_uri}\"/>\
             <ds:Reference URI=\"#{reference_id}\">\
             <ds:Transforms>\
             <ds:Transform Algorithm=\"{enveloped}\"/>\
             <ds:Transform Algorithm=\"{c14n}\"/>\
             </ds:Transforms>\
             <ds:DigestMethod Algorithm=\"{digest_uri}\"/>\
             <ds:DigestValue>{digest_value}</ds:DigestValue>\
             </ds:Reference>\
             </ds:SignedInfo>",
            ns = XMLDSIG_NS,
            c14n = EXCLUSIVE_C14N,
            signature_uri = self.algorithm,
            enveloped = ENVELOPED_SIGNATURE,
            reference_id = reference_id,
            digest_uri = self.algorithm.digest_uri(),
            digest_value = digest_value,
        );

        let signed_info_digest = self.algorithm.digest(canonicalize(&signed_info)?.as_bytes());
        let signature_value = self
            .key_material
            .private_key()
            .sign(self.algorithm.padding(), &signed_info_digest)
            .map_err(SamlError::SigningFailed)?;

        let signature = format!(
            "<ds:Signature xmlns:ds=\"{ns}\">\
             {signed_info}\
             <ds:SignatureValue>{signature_value}</ds:SignatureValue>\
             <ds:KeyInfo>\
             <ds:X509Data>\
             <ds:X509Certificate>{certificate}</ds:X509Certificate>\
             </ds:X509Data>\
             </ds:KeyInfo>\
             </ds:Signature>",
            ns = XMLDSIG_NS,
            signed_info = signed_info,
            signature_value = BASE64_STANDARD.encode(&signature_value),
            certificate = BASE64_STANDARD.encode(self.key_material.certificate_der()),
        );

        let insert_at = issuer_close_end(xml).ok_or(SamlError::MissingIssuer)?;
        let mut signed = String::with_capacity(xml.len() + signature.len());
        signed.push_str(&xml[..insert_at]);
        signed.push_str(&signature);
        signed.push_str(&xml[insert_at..]);
        Ok(signed)
    }
}

fn root_id_attribute(xml: &str) -> Result<Option<String>, SamlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    loop {
        match reader
            .read_event()
            .map_err(|err| SamlError::InvalidXml(err.to_string()))?
        {
            Event::Start(e) | Event::Empty(e) => return attr_value(&e, b"ID"),
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn issuer_close_end(xml: &str) -> Option<usize> {
    for pattern in ["</saml:Issuer>", "</saml2:Issuer>", "</Issuer>"] {
        if let Some(pos) = xml.find(pattern) {
            return Some(pos + pattern.len());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY_PEM: &str = include_str!("../static/test_key.pem");
    const TEST_CERT_PEM: &str = include_str!("../static/test_cert.pem");

    const ASSERTION: &str = concat!(
        r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_idabc" Version="2.0" IssueInstant="2026-01-01T00:00:00Z">"#,
        r#"<saml:Issuer>http://idp.example.org</saml:Issuer>"#,
        r#"<saml:Subject><saml:NameID>user-42</saml:NameID></saml:Subject>"#,
        r#"</saml:Assertion>"#
    );

    fn signer() -> Signer {
        Signer::new(KeyMaterial::from_pem(TEST_KEY_PEM, TEST_CERT_PEM).unwrap())
    }

    #[test]
    fn splices_signature_after_the_issuer() {
        let signed = signer().sign_enveloped(ASSERTION).unwrap();
        let issuer_end = signed.find("</saml:Issuer>").unwrap() + "</saml:Issuer>".len();
        assert_eq!(&signed[issuer_end..issuer_end + "<ds:Signature".len()], "<ds:Signature");
        assert!(signed.find("</ds:Signature>").unwrap() < signed.find("<saml:Subject>").unwrap());
    }

    #[test]
    fn references_the_document_id() {
        let signed = signer().sign_enveloped(ASSERTION).unwrap();
        assert!(signed.contains(r##"<ds:Reference URI="#_idabc">"##));
    }

    #[test]
    fn embeds_the_signing_certificate() {
        let signed = signer().sign_enveloped(ASSERTION).unwrap();
        let material = KeyMaterial::from_pem(TEST_KEY_PEM, TEST_CERT_PEM).unwrap();
        let expected = BASE64_STANDARD.encode(material.certificate_der());
        assert!(signed.contains(&expected));
    }

    #[test]
    fn default_algorithm_is_rsa_sha256() {
        let signed = signer().sign_enveloped(ASSERTION).unwrap();
        assert!(signed.contains("http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"));
        assert!(signed.contains("http://www.w3.org/2001/04/xmlenc#sha256"));
    }

    #[test]
    fn rsa_sha1_uses_the_legacy_uris() {
        let signed = signer()
            .algorithm(SignatureAlgorithm::RsaSha1)
            .sign_enveloped(ASSERTION)
            .unwrap();
        assert!(signed.contains("http://www.w3.org/2000/09/xmldsig#rsa-sha1"));
        assert!(signed.contains(r#"DigestMethod Algorithm="http://www.w3.org/2000/09/xmldsig#sha1""#));
    }

    #[test]
    fn rejects_a_document_without_an_id() {
        let xml = r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"><saml:Issuer>x</saml:Issuer></saml:Assertion>"#;
        assert!(matches!(
            signer().sign_enveloped(xml),
            Err(SamlError::MissingId)
        ));
    }

    #[test]
    fn rejects_a_document_without_an_issuer() {
        let xml = r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_1"><saml:Subject/></saml:Assertion>"#;
        assert!(matches!(
            signer().sign_enveloped(xml),
            Err(SamlError::MissingIssuer)
        ));
    }
}
