mod assertion;
mod authn_request;
mod c14n;
mod keys;
mod response;
mod signing;
mod utils;
mod validation;
pub mod wire;

pub use assertion::AssertionBuilder;
pub use authn_request::{
    parse_authn_request, sso_redirect_url, AuthnRequestBuilder, ParsedAuthnRequest,
    ProtocolBinding,
};
pub use keys::{certificate_from_pem, KeyMaterial};
pub use response::{
    decode_response, extract_response_issuer, extract_response_subject, validate_response,
};
pub use signing::{SignatureAlgorithm, Signer};
pub use validation::{validate_assertion, ValidationContext, ValidationMode};
use time::format_description::well_known::iso8601::{self, TimePrecision};

pub const NAME_ID_FORMAT_EMAIL_ADDRESS: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
pub const AUTHN_CONTEXT_PASSWORD_PROTECTED_TRANSPORT: &str =
    "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport";

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;

#[derive(Debug)]
pub enum SamlError {
    InvalidBase64(base64::DecodeError),
    CorruptDeflateStream,
    TruncatedDeflateStream,
    InvalidXml(String),
    RequestElementNotFound,
    MissingRequestId,
    MissingIssuer,
    MissingId,
    AssertionNotFound,
    SignatureNotFound,
    SubjectNotFound,
    NoCertificateFound,
    InvalidCertificate,
    InvalidPrivateKey(rsa::pkcs8::Error),
    UnsupportedAlgorithm(String),
    DigestMismatch,
    SignatureMismatch,
    ReferenceIdMismatch,
    SigningFailed(rsa::Error),
    InvalidCondition,
    ConditionNotMet,
    Io(std::io::Error),
}
