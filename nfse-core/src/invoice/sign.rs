//! XMLDSig signing of invoice payloads and independent verification.
use super::InvoicePayload;
use super::ValidationError;
use super::xml::constants::SIGNED_ELEMENT;
use super::xml::{canonical_xml, request_document, signature_xml, signed_info_xml};
use crate::vault::DecryptedCertificate;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use pkcs8::PrivateKeyInfo;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use x509_cert::Certificate;
use x509_cert::der::Decode;
use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const SECP256K1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.10");

#[derive(Debug, Error)]
pub enum SigningError {
    #[error(transparent)]
    SchemaValidation(#[from] ValidationError),
    #[error("unsupported key: {0}")]
    UnsupportedKeyAlgorithm(String),
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("malformed signed document: {0}")]
    Malformed(String),
    #[error("signed document is missing {0}")]
    MissingElement(&'static str),
    #[error("reference URI '{found}' does not point at element '{expected}'")]
    ReferenceMismatch { expected: String, found: String },
    #[error("digest of the signed element does not match DigestValue")]
    DigestMismatch,
    #[error("signature value does not verify")]
    InvalidSignature,
    #[error("embedded certificate does not use an EC secp256k1 key")]
    UnsupportedKeyAlgorithm,
    #[error("embedded certificate is not the expected certificate")]
    CertificateMismatch,
}

/// A signed `GerarNfseEnvio` document ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    xml: String,
    reference_id: String,
    digest_value: String,
    certificate_version: u32,
    signed_at: DateTime<Utc>,
}

impl SignedDocument {
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    pub fn reference_id(&self) -> &str {
        &self.reference_id
    }

    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }

    /// Vault version of the certificate that produced the signature.
    pub fn certificate_version(&self) -> u32 {
        self.certificate_version
    }

    pub fn signed_at(&self) -> DateTime<Utc> {
        self.signed_at
    }

    #[cfg(test)]
    pub(crate) fn unsigned(xml: impl Into<String>) -> Self {
        Self {
            xml: xml.into(),
            reference_id: String::new(),
            digest_value: String::new(),
            certificate_version: 0,
            signed_at: Utc::now(),
        }
    }
}

/// Signature checks that passed, with the values they were checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDocument {
    reference_id: String,
    digest_value: String,
    certificate_der: Vec<u8>,
}

impl VerifiedDocument {
    pub fn reference_id(&self) -> &str {
        &self.reference_id
    }

    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }
}

/// Produces enveloped ECDSA-SHA256 signatures over the canonical invoice element.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureEngine;

impl SignatureEngine {
    pub fn new() -> Self {
        Self
    }

    /// Sign `payload` with the certificate behind `handle`.
    ///
    /// The handle is consumed and its key material wiped before this returns,
    /// on success and on every error path.
    ///
    /// # Errors
    /// - [`SigningError::SchemaValidation`] when required payload fields are absent.
    /// - [`SigningError::UnsupportedKeyAlgorithm`] for non secp256k1 keys or a key
    ///   that does not belong to the certificate.
    /// - [`SigningError::SigningFailed`] otherwise.
    pub fn sign(
        &self,
        payload: &InvoicePayload,
        handle: DecryptedCertificate,
    ) -> Result<SignedDocument, SigningError> {
        let result = sign_with(payload, &handle);
        handle.release();
        result
    }
}

fn sign_with(
    payload: &InvoicePayload,
    handle: &DecryptedCertificate,
) -> Result<SignedDocument, SigningError> {
    payload.validate()?;

    let certificate = Certificate::from_der(handle.certificate_der())
        .map_err(|e| SigningError::SigningFailed(format!("Certificate parse error: {e}")))?;
    let certificate_key = certificate_verifying_key(&certificate.tbs_certificate.subject_public_key_info)
        .ok_or_else(|| {
            SigningError::UnsupportedKeyAlgorithm("certificate key is not EC secp256k1".into())
        })?;
    let key = signing_key(handle.private_key_der())?;
    if key.verifying_key() != &certificate_key {
        return Err(SigningError::UnsupportedKeyAlgorithm(
            "private key does not match certificate".into(),
        ));
    }

    let declaration =
        canonical_xml(payload).map_err(|e| SigningError::SigningFailed(e.to_string()))?;
    let reference_id = payload.reference_id();
    let digest_value = digest_base64(declaration.as_bytes());
    let signed_info = signed_info_xml(&reference_id, &digest_value)
        .map_err(|e| SigningError::SigningFailed(e.to_string()))?;

    let signature: Signature = key
        .try_sign(signed_info.as_bytes())
        .map_err(|e| SigningError::SigningFailed(format!("Failed to sign SignedInfo: {e}")))?;
    let signature_b64 = Base64::encode_string(signature.to_der().as_bytes());
    let certificate_b64 = Base64::encode_string(handle.certificate_der());

    let xml = request_document(
        &declaration,
        &signature_xml(&signed_info, &signature_b64, &certificate_b64),
    );
    debug!(
        company_id = %handle.company_id(),
        reference_id = %reference_id,
        "invoice signed"
    );

    Ok(SignedDocument {
        xml,
        reference_id,
        digest_value,
        certificate_version: handle.version(),
        signed_at: Utc::now(),
    })
}

fn digest_base64(bytes: &[u8]) -> String {
    Base64::encode_string(&Sha256::digest(bytes))
}

fn certificate_verifying_key(spki: &SubjectPublicKeyInfoOwned) -> Option<VerifyingKey> {
    let curve = spki
        .algorithm
        .parameters
        .as_ref()
        .and_then(|params| params.decode_as::<ObjectIdentifier>().ok());
    if spki.algorithm.oid != ID_EC_PUBLIC_KEY || curve != Some(SECP256K1) {
        return None;
    }
    VerifyingKey::from_sec1_bytes(spki.subject_public_key.raw_bytes()).ok()
}

fn signing_key(private_key_der: &[u8]) -> Result<SigningKey, SigningError> {
    let info = PrivateKeyInfo::try_from(private_key_der)
        .map_err(|e| SigningError::SigningFailed(format!("Private key parse error: {e}")))?;
    let curve = info.algorithm.parameters_oid().ok();
    if info.algorithm.oid != ID_EC_PUBLIC_KEY || curve != Some(SECP256K1) {
        return Err(SigningError::UnsupportedKeyAlgorithm(format!(
            "private key algorithm {} is not EC secp256k1",
            info.algorithm.oid
        )));
    }
    SigningKey::try_from(info)
        .map_err(|e| SigningError::SigningFailed(format!("Private key parse error: {e}")))
}

/// Check a signed document using only its own contents and the embedded certificate.
pub fn verify_signed_document(xml: &str) -> Result<VerifiedDocument, VerificationError> {
    verify(xml, None)
}

/// Like [`verify_signed_document`], additionally requiring the embedded certificate
/// to be `certificate_der`.
pub fn verify_signed_document_with(
    xml: &str,
    certificate_der: &[u8],
) -> Result<VerifiedDocument, VerificationError> {
    verify(xml, Some(certificate_der))
}

fn verify(xml: &str, expected_certificate: Option<&[u8]>) -> Result<VerifiedDocument, VerificationError> {
    let parts = SignatureParts::extract(xml)?;

    let signed_element = parts
        .signed_element
        .ok_or(VerificationError::MissingElement(SIGNED_ELEMENT))?;
    let element_id = parts
        .element_id
        .ok_or(VerificationError::MissingElement("Id attribute"))?;
    let signed_info = parts
        .signed_info
        .ok_or(VerificationError::MissingElement("SignedInfo"))?;
    let reference_uri = parts
        .reference_uri
        .ok_or(VerificationError::MissingElement("Reference URI"))?;
    let digest_value = parts
        .digest_value
        .ok_or(VerificationError::MissingElement("DigestValue"))?;
    let signature_value = parts
        .signature_value
        .ok_or(VerificationError::MissingElement("SignatureValue"))?;
    let certificate_b64 = parts
        .certificate
        .ok_or(VerificationError::MissingElement("X509Certificate"))?;

    if reference_uri.strip_prefix('#') != Some(element_id.as_str()) {
        return Err(VerificationError::ReferenceMismatch {
            expected: element_id,
            found: reference_uri,
        });
    }

    if digest_base64(signed_element.as_bytes()) != digest_value {
        return Err(VerificationError::DigestMismatch);
    }

    let certificate_der = Base64::decode_vec(&certificate_b64)
        .map_err(|e| VerificationError::Malformed(format!("X509Certificate: {e}")))?;
    if let Some(expected) = expected_certificate {
        if expected != certificate_der.as_slice() {
            return Err(VerificationError::CertificateMismatch);
        }
    }
    let certificate = Certificate::from_der(&certificate_der)
        .map_err(|e| VerificationError::Malformed(format!("X509Certificate: {e}")))?;
    let verifying_key =
        certificate_verifying_key(&certificate.tbs_certificate.subject_public_key_info)
            .ok_or(VerificationError::UnsupportedKeyAlgorithm)?;

    let signature_der = Base64::decode_vec(&signature_value)
        .map_err(|_| VerificationError::InvalidSignature)?;
    let signature =
        Signature::from_der(&signature_der).map_err(|_| VerificationError::InvalidSignature)?;
    verifying_key
        .verify(signed_info.as_bytes(), &signature)
        .map_err(|_| VerificationError::InvalidSignature)?;

    Ok(VerifiedDocument {
        reference_id: element_id,
        digest_value,
        certificate_der,
    })
}

/// Byte spans and values located in a signed document.
///
/// Values are read only at their place inside the single `Signature` element:
/// `Reference` and `DigestValue` under its `SignedInfo`, `SignatureValue` as its
/// child and `X509Certificate` under `KeyInfo/X509Data`. A second signed element,
/// `Signature`, `SignedInfo` or `Reference` makes the document malformed.
#[derive(Default)]
struct SignatureParts<'a> {
    signed_element: Option<&'a str>,
    element_id: Option<String>,
    signed_info: Option<&'a str>,
    reference_uri: Option<String>,
    digest_value: Option<String>,
    signature_value: Option<String>,
    certificate: Option<String>,
    seen: [usize; 4],
}

const SIGNED_INFO_PATH: &[&[u8]] = &[b"Signature", b"SignedInfo"];
const DIGEST_VALUE_PATH: &[&[u8]] = &[b"Signature", b"SignedInfo", b"Reference", b"DigestValue"];
const SIGNATURE_VALUE_PATH: &[&[u8]] = &[b"Signature", b"SignatureValue"];
const CERTIFICATE_PATH: &[&[u8]] = &[b"Signature", b"KeyInfo", b"X509Data", b"X509Certificate"];

impl<'a> SignatureParts<'a> {
    fn extract(xml: &'a str) -> Result<Self, VerificationError> {
        let mut reader = Reader::from_str(xml);
        let mut open: Vec<(Vec<u8>, usize)> = Vec::new();
        let mut parts = SignatureParts::default();

        loop {
            let start = position(&reader)?;
            match reader.read_event().map_err(malformed)? {
                Event::Start(element) => {
                    let name = element.local_name().as_ref().to_vec();
                    parts.count(&name)?;
                    match name.as_slice() {
                        b"InfDeclaracaoPrestacaoServico" => {
                            parts.element_id = attribute(&element, b"Id")?;
                        }
                        b"Reference" if ends_with(&open, SIGNED_INFO_PATH) => {
                            parts.reference_uri = attribute(&element, b"URI")?;
                        }
                        _ => {}
                    }
                    open.push((name, start));
                }
                Event::Empty(element) => {
                    let name = element.local_name().as_ref().to_vec();
                    parts.count(&name)?;
                    if name.as_slice() == b"Reference" && ends_with(&open, SIGNED_INFO_PATH) {
                        parts.reference_uri = attribute(&element, b"URI")?;
                    }
                }
                Event::End(element) => {
                    let (name, begin) = open
                        .pop()
                        .ok_or_else(|| VerificationError::Malformed("unbalanced end tag".into()))?;
                    if name.as_slice() != element.local_name().as_ref() {
                        return Err(VerificationError::Malformed("mismatched end tag".into()));
                    }
                    let end = position(&reader)?;
                    let span = xml
                        .get(begin..end)
                        .ok_or_else(|| VerificationError::Malformed("invalid span".into()))?;
                    match name.as_slice() {
                        b"InfDeclaracaoPrestacaoServico" => parts.signed_element = Some(span),
                        b"SignedInfo" if ends_with(&open, &SIGNED_INFO_PATH[..1]) => {
                            parts.signed_info = Some(span);
                        }
                        _ => {}
                    }
                }
                Event::Text(text) => {
                    let slot = if ends_with(&open, DIGEST_VALUE_PATH) {
                        &mut parts.digest_value
                    } else if ends_with(&open, SIGNATURE_VALUE_PATH) {
                        &mut parts.signature_value
                    } else if ends_with(&open, CERTIFICATE_PATH) {
                        &mut parts.certificate
                    } else {
                        continue;
                    };
                    if slot.is_some() {
                        return Err(VerificationError::Malformed("repeated signature value".into()));
                    }
                    let value = text.unescape().map_err(malformed)?;
                    *slot = Some(value.trim().to_string());
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !open.is_empty() {
            return Err(VerificationError::Malformed("unclosed element".into()));
        }
        Ok(parts)
    }

    fn count(&mut self, name: &[u8]) -> Result<(), VerificationError> {
        let (slot, label) = match name {
            b"InfDeclaracaoPrestacaoServico" => (0, SIGNED_ELEMENT),
            b"Signature" => (1, "Signature"),
            b"SignedInfo" => (2, "SignedInfo"),
            b"Reference" => (3, "Reference"),
            _ => return Ok(()),
        };
        self.seen[slot] += 1;
        if self.seen[slot] > 1 {
            return Err(VerificationError::Malformed(format!("more than one {label}")));
        }
        Ok(())
    }
}

/// Whether the innermost open elements are exactly `path`, outermost first.
fn ends_with(open: &[(Vec<u8>, usize)], path: &[&[u8]]) -> bool {
    open.len() >= path.len()
        && open[open.len() - path.len()..]
            .iter()
            .zip(path)
            .all(|((name, _), expected)| name.as_slice() == *expected)
}

fn position(reader: &Reader<&[u8]>) -> Result<usize, VerificationError> {
    usize::try_from(reader.buffer_position()).map_err(malformed)
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, VerificationError> {
    let Some(attribute) = element.try_get_attribute(name).map_err(malformed)? else {
        return Ok(None);
    };
    let value = attribute.unescape_value().map_err(malformed)?;
    Ok(Some(value.into_owned()))
}

fn malformed(error: impl std::fmt::Display) -> VerificationError {
    VerificationError::Malformed(error.to_string())
}
