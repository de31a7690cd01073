//! Certificate vault: sealed, versioned storage of signing certificates per company.
use crate::config::MasterKey;
use crate::invoice::CompanyId;
use crate::store::{CertificateStore, StoreError};
use aes_gcm::aead::{AeadCore, OsRng};
use aes_gcm::{AeadInPlace, Aes256Gcm, KeyInit, Nonce, Tag};
use chrono::{DateTime, Utc};
use pkcs8::{EncryptedPrivateKeyInfo, PrivateKeyInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_cert::Certificate;
use x509_cert::der::Decode;
use zeroize::{Zeroize, Zeroizing};

const CERTIFICATE_FIELD: &str = "certificate";
const PASSPHRASE_FIELD: &str = "passphrase";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("no certificate stored for company {0}")]
    NotFound(CompanyId),
    #[error("certificate for company {company_id} expired at {expired_at}")]
    Expired {
        company_id: CompanyId,
        expired_at: DateTime<Utc>,
    },
    #[error("certificate material could not be decrypted")]
    DecryptionFailed,
    #[error("invalid certificate container: {0}")]
    InvalidFormat(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateFormat {
    /// One X.509 `CERTIFICATE` block plus one PKCS#8 `PRIVATE KEY` or `ENCRYPTED PRIVATE KEY` block.
    PemBundle,
}

mod b64 {
    use base64ct::{Base64, Encoding};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub(super) fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&Base64::encode_string(value.as_ref()))
    }

    pub(super) fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = Base64::decode_vec(&encoded).map_err(de::Error::custom)?;
        T::try_from(bytes).map_err(|_| de::Error::custom("unexpected byte length"))
    }
}

/// AES-256-GCM ciphertext with its nonce and detached tag.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    #[serde(with = "b64")]
    ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    nonce: [u8; 12],
    #[serde(with = "b64")]
    tag: [u8; 16],
}

impl SealedBlob {
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn nonce(&self) -> &[u8; 12] {
        &self.nonce
    }

    pub fn tag(&self) -> &[u8; 16] {
        &self.tag
    }

    #[cfg(test)]
    pub(crate) fn tamper_ciphertext(&mut self) {
        if let Some(byte) = self.ciphertext.first_mut() {
            *byte ^= 0x01;
        }
    }

    #[cfg(test)]
    pub(crate) fn tamper_tag(&mut self) {
        self.tag[15] ^= 0x80;
    }

    #[cfg(test)]
    pub(crate) fn tamper_nonce(&mut self) {
        self.nonce[0] ^= 0x01;
    }
}

impl fmt::Debug for SealedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedBlob")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// One stored certificate version. Only sealed material is held here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    company_id: CompanyId,
    version: u32,
    format: CertificateFormat,
    key_id: String,
    certificate: SealedBlob,
    passphrase: SealedBlob,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl CertificateRecord {
    pub fn company_id(&self) -> &CompanyId {
        &self.company_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn format(&self) -> CertificateFormat {
        self.format
    }

    /// Fingerprint of the master key that sealed this record.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn certificate(&self) -> &SealedBlob {
        &self.certificate
    }

    pub fn passphrase(&self) -> &SealedBlob {
        &self.passphrase
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[cfg(test)]
    pub(crate) fn certificate_mut(&mut self) -> &mut SealedBlob {
        &mut self.certificate
    }

    #[cfg(test)]
    pub(crate) fn passphrase_mut(&mut self) -> &mut SealedBlob {
        &mut self.passphrase
    }
}

/// Plaintext certificate and private key, wiped when released or dropped.
pub struct DecryptedCertificate {
    company_id: CompanyId,
    version: u32,
    certificate_der: Zeroizing<Vec<u8>>,
    private_key_der: Zeroizing<Vec<u8>>,
}

impl DecryptedCertificate {
    pub fn company_id(&self) -> &CompanyId {
        &self.company_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// DER-encoded X.509 certificate.
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// DER-encoded, unencrypted PKCS#8 `PrivateKeyInfo`.
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    #[cfg(test)]
    pub(crate) fn from_der(company_id: CompanyId, certificate_der: &[u8], private_key_der: &[u8]) -> Self {
        Self {
            company_id,
            version: 1,
            certificate_der: Zeroizing::new(certificate_der.to_vec()),
            private_key_der: Zeroizing::new(private_key_der.to_vec()),
        }
    }

    /// Wipe the key material now instead of waiting for drop.
    pub fn release(mut self) {
        self.private_key_der.zeroize();
        self.certificate_der.zeroize();
    }
}

impl fmt::Debug for DecryptedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedCertificate")
            .field("company_id", &self.company_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

struct ParsedBundle {
    certificate_der: Zeroizing<Vec<u8>>,
    private_key_der: Zeroizing<Vec<u8>>,
    not_after: DateTime<Utc>,
}

/// Sealed certificate storage keyed by company.
pub struct CertificateVault {
    master_key: MasterKey,
    store: Arc<dyn CertificateStore>,
}

impl CertificateVault {
    pub fn new(master_key: MasterKey, store: Arc<dyn CertificateStore>) -> Self {
        Self { master_key, store }
    }

    /// Validate and seal a PEM bundle, appending it as the company's newest version.
    ///
    /// # Errors
    /// Returns [`CertificateError::InvalidFormat`] when the bundle lacks a parseable
    /// certificate or private key, or the passphrase does not unlock the key.
    pub async fn store(
        &self,
        company_id: &CompanyId,
        raw: &[u8],
        passphrase: &str,
    ) -> Result<CertificateRecord, CertificateError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| CertificateError::InvalidFormat("bundle is not PEM text".into()))?;
        let parsed = parse_bundle(text, passphrase)?;

        let version = self
            .store
            .latest(company_id)
            .await?
            .map_or(1, |latest| latest.version + 1);
        let record = CertificateRecord {
            company_id: company_id.clone(),
            version,
            format: CertificateFormat::PemBundle,
            key_id: self.master_key.key_id(),
            certificate: seal(
                &self.master_key,
                &associated_data(company_id, version, CERTIFICATE_FIELD),
                raw,
            )?,
            passphrase: seal(
                &self.master_key,
                &associated_data(company_id, version, PASSPHRASE_FIELD),
                passphrase.as_bytes(),
            )?,
            expires_at: parsed.not_after,
            created_at: Utc::now(),
        };
        self.store.append(record.clone()).await?;

        info!(
            company_id = %company_id,
            version,
            expires_at = %record.expires_at,
            "certificate stored"
        );
        Ok(record)
    }

    pub async fn retrieve_decrypted(
        &self,
        company_id: &CompanyId,
    ) -> Result<DecryptedCertificate, CertificateError> {
        self.retrieve_decrypted_at(company_id, Utc::now()).await
    }

    /// Decrypt the active certificate, checking expiry against `now`.
    ///
    /// # Errors
    /// [`CertificateError::NotFound`], then [`CertificateError::Expired`], then
    /// [`CertificateError::DecryptionFailed`] on a key mismatch or failed authentication.
    pub async fn retrieve_decrypted_at(
        &self,
        company_id: &CompanyId,
        now: DateTime<Utc>,
    ) -> Result<DecryptedCertificate, CertificateError> {
        let record = self
            .store
            .latest(company_id)
            .await?
            .ok_or_else(|| CertificateError::NotFound(company_id.clone()))?;

        if now > record.expires_at {
            warn!(company_id = %company_id, version = record.version, "certificate expired");
            return Err(CertificateError::Expired {
                company_id: company_id.clone(),
                expired_at: record.expires_at,
            });
        }

        let parsed = open_record(&self.master_key, &record).inspect_err(|_| {
            warn!(
                company_id = %company_id,
                version = record.version,
                "certificate decryption failed"
            );
        })?;
        debug!(company_id = %company_id, version = record.version, "certificate decrypted");

        Ok(DecryptedCertificate {
            company_id: record.company_id,
            version: record.version,
            certificate_der: parsed.certificate_der,
            private_key_der: parsed.private_key_der,
        })
    }

    /// Every stored version for the company, oldest first.
    pub async fn history(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<CertificateRecord>, CertificateError> {
        Ok(self.store.history(company_id).await?)
    }

    /// Re-encrypt a record under a new master key. Version and plaintext are unchanged.
    pub fn reseal(
        record: &CertificateRecord,
        old_key: &MasterKey,
        new_key: &MasterKey,
    ) -> Result<CertificateRecord, CertificateError> {
        if record.key_id != old_key.key_id() {
            return Err(CertificateError::DecryptionFailed);
        }
        let certificate_aad =
            associated_data(&record.company_id, record.version, CERTIFICATE_FIELD);
        let passphrase_aad =
            associated_data(&record.company_id, record.version, PASSPHRASE_FIELD);
        let bundle = open(old_key, &certificate_aad, &record.certificate)?;
        let passphrase = open(old_key, &passphrase_aad, &record.passphrase)?;

        Ok(CertificateRecord {
            key_id: new_key.key_id(),
            certificate: seal(new_key, &certificate_aad, &bundle)?,
            passphrase: seal(new_key, &passphrase_aad, &passphrase)?,
            ..record.clone()
        })
    }
}

fn associated_data(company_id: &CompanyId, version: u32, field: &str) -> Vec<u8> {
    format!("{company_id}|{version}|{field}").into_bytes()
}

fn cipher(key: &MasterKey) -> Result<Aes256Gcm, CertificateError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CertificateError::DecryptionFailed)
}

fn seal(key: &MasterKey, aad: &[u8], plaintext: &[u8]) -> Result<SealedBlob, CertificateError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut buffer = plaintext.to_vec();
    let tag = cipher(key)?
        .encrypt_in_place_detached(&nonce, aad, &mut buffer)
        .map_err(|_| CertificateError::InvalidFormat("sealing failed".into()))?;

    let mut nonce_bytes = [0u8; 12];
    nonce_bytes.copy_from_slice(nonce.as_slice());
    let mut tag_bytes = [0u8; 16];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok(SealedBlob {
        ciphertext: buffer,
        nonce: nonce_bytes,
        tag: tag_bytes,
    })
}

fn open(key: &MasterKey, aad: &[u8], blob: &SealedBlob) -> Result<Zeroizing<Vec<u8>>, CertificateError> {
    let mut buffer = Zeroizing::new(blob.ciphertext.clone());
    cipher(key)?
        .decrypt_in_place_detached(
            Nonce::from_slice(&blob.nonce),
            aad,
            buffer.as_mut_slice(),
            Tag::from_slice(&blob.tag),
        )
        .map_err(|_| CertificateError::DecryptionFailed)?;
    Ok(buffer)
}

fn open_record(key: &MasterKey, record: &CertificateRecord) -> Result<ParsedBundle, CertificateError> {
    if record.key_id != key.key_id() {
        return Err(CertificateError::DecryptionFailed);
    }
    let bundle = open(
        key,
        &associated_data(&record.company_id, record.version, CERTIFICATE_FIELD),
        &record.certificate,
    )?;
    let passphrase = open(
        key,
        &associated_data(&record.company_id, record.version, PASSPHRASE_FIELD),
        &record.passphrase,
    )?;
    let bundle = std::str::from_utf8(&bundle).map_err(|_| CertificateError::DecryptionFailed)?;
    let passphrase =
        std::str::from_utf8(&passphrase).map_err(|_| CertificateError::DecryptionFailed)?;
    parse_bundle(bundle, passphrase).map_err(|_| CertificateError::DecryptionFailed)
}

fn pem_blocks(text: &str) -> Vec<Zeroizing<String>> {
    let mut blocks = Vec::new();
    let mut current: Option<Zeroizing<String>> = None;
    for line in text.lines().map(str::trim) {
        if line.starts_with("-----BEGIN ") {
            current = Some(Zeroizing::new(String::new()));
        }
        if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
        }
        if line.starts_with("-----END ") {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
        }
    }
    blocks
}

fn parse_bundle(text: &str, passphrase: &str) -> Result<ParsedBundle, CertificateError> {
    let mut certificate = None;
    let mut private_key = None;

    for block in pem_blocks(text) {
        let (label, der) = x509_cert::der::pem::decode_vec(block.as_bytes())
            .map_err(|e| CertificateError::InvalidFormat(format!("malformed PEM block: {e}")))?;
        let der = Zeroizing::new(der);
        match label {
            "CERTIFICATE" if certificate.is_none() => {
                let cert = Certificate::from_der(&der).map_err(|e| {
                    CertificateError::InvalidFormat(format!("certificate parse error: {e}"))
                })?;
                certificate = Some((cert, der));
            }
            "PRIVATE KEY" if private_key.is_none() => {
                PrivateKeyInfo::try_from(der.as_slice()).map_err(|e| {
                    CertificateError::InvalidFormat(format!("private key parse error: {e}"))
                })?;
                private_key = Some(der);
            }
            "ENCRYPTED PRIVATE KEY" if private_key.is_none() => {
                let encrypted = EncryptedPrivateKeyInfo::try_from(der.as_slice()).map_err(|e| {
                    CertificateError::InvalidFormat(format!("encrypted key parse error: {e}"))
                })?;
                let document = encrypted.decrypt(passphrase).map_err(|_| {
                    CertificateError::InvalidFormat("passphrase does not unlock private key".into())
                })?;
                PrivateKeyInfo::try_from(document.as_bytes()).map_err(|e| {
                    CertificateError::InvalidFormat(format!("private key parse error: {e}"))
                })?;
                private_key = Some(Zeroizing::new(document.as_bytes().to_vec()));
            }
            _ => {}
        }
    }

    let (certificate, certificate_der) = certificate
        .ok_or_else(|| CertificateError::InvalidFormat("missing CERTIFICATE block".into()))?;
    let private_key_der = private_key
        .ok_or_else(|| CertificateError::InvalidFormat("missing PRIVATE KEY block".into()))?;

    let not_after = certificate
        .tbs_certificate
        .validity
        .not_after
        .to_unix_duration();
    let not_after = i64::try_from(not_after.as_secs())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| CertificateError::InvalidFormat("certificate notAfter out of range".into()))?;

    Ok(ParsedBundle {
        certificate_der,
        private_key_der,
        not_after,
    })
}
