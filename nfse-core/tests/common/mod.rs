use async_trait::async_trait;
use httpmock::MockServer;
use k256::ecdsa::SigningKey;
use k256::pkcs8::EncodePrivateKey;
use nfse_core::config::{Config, EnvironmentType, MasterKey, ServiceHost, ServiceHosts};
use nfse_core::endpoint::{EndpointResolver, Probe, ProbeError};
use nfse_core::invoice::sign::{SignatureEngine, SignedDocument};
use nfse_core::invoice::{CompanyId, InvoicePayload};
use nfse_core::store::MemoryStore;
use nfse_core::vault::CertificateVault;
use pkcs8::LineEnding;
use pkcs8::PrivateKeyInfo;
use pkcs8::pkcs5::pbes2;
use rand::rngs::OsRng;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::EncodePem;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

#[allow(dead_code)]
pub fn sample_payload() -> InvoicePayload {
    serde_json::from_str(include_str!("../fixtures/invoice.json")).expect("invoice fixture")
}

#[allow(dead_code)]
pub fn signing_key() -> SigningKey {
    SigningKey::random(&mut OsRng)
}

#[allow(dead_code)]
pub fn certificate_pem(key: &SigningKey, lifetime: Duration) -> String {
    let validity = Validity::from_now(lifetime).expect("validity");
    let subject = Name::from_str("CN=Prestador Teste,O=NFSe,C=BR").expect("subject");
    let spki = SubjectPublicKeyInfoOwned::from_key(*key.verifying_key()).expect("spki");
    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(42u32),
        validity,
        subject,
        spki,
        key,
    )
    .expect("builder");
    builder
        .build::<k256::ecdsa::DerSignature>()
        .expect("certificate")
        .to_pem(LineEnding::LF)
        .expect("certificate pem")
}

/// Certificate plus the unencrypted PKCS#8 key, valid for one hour.
#[allow(dead_code)]
pub fn bundle(key: &SigningKey) -> String {
    let key_pem = key.to_pkcs8_pem(LineEnding::LF).expect("key pem");
    format!(
        "{}{}",
        certificate_pem(key, Duration::from_secs(3600)),
        key_pem.as_str()
    )
}

/// Certificate plus a PBES2 (PBKDF2-SHA256, AES-256-CBC) encrypted key.
#[allow(dead_code)]
pub fn encrypted_bundle(key: &SigningKey, passphrase: &str) -> String {
    let key_der = key.to_pkcs8_der().expect("key der");
    let info = PrivateKeyInfo::try_from(key_der.as_bytes()).expect("key info");
    let salt = [7u8; 16];
    let iv = [9u8; 16];
    let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(1_000, &salt, &iv).expect("pbes2");
    let encrypted = info
        .encrypt_with_params(params, passphrase)
        .expect("encrypt key");
    let key_pem = encrypted
        .to_pem("ENCRYPTED PRIVATE KEY", LineEnding::LF)
        .expect("encrypted pem");
    format!(
        "{}{}",
        certificate_pem(key, Duration::from_secs(3600)),
        key_pem.as_str()
    )
}

/// Sign the fixture payload with a throwaway certificate.
#[allow(dead_code)]
pub async fn signed_document() -> SignedDocument {
    let company = CompanyId::new("fixture");
    let vault = CertificateVault::new(MasterKey::from_bytes([1; 32]), Arc::new(MemoryStore::new()));
    let key = signing_key();
    vault
        .store(&company, bundle(&key).as_bytes(), "")
        .await
        .expect("store certificate");
    let handle = vault.retrieve_decrypted(&company).await.expect("retrieve");
    SignatureEngine::new()
        .sign(&sample_payload(), handle)
        .expect("sign")
}

#[allow(dead_code)]
pub fn host(name: &str) -> ServiceHost {
    ServiceHost::parse(format!("https://{name}.example.gov.br/nfse")).expect("host")
}

#[allow(dead_code)]
pub fn config(hosts: Vec<ServiceHost>) -> Config {
    Config::new(
        EnvironmentType::Homologation,
        ServiceHosts::new(hosts, Vec::new()),
        MasterKey::from_bytes([42; 32]),
    )
    .with_probe_timeout(Duration::from_millis(500))
    .with_probe_ceiling(Duration::from_secs(2))
    .with_attempt_timeout(Duration::from_secs(2))
    .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
}

/// Probe that reports a fixed set of hosts as live.
#[allow(dead_code)]
pub struct StaticProbe {
    live: Vec<String>,
}

#[async_trait]
impl Probe for StaticProbe {
    async fn probe(&self, host: &ServiceHost) -> Result<(), ProbeError> {
        if self.live.iter().any(|live| live == host.as_str()) {
            Ok(())
        } else {
            Err(ProbeError("connection refused".into()))
        }
    }
}

#[allow(dead_code)]
pub fn resolver_with_live(live: &[&ServiceHost]) -> EndpointResolver {
    let probe = StaticProbe {
        live: live.iter().map(|host| host.as_str().to_string()).collect(),
    };
    EndpointResolver::new(
        Arc::new(probe),
        Duration::from_millis(200),
        Duration::from_secs(1),
    )
}

#[allow(dead_code)]
pub fn try_start_server() -> Option<MockServer> {
    std::panic::catch_unwind(MockServer::start).ok()
}

#[allow(dead_code)]
pub fn protocol_response(protocol: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><GerarNfseResposta xmlns="http://www.abrasf.org.br/nfse.xsd"><Protocolo>{protocol}</Protocolo></GerarNfseResposta></soap:Body></soap:Envelope>"#
    )
}
