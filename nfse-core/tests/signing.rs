mod common;

use base64ct::{Base64, Encoding};
use nfse_core::config::MasterKey;
use nfse_core::invoice::CompanyId;
use nfse_core::invoice::sign::{
    SignatureEngine, SigningError, VerificationError, verify_signed_document,
    verify_signed_document_with,
};
use nfse_core::invoice::xml::canonical_xml;
use nfse_core::store::MemoryStore;
use nfse_core::vault::CertificateVault;
use sha2::{Digest, Sha256};
use std::sync::Arc;

async fn vault_with_certificate(company: &CompanyId) -> CertificateVault {
    let vault = CertificateVault::new(MasterKey::from_bytes([8; 32]), Arc::new(MemoryStore::new()));
    let key = common::signing_key();
    vault
        .store(company, common::bundle(&key).as_bytes(), "")
        .await
        .expect("store certificate");
    vault
}

#[tokio::test]
async fn vault_handle_signs_verifiable_document() {
    let company = CompanyId::new("acme");
    let vault = vault_with_certificate(&company).await;
    let payload = common::sample_payload();

    let handle = vault.retrieve_decrypted(&company).await.expect("retrieve");
    let certificate_der = handle.certificate_der().to_vec();
    let signed = SignatureEngine::new()
        .sign(&payload, handle)
        .expect("sign");

    assert_eq!(signed.reference_id(), "rps123A");
    assert_eq!(signed.certificate_version(), 1);
    assert!(signed.xml().starts_with("<GerarNfseEnvio"));

    let canonical = canonical_xml(&payload).expect("canonical");
    assert!(signed.xml().contains(&canonical));
    let digest = Base64::encode_string(&Sha256::digest(canonical.as_bytes()));
    assert_eq!(signed.digest_value(), digest);

    let verified = verify_signed_document(signed.xml()).expect("verify");
    assert_eq!(verified.reference_id(), "rps123A");
    assert_eq!(verified.digest_value(), digest);
    assert_eq!(verified.certificate_der(), certificate_der.as_slice());

    verify_signed_document_with(signed.xml(), &certificate_der).expect("pinned verify");
}

#[tokio::test]
async fn mutating_signed_fields_breaks_verification() {
    let company = CompanyId::new("acme");
    let vault = vault_with_certificate(&company).await;
    let handle = vault.retrieve_decrypted(&company).await.expect("retrieve");
    let signed = SignatureEngine::new()
        .sign(&common::sample_payload(), handle)
        .expect("sign");
    let xml = signed.xml();

    for (from, to) in [
        ("<ValorServicos>1500.00<", "<ValorServicos>1501.00<"),
        ("<Cnpj>11222333000181<", "<Cnpj>11222333000182<"),
        ("Cliente Exemplo Ltda", "Cliente Exemplo S.A."),
    ] {
        assert!(xml.contains(from), "fixture lacks {from}");
        let tampered = xml.replacen(from, to, 1);
        assert_eq!(
            verify_signed_document(&tampered).unwrap_err(),
            VerificationError::DigestMismatch,
            "{from}"
        );
    }
}

#[tokio::test]
async fn pinned_certificate_must_match_embedded_one() {
    let company = CompanyId::new("acme");
    let vault = vault_with_certificate(&company).await;
    let handle = vault.retrieve_decrypted(&company).await.expect("retrieve");
    let signed = SignatureEngine::new()
        .sign(&common::sample_payload(), handle)
        .expect("sign");

    let other = common::signing_key();
    let other_pem = common::certificate_pem(&other, std::time::Duration::from_secs(60));
    let (_, other_der) = x509_cert::der::pem::decode_vec(other_pem.as_bytes()).expect("pem");

    assert_eq!(
        verify_signed_document_with(signed.xml(), &other_der).unwrap_err(),
        VerificationError::CertificateMismatch
    );
}

#[tokio::test]
async fn incomplete_payload_is_a_schema_error() {
    let company = CompanyId::new("acme");
    let vault = vault_with_certificate(&company).await;
    let mut payload = common::sample_payload();
    payload.servico.discriminacao = "   ".into();
    payload.prestador.cnpj.clear();

    let handle = vault.retrieve_decrypted(&company).await.expect("retrieve");
    match SignatureEngine::new().sign(&payload, handle) {
        Err(SigningError::SchemaValidation(error)) => assert_eq!(error.issues.len(), 2),
        other => panic!("expected schema validation error, got {other:?}"),
    }
}
