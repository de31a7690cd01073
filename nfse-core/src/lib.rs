//! Rust toolkit for NFS-e submission: sealed certificates, XML signing, endpoint
//! failover, SOAP submission and webhook reconciliation.
//!
//! # Examples
//! ```rust
//! use nfse_core::config::{Config, EnvironmentType, MasterKey, ServiceHost, ServiceHosts};
//!
//! let hosts = ServiceHosts::new(
//!     vec![ServiceHost::parse("https://homologacao.example.gov.br/nfse")?],
//!     Vec::new(),
//! );
//! let config = Config::new(EnvironmentType::Homologation, hosts, MasterKey::from_bytes([1; 32]));
//! assert_eq!(config.active_hosts().len(), 1);
//! # Ok::<(), nfse_core::Error>(())
//! ```
pub mod api;
pub mod config;
pub mod endpoint;
pub mod invoice;
pub mod locks;
pub mod logging;
pub mod pipeline;
pub mod reconcile;
pub mod store;
pub mod vault;

use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Validation(#[from] invoice::ValidationError),
    #[error(transparent)]
    Transition(#[from] invoice::TransitionError),
    #[error(transparent)]
    Xml(#[from] invoice::xml::InvoiceXmlError),
    #[error(transparent)]
    Certificate(#[from] vault::CertificateError),
    #[error(transparent)]
    Signing(#[from] invoice::sign::SigningError),
    #[error(transparent)]
    Verification(#[from] invoice::sign::VerificationError),
    #[error(transparent)]
    Endpoint(#[from] endpoint::EndpointError),
    #[error(transparent)]
    Submission(#[from] api::SubmissionError),
    #[error(transparent)]
    Reconciliation(#[from] reconcile::ReconciliationError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Pipeline(#[from] pipeline::PipelineError),
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::api::SubmissionError;
    use crate::config::{ConfigError, EnvironmentType};
    use crate::endpoint::EndpointError;
    use crate::invoice::sign::{SigningError, VerificationError};
    use crate::invoice::xml::InvoiceXmlError;
    use crate::invoice::{
        CompanyId, InvoiceField, InvoiceStatus, StatusEvent, TransitionError, ValidationError,
        ValidationIssue, ValidationKind,
    };
    use crate::pipeline::PipelineError;
    use crate::reconcile::ReconciliationError;
    use crate::store::StoreError;
    use crate::vault::CertificateError;
    use quick_xml::se::SeError;

    #[test]
    fn error_conversions_cover_variants() {
        let err: Error = ConfigError::InvalidMasterKey("short".into()).into();
        assert!(matches!(err, Error::Config(_)));

        let validation = ValidationError::new(vec![ValidationIssue {
            field: InvoiceField::RpsNumber,
            kind: ValidationKind::Missing,
        }]);
        let err: Error = validation.into();
        assert!(matches!(err, Error::Validation(_)));

        let err: Error = TransitionError::NotAllowed {
            from: InvoiceStatus::Canceled,
            event: StatusEvent::AuthorityIssued,
        }
        .into();
        assert!(matches!(err, Error::Transition(_)));

        let xml_err = InvoiceXmlError::Serialize {
            source: SeError::Custom("xml".into()),
        };
        let err: Error = xml_err.into();
        assert!(matches!(err, Error::Xml(_)));

        let err: Error = CertificateError::NotFound(CompanyId::new("acme")).into();
        assert!(matches!(err, Error::Certificate(_)));

        let err: Error = SigningError::SigningFailed("sign".into()).into();
        assert!(matches!(err, Error::Signing(_)));

        let err: Error = VerificationError::DigestMismatch.into();
        assert!(matches!(err, Error::Verification(_)));

        let err: Error = EndpointError::NoEndpointAvailable {
            environment: EnvironmentType::Production,
            tried: Vec::new(),
        }
        .into();
        assert!(matches!(err, Error::Endpoint(_)));

        let err: Error = SubmissionError::Timeout.into();
        assert!(matches!(err, Error::Submission(_)));

        let err: Error = ReconciliationError::InvalidPayload("json".into()).into();
        assert!(matches!(err, Error::Reconciliation(_)));

        let err: Error = StoreError::Backend("down".into()).into();
        assert!(matches!(err, Error::Store(_)));

        let err: Error = PipelineError::Store(StoreError::Conflict("ref".into())).into();
        assert!(matches!(err, Error::Pipeline(_)));
    }
}
