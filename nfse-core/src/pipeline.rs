//! End-to-end flow: create, sign, resolve, submit and reconcile one invoice.
use crate::api::{
    HttpTransport, RetryPolicy, SubmissionClient, SubmissionError, SubmissionOutcome,
};
use crate::config::Config;
use crate::endpoint::{EndpointError, EndpointResolver, HttpProbe};
use crate::invoice::sign::{SignatureEngine, SignedDocument, SigningError};
use crate::invoice::{CompanyId, FailureCause, FailureKind, Invoice, InvoiceId, InvoicePayload};
use crate::locks::KeyedLocks;
use crate::reconcile::{ReconciliationError, StatusReconciler};
use crate::store::{InvoiceStore, MemoryStore, StoreError};
use crate::vault::{CertificateError, CertificateVault};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// The failure recorded on the invoice for errors raised before submission.
    fn failure_cause(&self) -> Option<FailureCause> {
        let kind = match self {
            Self::Certificate(_) => FailureKind::Certificate,
            Self::Signing(_) => FailureKind::Signature,
            Self::Endpoint(_) => FailureKind::Endpoint,
            _ => return None,
        };
        Some(FailureCause::new(kind, self.to_string()))
    }
}

/// The invoice after its outcome was applied, and the outcome itself.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReport {
    pub invoice: Invoice,
    pub outcome: SubmissionOutcome,
}

pub struct Pipeline {
    config: Arc<Config>,
    vault: Arc<CertificateVault>,
    engine: SignatureEngine,
    resolver: Arc<EndpointResolver>,
    client: Arc<SubmissionClient>,
    reconciler: Arc<StatusReconciler>,
    invoices: Arc<dyn InvoiceStore>,
    companies: KeyedLocks<CompanyId>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        vault: Arc<CertificateVault>,
        engine: SignatureEngine,
        resolver: Arc<EndpointResolver>,
        client: Arc<SubmissionClient>,
        reconciler: Arc<StatusReconciler>,
        invoices: Arc<dyn InvoiceStore>,
    ) -> Self {
        Self {
            config,
            vault,
            engine,
            resolver,
            client,
            reconciler,
            invoices,
            companies: KeyedLocks::new(),
        }
    }

    /// Wire a pipeline over HTTP and a fresh [`MemoryStore`] backing every contract.
    pub fn with_memory_store(config: Arc<Config>) -> Result<(Self, Arc<MemoryStore>), PipelineError> {
        let store = Arc::new(MemoryStore::new());
        let resolver = EndpointResolver::new(
            Arc::new(HttpProbe::new()?),
            config.probe_timeout(),
            config.probe_ceiling(),
        );
        let client = SubmissionClient::new(
            Arc::new(HttpTransport::new()?),
            store.clone(),
            RetryPolicy::from_config(&config),
        );
        let pipeline = Self::new(
            Arc::clone(&config),
            Arc::new(CertificateVault::new(config.master_key().clone(), store.clone())),
            SignatureEngine::new(),
            Arc::new(resolver),
            Arc::new(client),
            Arc::new(StatusReconciler::new(store.clone(), store.clone())),
            store.clone(),
        );
        Ok((pipeline, store))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vault(&self) -> &CertificateVault {
        &self.vault
    }

    pub fn reconciler(&self) -> &StatusReconciler {
        &self.reconciler
    }

    /// Create a pending invoice and run it through the pipeline.
    ///
    /// # Errors
    /// Certificate, signing and endpoint errors mark the invoice failed before
    /// being returned. An external reference already in use is a store conflict.
    pub async fn submit_invoice(
        &self,
        company_id: &CompanyId,
        external_reference: Option<String>,
        payload: InvoicePayload,
    ) -> Result<SubmissionReport, PipelineError> {
        let invoice = Invoice::new(company_id.clone(), external_reference, payload);
        let invoice_id = invoice.id();
        self.invoices.insert(invoice).await?;
        info!(company_id = %company_id, invoice_id = %invoice_id, "invoice created");

        self.run(invoice_id).await
    }

    /// Move a failed invoice back to pending and submit it again.
    /// Attempt sequence numbers continue from the earlier runs.
    pub async fn resubmit(&self, invoice_id: InvoiceId) -> Result<SubmissionReport, PipelineError> {
        self.reconciler.request_retry(invoice_id).await?;
        info!(invoice_id = %invoice_id, "invoice resubmitted");
        self.run(invoice_id).await
    }

    async fn run(&self, invoice_id: InvoiceId) -> Result<SubmissionReport, PipelineError> {
        let invoice = self
            .invoices
            .get(invoice_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("invoice {invoice_id}")))?;
        let company_id = invoice.company_id().clone();

        let signed = match self.sign(&company_id, &invoice).await {
            Ok(signed) => signed,
            Err(error) => return Err(self.fail(invoice_id, error).await),
        };
        self.reconciler
            .attach_signed_document(invoice_id, signed.xml().to_string())
            .await?;
        info!(company_id = %company_id, invoice_id = %invoice_id, "invoice signed");

        let hosts = self.config.active_hosts();
        let endpoint = match self.resolver.resolve(self.config.env(), hosts).await {
            Ok(endpoint) => endpoint,
            Err(error) => return Err(self.fail(invoice_id, error.into()).await),
        };

        let outcome = self
            .client
            .submit(invoice_id, &signed, &endpoint, hosts, &self.resolver)
            .await?;
        let invoice = self.reconciler.apply_submission(invoice_id, &outcome).await?;
        info!(
            company_id = %company_id,
            invoice_id = %invoice_id,
            status = %invoice.status(),
            reconcile = outcome.requires_reconciliation(),
            "submission finished"
        );
        Ok(SubmissionReport { invoice, outcome })
    }

    /// Retrieve, sign and release under the company lock.
    async fn sign(
        &self,
        company_id: &CompanyId,
        invoice: &Invoice,
    ) -> Result<SignedDocument, PipelineError> {
        let _guard = self.companies.lock(company_id.clone()).await;
        let handle = self.vault.retrieve_decrypted(company_id).await?;
        Ok(self.engine.sign(invoice.payload(), handle)?)
    }

    async fn fail(&self, invoice_id: InvoiceId, error: PipelineError) -> PipelineError {
        if let Some(cause) = error.failure_cause() {
            if let Err(mark_error) = self.reconciler.mark_failed(invoice_id, cause).await {
                warn!(invoice_id = %invoice_id, error = %mark_error, "could not mark invoice failed");
            }
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvironmentType, MasterKey, ServiceHost, ServiceHosts};
    use crate::endpoint::{Probe, ProbeError};
    use crate::invoice::InvoiceStatus;
    use crate::invoice::tests::sample_payload;
    use crate::vault::tests::bundle;
    use crate::store::CertificateStore;
    use crate::vault::CertificateRecord;
    use async_trait::async_trait;
    use k256::ecdsa::SigningKey;
    use parking_lot::Mutex;
    use rand::rngs::OsRng;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Down;

    #[async_trait]
    impl Probe for Down {
        async fn probe(&self, _host: &ServiceHost) -> Result<(), ProbeError> {
            Err(ProbeError("down".into()))
        }
    }

    fn offline_pipeline() -> (Pipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = offline_pipeline_over(&store, store.clone(), store.clone());
        (pipeline, store)
    }

    /// A pipeline whose hosts are all down, with swappable certificate and invoice stores.
    fn offline_pipeline_over(
        store: &Arc<MemoryStore>,
        certificates: Arc<dyn CertificateStore>,
        invoices: Arc<dyn InvoiceStore>,
    ) -> Pipeline {
        let hosts = ServiceHosts::new(
            vec![ServiceHost::parse("https://h1.example.gov.br/nfse").unwrap()],
            Vec::new(),
        );
        let config = Arc::new(Config::new(
            EnvironmentType::Homologation,
            hosts,
            MasterKey::from_bytes([9; 32]),
        ));
        let resolver = EndpointResolver::new(
            Arc::new(Down),
            Duration::from_millis(50),
            Duration::from_millis(200),
        );
        let client = SubmissionClient::new(
            Arc::new(HttpTransport::new().unwrap()),
            store.clone(),
            RetryPolicy::from_config(&config),
        );
        Pipeline::new(
            Arc::clone(&config),
            Arc::new(CertificateVault::new(config.master_key().clone(), certificates)),
            SignatureEngine::new(),
            Arc::new(resolver),
            Arc::new(client),
            Arc::new(StatusReconciler::new(invoices.clone(), store.clone())),
            invoices,
        )
    }

    /// Yields to the scheduler before every lookup and insert.
    struct YieldingInvoices(Arc<MemoryStore>);

    #[async_trait]
    impl InvoiceStore for YieldingInvoices {
        async fn insert(&self, invoice: Invoice) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.insert(invoice).await
        }

        async fn get(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
            self.0.get(id).await
        }

        async fn find_by_protocol(&self, protocol_number: &str) -> Result<Option<Invoice>, StoreError> {
            self.0.find_by_protocol(protocol_number).await
        }

        async fn find_by_reference(
            &self,
            external_reference: &str,
        ) -> Result<Option<Invoice>, StoreError> {
            tokio::task::yield_now().await;
            self.0.find_by_reference(external_reference).await
        }

        async fn update(&self, invoice: &Invoice) -> Result<(), StoreError> {
            self.0.update(invoice).await
        }
    }

    /// Tracks how many `latest` reads are in flight, per company and overall.
    #[derive(Default)]
    struct Occupancy {
        current: HashMap<CompanyId, usize>,
        peak: HashMap<CompanyId, usize>,
        total: usize,
        peak_total: usize,
    }

    struct SlowCertificates {
        inner: Arc<MemoryStore>,
        occupancy: Mutex<Occupancy>,
    }

    #[async_trait]
    impl CertificateStore for SlowCertificates {
        async fn append(&self, record: CertificateRecord) -> Result<(), StoreError> {
            CertificateStore::append(&*self.inner, record).await
        }

        async fn latest(&self, company_id: &CompanyId) -> Result<Option<CertificateRecord>, StoreError> {
            {
                let mut occupancy = self.occupancy.lock();
                let current = occupancy.current.entry(company_id.clone()).or_default();
                *current += 1;
                let current = *current;
                let peak = occupancy.peak.entry(company_id.clone()).or_default();
                *peak = (*peak).max(current);
                occupancy.total += 1;
                occupancy.peak_total = occupancy.peak_total.max(occupancy.total);
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
            let record = self.inner.latest(company_id).await;
            {
                let mut occupancy = self.occupancy.lock();
                if let Some(current) = occupancy.current.get_mut(company_id) {
                    *current -= 1;
                }
                occupancy.total -= 1;
            }
            record
        }

        async fn history(&self, company_id: &CompanyId) -> Result<Vec<CertificateRecord>, StoreError> {
            self.inner.history(company_id).await
        }
    }

    #[tokio::test]
    async fn missing_certificate_marks_invoice_failed() {
        let (pipeline, store) = offline_pipeline();
        let company = CompanyId::new("acme");

        let err = pipeline
            .submit_invoice(&company, Some("INV-9".into()), sample_payload())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Certificate(CertificateError::NotFound(_))));

        let invoice = store.find_by_reference("INV-9").await.unwrap().unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Failed);
        assert_eq!(
            invoice.last_error().map(FailureCause::kind),
            Some(FailureKind::Certificate)
        );
        assert!(!invoice.last_error().unwrap().requires_reconciliation());
    }

    #[tokio::test]
    async fn unreachable_hosts_fail_after_signing() {
        let (pipeline, store) = offline_pipeline();
        let company = CompanyId::new("acme");
        let key = SigningKey::random(&mut OsRng);
        pipeline
            .vault()
            .store(&company, bundle(&key, &key).as_bytes(), "")
            .await
            .unwrap();

        let err = pipeline
            .submit_invoice(&company, None, sample_payload())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Endpoint(_)));

        let invoice = store.find_by_reference("123-A").await.unwrap().unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Failed);
        assert!(invoice.signed_document().is_some());
        assert_eq!(
            invoice.last_error().map(FailureCause::kind),
            Some(FailureKind::Endpoint)
        );
    }

    #[tokio::test]
    async fn external_reference_must_be_unique() {
        let (pipeline, _store) = offline_pipeline();
        let company = CompanyId::new("acme");
        let _ = pipeline
            .submit_invoice(&company, Some("INV-1".into()), sample_payload())
            .await;

        let err = pipeline
            .submit_invoice(&company, Some("INV-1".into()), sample_payload())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn concurrent_submissions_cannot_share_a_reference() {
        let store = Arc::new(MemoryStore::new());
        let invoices = Arc::new(YieldingInvoices(store.clone()));
        let pipeline = offline_pipeline_over(&store, store.clone(), invoices);
        let company = CompanyId::new("acme");

        let (first, second) = tokio::join!(
            pipeline.submit_invoice(&company, Some("INV-1".into()), sample_payload()),
            pipeline.submit_invoice(&company, Some("INV-1".into()), sample_payload()),
        );
        let conflicts = [&first, &second]
            .iter()
            .filter(|result| matches!(result, Err(PipelineError::Store(StoreError::Conflict(_)))))
            .count();
        assert_eq!(conflicts, 1);
        assert!(
            [&first, &second]
                .iter()
                .any(|result| matches!(result, Err(PipelineError::Certificate(CertificateError::NotFound(_)))))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn signing_is_serialized_per_company_only() {
        let store = Arc::new(MemoryStore::new());
        let certificates = Arc::new(SlowCertificates {
            inner: store.clone(),
            occupancy: Mutex::new(Occupancy::default()),
        });
        let pipeline = Arc::new(offline_pipeline_over(&store, certificates.clone(), store.clone()));
        let acme = CompanyId::new("acme");
        let beta = CompanyId::new("beta");
        for company in [&acme, &beta] {
            let key = SigningKey::random(&mut OsRng);
            pipeline
                .vault()
                .store(company, bundle(&key, &key).as_bytes(), "")
                .await
                .unwrap();
        }
        *certificates.occupancy.lock() = Occupancy::default();

        let mut tasks = Vec::new();
        for (n, company) in [&acme, &acme, &acme, &beta, &beta, &beta].into_iter().enumerate() {
            let pipeline = Arc::clone(&pipeline);
            let company = company.clone();
            tasks.push(tokio::spawn(async move {
                pipeline
                    .submit_invoice(&company, Some(format!("RPS-{n}")), sample_payload())
                    .await
            }));
        }
        for task in tasks {
            let result = task.await.unwrap();
            assert!(matches!(result, Err(PipelineError::Endpoint(_))));
        }

        let occupancy = certificates.occupancy.lock();
        assert_eq!(occupancy.peak.get(&acme), Some(&1));
        assert_eq!(occupancy.peak.get(&beta), Some(&1));
        assert!(occupancy.peak_total > 1);
    }
}
