//! Storage contracts consumed by the pipeline, plus an in-memory implementation.
use crate::invoice::{AttemptOutcome, CompanyId, Invoice, InvoiceId, SubmissionAttempt};
use crate::reconcile::{WebhookLogEntry, WebhookOutcome};
use crate::vault::CertificateRecord;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Versioned, append-only certificate records. Only sealed material crosses this boundary.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Append a record. Its version must be exactly one above the latest stored version.
    async fn append(&self, record: CertificateRecord) -> Result<(), StoreError>;
    async fn latest(&self, company_id: &CompanyId) -> Result<Option<CertificateRecord>, StoreError>;
    /// All versions, oldest first.
    async fn history(&self, company_id: &CompanyId) -> Result<Vec<CertificateRecord>, StoreError>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Store a new invoice. Fails with [`StoreError::Conflict`] when its id or its
    /// external reference is already taken; the check and the write are one step.
    async fn insert(&self, invoice: Invoice) -> Result<(), StoreError>;
    async fn get(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError>;
    async fn find_by_protocol(&self, protocol_number: &str) -> Result<Option<Invoice>, StoreError>;
    async fn find_by_reference(&self, external_reference: &str)
    -> Result<Option<Invoice>, StoreError>;
    async fn update(&self, invoice: &Invoice) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AttemptLog: Send + Sync {
    async fn record(&self, attempt: SubmissionAttempt) -> Result<(), StoreError>;
    async fn count_for(&self, invoice_id: InvoiceId) -> Result<u32, StoreError>;
    async fn query(&self, query: &AttemptQuery) -> Result<Page<SubmissionAttempt>, StoreError>;
}

#[async_trait]
pub trait WebhookLog: Send + Sync {
    /// Append an entry and return it with its assigned sequence id.
    async fn append(&self, entry: WebhookLogEntry) -> Result<WebhookLogEntry, StoreError>;
    async fn query(&self, query: &WebhookQuery) -> Result<Page<WebhookLogEntry>, StoreError>;
}

/// One page of an audit query. `total` counts every match, not just this page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> Page<T> {
    fn slice(matches: Vec<T>, offset: usize, limit: Option<usize>) -> Self {
        let total = matches.len();
        let items = matches
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Self { items, total }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AttemptQuery {
    pub invoice_id: Option<InvoiceId>,
    pub endpoint: Option<String>,
    pub outcome: Option<AttemptOutcome>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AttemptQuery {
    pub fn for_invoice(invoice_id: InvoiceId) -> Self {
        Self {
            invoice_id: Some(invoice_id),
            ..Self::default()
        }
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    fn matches(&self, attempt: &SubmissionAttempt) -> bool {
        self.invoice_id.is_none_or(|id| attempt.invoice_id() == id)
            && self
                .endpoint
                .as_deref()
                .is_none_or(|endpoint| attempt.endpoint() == endpoint)
            && self.outcome.is_none_or(|outcome| attempt.outcome() == outcome)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebhookQuery {
    pub source: Option<String>,
    pub outcome: Option<WebhookOutcome>,
    pub invoice_id: Option<InvoiceId>,
    /// Status text as the authority sent it, compared without regard to case.
    pub received_status: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl WebhookQuery {
    pub fn for_invoice(invoice_id: InvoiceId) -> Self {
        Self {
            invoice_id: Some(invoice_id),
            ..Self::default()
        }
    }

    pub fn with_outcome(mut self, outcome: WebhookOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_received_status(mut self, status: impl Into<String>) -> Self {
        self.received_status = Some(status.into());
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &WebhookLogEntry) -> bool {
        self.source
            .as_deref()
            .is_none_or(|source| entry.source() == source)
            && self.outcome.is_none_or(|outcome| entry.outcome() == outcome)
            && self
                .invoice_id
                .is_none_or(|id| entry.invoice_id() == Some(id))
            && self
                .received_status
                .as_deref()
                .is_none_or(|status| entry.received_status().eq_ignore_ascii_case(status.trim()))
    }
}

/// Process-local store backing all four contracts. Used by tests and the CLI.
#[derive(Default)]
pub struct MemoryStore {
    certificates: RwLock<HashMap<CompanyId, Vec<CertificateRecord>>>,
    invoices: RwLock<Vec<Invoice>>,
    attempts: RwLock<Vec<SubmissionAttempt>>,
    webhooks: RwLock<Vec<WebhookLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn append(&self, record: CertificateRecord) -> Result<(), StoreError> {
        let mut certificates = self.certificates.write();
        let versions = certificates.entry(record.company_id().clone()).or_default();
        let expected = versions.last().map_or(1, |latest| latest.version() + 1);
        if record.version() != expected {
            return Err(StoreError::Conflict(format!(
                "certificate version {} for {} (expected {expected})",
                record.version(),
                record.company_id()
            )));
        }
        versions.push(record);
        Ok(())
    }

    async fn latest(&self, company_id: &CompanyId) -> Result<Option<CertificateRecord>, StoreError> {
        Ok(self
            .certificates
            .read()
            .get(company_id)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn history(&self, company_id: &CompanyId) -> Result<Vec<CertificateRecord>, StoreError> {
        Ok(self
            .certificates
            .read()
            .get(company_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn insert(&self, invoice: Invoice) -> Result<(), StoreError> {
        let mut invoices = self.invoices.write();
        if invoices.iter().any(|existing| existing.id() == invoice.id()) {
            return Err(StoreError::Conflict(format!("invoice {}", invoice.id())));
        }
        if invoices
            .iter()
            .any(|existing| existing.external_reference() == invoice.external_reference())
        {
            return Err(StoreError::Conflict(format!(
                "external reference {} already used",
                invoice.external_reference()
            )));
        }
        invoices.push(invoice);
        Ok(())
    }

    async fn get(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .invoices
            .read()
            .iter()
            .find(|invoice| invoice.id() == id)
            .cloned())
    }

    async fn find_by_protocol(&self, protocol_number: &str) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .invoices
            .read()
            .iter()
            .find(|invoice| invoice.protocol_number() == Some(protocol_number))
            .cloned())
    }

    async fn find_by_reference(
        &self,
        external_reference: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .invoices
            .read()
            .iter()
            .find(|invoice| invoice.external_reference() == external_reference)
            .cloned())
    }

    async fn update(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut invoices = self.invoices.write();
        let slot = invoices
            .iter_mut()
            .find(|existing| existing.id() == invoice.id())
            .ok_or_else(|| StoreError::NotFound(format!("invoice {}", invoice.id())))?;
        *slot = invoice.clone();
        Ok(())
    }
}

#[async_trait]
impl AttemptLog for MemoryStore {
    async fn record(&self, attempt: SubmissionAttempt) -> Result<(), StoreError> {
        self.attempts.write().push(attempt);
        Ok(())
    }

    async fn count_for(&self, invoice_id: InvoiceId) -> Result<u32, StoreError> {
        let count = self
            .attempts
            .read()
            .iter()
            .filter(|attempt| attempt.invoice_id() == invoice_id)
            .count();
        u32::try_from(count).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn query(&self, query: &AttemptQuery) -> Result<Page<SubmissionAttempt>, StoreError> {
        let matches = self
            .attempts
            .read()
            .iter()
            .filter(|attempt| query.matches(attempt))
            .cloned()
            .collect();
        Ok(Page::slice(matches, query.offset, query.limit))
    }
}

#[async_trait]
impl WebhookLog for MemoryStore {
    async fn append(&self, entry: WebhookLogEntry) -> Result<WebhookLogEntry, StoreError> {
        let mut webhooks = self.webhooks.write();
        let entry = entry.with_id(webhooks.len() as u64 + 1);
        webhooks.push(entry.clone());
        Ok(entry)
    }

    async fn query(&self, query: &WebhookQuery) -> Result<Page<WebhookLogEntry>, StoreError> {
        let matches = self
            .webhooks
            .read()
            .iter()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect();
        Ok(Page::slice(matches, query.offset, query.limit))
    }
}
