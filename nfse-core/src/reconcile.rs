//! Reconciliation of invoice status from submission outcomes and authority webhooks.
use crate::api::SubmissionOutcome;
use crate::invoice::{
    FailureCause, FailureKind, Invoice, InvoiceId, InvoiceStatus, StatusEvent, Transition,
    TransitionError,
};
use crate::locks::KeyedLocks;
use crate::store::{InvoiceStore, StoreError, WebhookLog};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("no invoice matches reference {0}")]
    UnmatchedReference(String),
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Status reported by the authority, closed over the spellings it is known to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationStatus {
    Issued,
    Canceled,
    Unknown(String),
}

impl NotificationStatus {
    pub fn from_raw(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "issued" | "emitida" | "authorized" | "autorizada" => Self::Issued,
            "canceled" | "cancelled" | "cancelada" => Self::Canceled,
            _ => Self::Unknown(raw.trim().to_string()),
        }
    }

    fn event(&self) -> Option<StatusEvent> {
        match self {
            Self::Issued => Some(StatusEvent::AuthorityIssued),
            Self::Canceled => Some(StatusEvent::AuthorityCanceled),
            Self::Unknown(_) => None,
        }
    }
}

/// A parsed authority notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookNotification {
    protocol_number: Option<String>,
    external_reference: Option<String>,
    status: NotificationStatus,
    received_status: String,
}

impl WebhookNotification {
    pub fn protocol_number(&self) -> Option<&str> {
        self.protocol_number.as_deref()
    }

    pub fn external_reference(&self) -> Option<&str> {
        self.external_reference.as_deref()
    }

    pub fn status(&self) -> &NotificationStatus {
        &self.status
    }

    pub fn received_status(&self) -> &str {
        &self.received_status
    }
}

#[derive(Deserialize)]
struct RawNotification {
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    external_reference: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a webhook body.
///
/// # Errors
/// [`ReconciliationError::InvalidPayload`] when the body is not JSON, lacks a
/// status, or carries neither `reference` nor `external_reference`.
pub fn parse_notification(raw: &str) -> Result<WebhookNotification, ReconciliationError> {
    let parsed: RawNotification = serde_json::from_str(raw)
        .map_err(|e| ReconciliationError::InvalidPayload(e.to_string()))?;
    let received_status = non_blank(parsed.status)
        .ok_or_else(|| ReconciliationError::InvalidPayload("missing status".into()))?;
    let protocol_number = non_blank(parsed.reference);
    let external_reference = non_blank(parsed.external_reference);
    if protocol_number.is_none() && external_reference.is_none() {
        return Err(ReconciliationError::InvalidPayload(
            "missing reference and external_reference".into(),
        ));
    }

    Ok(WebhookNotification {
        protocol_number,
        external_reference,
        status: NotificationStatus::from_raw(&received_status),
        received_status,
    })
}

/// Best-effort status string from a body that failed to parse.
fn status_hint(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| value.get("status")?.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    Duplicate,
    Unmatched,
    /// Correlated or not, nothing was changed: malformed body, unknown status,
    /// or a transition the invoice cannot take.
    Ignored,
}

/// Audit record of one webhook delivery. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookLogEntry {
    id: u64,
    source: String,
    received_status: String,
    raw_payload: String,
    outcome: WebhookOutcome,
    invoice_id: Option<InvoiceId>,
    detail: Option<String>,
    created_at: DateTime<Utc>,
}

impl WebhookLogEntry {
    pub fn new(
        source: impl Into<String>,
        received_status: impl Into<String>,
        raw_payload: impl Into<String>,
        outcome: WebhookOutcome,
        invoice_id: Option<InvoiceId>,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: 0,
            source: source.into(),
            received_status: received_status.into(),
            raw_payload: raw_payload.into(),
            outcome,
            invoice_id,
            detail,
            created_at: Utc::now(),
        }
    }

    /// Assign the sequence id. Called by the log on append.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn received_status(&self) -> &str {
        &self.received_status
    }

    pub fn raw_payload(&self) -> &str {
        &self.raw_payload
    }

    pub fn outcome(&self) -> WebhookOutcome {
        self.outcome
    }

    pub fn invoice_id(&self) -> Option<InvoiceId> {
        self.invoice_id
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

enum Correlation {
    Protocol,
    Reference,
}

/// Single writer of invoice status. Every mutation runs under the invoice's lock.
pub struct StatusReconciler {
    invoices: Arc<dyn InvoiceStore>,
    webhooks: Arc<dyn WebhookLog>,
    locks: KeyedLocks<InvoiceId>,
}

impl StatusReconciler {
    pub fn new(invoices: Arc<dyn InvoiceStore>, webhooks: Arc<dyn WebhookLog>) -> Self {
        Self {
            invoices,
            webhooks,
            locks: KeyedLocks::new(),
        }
    }

    /// Apply one webhook delivery. Exactly one log entry is written per successful call.
    ///
    /// The invoice is written before its log entry. If the append fails the
    /// transition stays applied and the error is returned; a redelivery of the
    /// same notification is then logged as [`WebhookOutcome::Duplicate`], so the
    /// log never records a transition the invoice did not take.
    ///
    /// # Errors
    /// Only storage failures are returned. Malformed, unknown and unmatched
    /// notifications are recorded and returned as log entries.
    pub async fn ingest(
        &self,
        source: &str,
        raw_payload: &str,
    ) -> Result<WebhookLogEntry, ReconciliationError> {
        let notification = match parse_notification(raw_payload) {
            Ok(notification) => notification,
            Err(error) => {
                warn!(source, %error, "webhook payload rejected");
                let entry = WebhookLogEntry::new(
                    source,
                    status_hint(raw_payload),
                    raw_payload,
                    WebhookOutcome::Ignored,
                    None,
                    Some(error.to_string()),
                );
                return Ok(self.webhooks.append(entry).await?);
            }
        };
        let received = notification.received_status().to_string();
        let log = |outcome, invoice_id, detail: Option<String>| {
            WebhookLogEntry::new(source, received.as_str(), raw_payload, outcome, invoice_id, detail)
        };

        let Some((matched, correlation)) = self.correlate(&notification).await? else {
            let reference = notification
                .protocol_number()
                .or(notification.external_reference())
                .unwrap_or_default();
            let error = ReconciliationError::UnmatchedReference(reference.to_string());
            info!(source, reference, "webhook did not match any invoice");
            let entry = log(WebhookOutcome::Unmatched, None, Some(error.to_string()));
            return Ok(self.webhooks.append(entry).await?);
        };
        let invoice_id = matched.id();

        let Some(event) = notification.status().event() else {
            info!(source, invoice_id = %invoice_id, status = %received, "unknown webhook status ignored");
            let entry = log(
                WebhookOutcome::Ignored,
                Some(invoice_id),
                Some(format!("unknown status {received:?}")),
            );
            return Ok(self.webhooks.append(entry).await?);
        };

        let _guard = self.locks.lock(invoice_id).await;
        let mut invoice = self.load(invoice_id).await?;
        let (outcome, detail) = match invoice.apply(event) {
            Ok(Transition::Moved(status)) => {
                if status == InvoiceStatus::Issued
                    && matches!(correlation, Correlation::Reference)
                    && invoice.protocol_number().is_none()
                {
                    if let Some(protocol) = notification.protocol_number() {
                        invoice.set_protocol_number(protocol);
                    }
                }
                // State first: a logged Applied must always match a stored transition.
                self.invoices.update(&invoice).await?;
                info!(source, invoice_id = %invoice_id, status = %status, "webhook applied");
                (WebhookOutcome::Applied, None)
            }
            Ok(Transition::Duplicate) => {
                debug!(source, invoice_id = %invoice_id, "duplicate webhook");
                (WebhookOutcome::Duplicate, None)
            }
            Err(error) => {
                warn!(source, invoice_id = %invoice_id, %error, "webhook transition not allowed");
                (WebhookOutcome::Ignored, Some(error.to_string()))
            }
        };
        let entry = self
            .webhooks
            .append(log(outcome, Some(invoice_id), detail))
            .await?;
        Ok(entry)
    }

    /// Record the result of a synchronous submission.
    ///
    /// When the authority has already settled the invoice through a webhook,
    /// the stored state wins and the outcome only fills a missing protocol number.
    ///
    /// # Errors
    /// Store failures, an unknown invoice, or a transition the invoice cannot take.
    pub async fn apply_submission(
        &self,
        invoice_id: InvoiceId,
        outcome: &SubmissionOutcome,
    ) -> Result<Invoice, ReconciliationError> {
        let _guard = self.locks.lock(invoice_id).await;
        let mut invoice = self.load(invoice_id).await?;

        let (event, cause) = match outcome {
            SubmissionOutcome::Issued { .. } => (StatusEvent::SubmissionIssued, None),
            SubmissionOutcome::Rejected {
                fault_code,
                fault_message,
            } => (
                StatusEvent::SubmissionRejected,
                Some(FailureCause::new(
                    FailureKind::Rejected,
                    format!("{fault_code}: {fault_message}"),
                )),
            ),
            SubmissionOutcome::Inconclusive { last_error, .. } => (
                StatusEvent::SubmissionInconclusive,
                Some(FailureCause::new(FailureKind::Inconclusive, last_error.clone())),
            ),
        };

        match invoice.apply(event) {
            Ok(_) => {
                if let Some(cause) = cause {
                    invoice.set_last_error(cause);
                }
            }
            Err(error) => {
                let settled = matches!(
                    invoice.status(),
                    InvoiceStatus::Issued | InvoiceStatus::Canceled
                );
                if !settled {
                    return Err(error.into());
                }
                info!(invoice_id = %invoice_id, status = %invoice.status(), "invoice already settled by the authority");
            }
        }
        if let Some(protocol) = outcome.protocol_number() {
            if invoice.protocol_number().is_none() {
                invoice.set_protocol_number(protocol);
            }
        }

        self.invoices.update(&invoice).await?;
        info!(invoice_id = %invoice_id, status = %invoice.status(), "submission outcome applied");
        Ok(invoice)
    }

    /// Fail a pending invoice for a local reason (certificate, signature, endpoint).
    ///
    /// # Errors
    /// Store failures, an unknown invoice, or an invoice that is not pending.
    pub async fn mark_failed(
        &self,
        invoice_id: InvoiceId,
        cause: FailureCause,
    ) -> Result<Invoice, ReconciliationError> {
        let _guard = self.locks.lock(invoice_id).await;
        let mut invoice = self.load(invoice_id).await?;
        invoice.apply(StatusEvent::LocalFailure)?;
        warn!(invoice_id = %invoice_id, cause = %cause, "invoice marked failed");
        invoice.set_last_error(cause);
        self.invoices.update(&invoice).await?;
        Ok(invoice)
    }

    /// Move a failed invoice back to pending.
    ///
    /// # Errors
    /// Store failures, an unknown invoice, or an invoice that is not failed.
    pub async fn request_retry(&self, invoice_id: InvoiceId) -> Result<Invoice, ReconciliationError> {
        let _guard = self.locks.lock(invoice_id).await;
        let mut invoice = self.load(invoice_id).await?;
        invoice.apply(StatusEvent::RetryRequested)?;
        self.invoices.update(&invoice).await?;
        info!(invoice_id = %invoice_id, "retry requested");
        Ok(invoice)
    }

    /// Record the signed document on a pending invoice.
    pub(crate) async fn attach_signed_document(
        &self,
        invoice_id: InvoiceId,
        document: String,
    ) -> Result<Invoice, ReconciliationError> {
        let _guard = self.locks.lock(invoice_id).await;
        let mut invoice = self.load(invoice_id).await?;
        invoice.set_signed_document(document);
        self.invoices.update(&invoice).await?;
        Ok(invoice)
    }

    async fn load(&self, invoice_id: InvoiceId) -> Result<Invoice, ReconciliationError> {
        self.invoices
            .get(invoice_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("invoice {invoice_id}")).into())
    }

    async fn correlate(
        &self,
        notification: &WebhookNotification,
    ) -> Result<Option<(Invoice, Correlation)>, ReconciliationError> {
        if let Some(protocol) = notification.protocol_number() {
            if let Some(invoice) = self.invoices.find_by_protocol(protocol).await? {
                return Ok(Some((invoice, Correlation::Protocol)));
            }
        }
        if let Some(reference) = notification.external_reference() {
            if let Some(invoice) = self.invoices.find_by_reference(reference).await? {
                return Ok(Some((invoice, Correlation::Reference)));
            }
        }
        Ok(None)
    }
}
