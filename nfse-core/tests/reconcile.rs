mod common;

use async_trait::async_trait;
use nfse_core::api::SubmissionOutcome;
use nfse_core::invoice::{CompanyId, Invoice, InvoiceStatus};
use nfse_core::reconcile::{ReconciliationError, StatusReconciler, WebhookLogEntry, WebhookOutcome};
use nfse_core::store::{InvoiceStore, MemoryStore, Page, StoreError, WebhookLog, WebhookQuery};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

async fn issued_invoice(
    store: &Arc<MemoryStore>,
    reconciler: &StatusReconciler,
    protocol: &str,
) -> Invoice {
    let invoice = Invoice::new(CompanyId::new("acme"), None, common::sample_payload());
    store.insert(invoice.clone()).await.expect("insert");
    reconciler
        .apply_submission(
            invoice.id(),
            &SubmissionOutcome::Issued {
                protocol_number: protocol.into(),
            },
        )
        .await
        .expect("issued")
}

fn reconciler(store: &Arc<MemoryStore>) -> StatusReconciler {
    StatusReconciler::new(store.clone(), store.clone())
}

#[tokio::test]
async fn duplicate_webhook_is_applied_once() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = reconciler(&store);
    let invoice = issued_invoice(&store, &reconciler, "NFE-2024-000042").await;
    let payload = r#"{"reference":"NFE-2024-000042","status":"CANCELADA"}"#;

    let first = reconciler.ingest("prefeitura-sp", payload).await.expect("first");
    let second = reconciler.ingest("prefeitura-sp", payload).await.expect("second");
    assert_eq!(first.outcome(), WebhookOutcome::Applied);
    assert_eq!(second.outcome(), WebhookOutcome::Duplicate);
    assert!(second.id() > first.id());

    let stored = store.get(invoice.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), InvoiceStatus::Canceled);

    let applied = WebhookLog::query(
        &*store,
        &WebhookQuery::for_invoice(invoice.id()).with_outcome(WebhookOutcome::Applied),
    )
    .await
    .unwrap();
    assert_eq!(applied.total, 1);
    let all = WebhookLog::query(&*store, &WebhookQuery::for_invoice(invoice.id()))
        .await
        .unwrap();
    assert_eq!(all.total, 2);
    assert!(all.items.iter().all(|entry| entry.raw_payload() == payload));
}

#[tokio::test]
async fn unknown_protocol_is_logged_without_mutation() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = reconciler(&store);
    let invoice = issued_invoice(&store, &reconciler, "NFE-2024-000042").await;
    let before = store.get(invoice.id()).await.unwrap().unwrap();

    let entry = reconciler
        .ingest("prefeitura-sp", r#"{"reference":"NFE-1999-000001","status":"cancelada"}"#)
        .await
        .expect("ingest");
    assert_eq!(entry.outcome(), WebhookOutcome::Unmatched);
    assert_eq!(entry.invoice_id(), None);
    assert!(entry.detail().unwrap_or_default().contains("NFE-1999-000001"));

    let after = store.get(invoice.id()).await.unwrap().unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn webhook_queries_filter_by_source_and_paginate() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = reconciler(&store);
    issued_invoice(&store, &reconciler, "NFE-7").await;

    for _ in 0..3 {
        reconciler
            .ingest("prefeitura-sp", r#"{"reference":"NFE-7","status":"issued"}"#)
            .await
            .unwrap();
    }
    reconciler
        .ingest("prefeitura-rj", r#"{"reference":"NFE-404","status":"issued"}"#)
        .await
        .unwrap();

    let query = WebhookQuery {
        source: Some("prefeitura-sp".into()),
        ..WebhookQuery::default()
    }
    .page(1, 1);
    let page = WebhookLog::query(&*store, &query).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].outcome(), WebhookOutcome::Duplicate);

    let unmatched = WebhookLog::query(
        &*store,
        &WebhookQuery::default().with_outcome(WebhookOutcome::Unmatched),
    )
    .await
    .unwrap();
    assert_eq!(unmatched.total, 1);
    assert_eq!(unmatched.items[0].source(), "prefeitura-rj");
}

#[tokio::test]
async fn webhook_queries_filter_by_received_status() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = reconciler(&store);
    for payload in [
        r#"{"reference":"NFE-1","status":"CANCELADA"}"#,
        r#"{"reference":"NFE-2","status":"Autorizada"}"#,
        r#"{"reference":"NFE-3","status":"cancelada"}"#,
    ] {
        reconciler.ingest("prefeitura-sp", payload).await.unwrap();
    }

    let canceled = WebhookLog::query(
        &*store,
        &WebhookQuery::default().with_received_status("Cancelada"),
    )
    .await
    .unwrap();
    assert_eq!(canceled.total, 2);
    assert!(canceled
        .items
        .iter()
        .all(|entry| entry.received_status().eq_ignore_ascii_case("cancelada")));

    let none = WebhookLog::query(
        &*store,
        &WebhookQuery::default().with_received_status("substituida"),
    )
    .await
    .unwrap();
    assert_eq!(none.total, 0);
}

/// Webhook log whose next append fails once.
struct FlakyLog {
    inner: Arc<MemoryStore>,
    fail_next: AtomicBool,
}

#[async_trait]
impl WebhookLog for FlakyLog {
    async fn append(&self, entry: WebhookLogEntry) -> Result<WebhookLogEntry, StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("log unavailable".into()));
        }
        WebhookLog::append(&*self.inner, entry).await
    }

    async fn query(&self, query: &WebhookQuery) -> Result<Page<WebhookLogEntry>, StoreError> {
        WebhookLog::query(&*self.inner, query).await
    }
}

#[tokio::test]
async fn failed_log_append_keeps_transition_and_redelivery_is_duplicate() {
    let store = Arc::new(MemoryStore::new());
    let invoice = issued_invoice(&store, &reconciler(&store), "NFE-2024-000050").await;
    let log = Arc::new(FlakyLog {
        inner: store.clone(),
        fail_next: AtomicBool::new(true),
    });
    let reconciler = StatusReconciler::new(store.clone(), log);
    let payload = r#"{"reference":"NFE-2024-000050","status":"CANCELADA"}"#;

    let failed = reconciler.ingest("prefeitura-sp", payload).await;
    assert!(matches!(failed, Err(ReconciliationError::Store(_))));
    let stored = store.get(invoice.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), InvoiceStatus::Canceled);
    let logged = WebhookLog::query(&*store, &WebhookQuery::for_invoice(invoice.id()))
        .await
        .unwrap();
    assert_eq!(logged.total, 0);

    let redelivered = reconciler.ingest("prefeitura-sp", payload).await.expect("redelivery");
    assert_eq!(redelivered.outcome(), WebhookOutcome::Duplicate);
    let applied = WebhookLog::query(
        &*store,
        &WebhookQuery::for_invoice(invoice.id()).with_outcome(WebhookOutcome::Applied),
    )
    .await
    .unwrap();
    assert_eq!(applied.total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_settle_on_one_state() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Arc::new(reconciler(&store));
    let invoice = Invoice::new(CompanyId::new("acme"), Some("RPS-77".into()), common::sample_payload());
    store.insert(invoice.clone()).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let reconciler = Arc::clone(&reconciler);
        tasks.push(tokio::spawn(async move {
            reconciler
                .ingest(
                    "prefeitura-sp",
                    r#"{"reference":"NFE-77","external_reference":"RPS-77","status":"autorizada"}"#,
                )
                .await
                .expect("ingest")
                .outcome()
        }));
    }
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }

    let applied = outcomes
        .iter()
        .filter(|outcome| **outcome == WebhookOutcome::Applied)
        .count();
    assert_eq!(applied, 1);
    assert_eq!(outcomes.len(), 8);
    assert!(outcomes
        .iter()
        .all(|outcome| matches!(outcome, WebhookOutcome::Applied | WebhookOutcome::Duplicate)));

    let stored = store.get(invoice.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), InvoiceStatus::Issued);
    assert_eq!(stored.protocol_number(), Some("NFE-77"));
}
