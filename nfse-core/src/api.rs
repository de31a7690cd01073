//! SOAP submission of signed documents to the municipal web service.
use crate::config::{Config, ServiceHost};
use crate::endpoint::{EndpointResolver, ResolvedEndpoint};
use crate::invoice::sign::SignedDocument;
use crate::invoice::xml::constants::{LAYOUT_VERSION, NFSE_NS, NFSE_WS_NS, SOAP_ENV_NS};
use crate::invoice::{AttemptOutcome, InvoiceId, SubmissionAttempt};
use crate::store::{AttemptLog, StoreError};
use async_trait::async_trait;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// SOAPAction of the ABRASF `GerarNfse` operation.
pub const GERAR_NFSE_ACTION: &str = "http://nfse.abrasf.org.br/GerarNfse";

const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("attempt timed out")]
    Timeout,
    #[error("transport failure: {message}")]
    TransportFailure { connect: bool, message: String },
    #[error("authority rejected the document ({code}): {message}")]
    ProtocolFault { code: String, message: String },
    #[error("submission inconclusive after {attempts} attempts: {last_error}")]
    Inconclusive { attempts: u32, last_error: String },
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubmissionError {
    fn is_connect(&self) -> bool {
        matches!(self, Self::TransportFailure { connect: true, .. })
    }
}

/// Final answer for one submission run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Issued {
        protocol_number: String,
    },
    Rejected {
        fault_code: String,
        fault_message: String,
    },
    /// Retries ran out without a conclusive reply. The authority may or may not
    /// have accepted the document.
    Inconclusive { attempts: u32, last_error: String },
}

impl SubmissionOutcome {
    pub fn requires_reconciliation(&self) -> bool {
        matches!(self, Self::Inconclusive { .. })
    }

    pub fn protocol_number(&self) -> Option<&str> {
        match self {
            Self::Issued { protocol_number } => Some(protocol_number),
            _ => None,
        }
    }

    /// The error equivalent of a non-issued outcome.
    pub fn into_error(self) -> Option<SubmissionError> {
        match self {
            Self::Issued { .. } => None,
            Self::Rejected {
                fault_code,
                fault_message,
            } => Some(SubmissionError::ProtocolFault {
                code: fault_code,
                message: fault_message,
            }),
            Self::Inconclusive {
                attempts,
                last_error,
            } => Some(SubmissionError::Inconclusive {
                attempts,
                last_error,
            }),
        }
    }
}

/// A ready-to-send SOAP 1.1 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapRequest {
    action: &'static str,
    body: String,
}

impl SoapRequest {
    /// Wrap a signed `GerarNfseEnvio` document in a `GerarNfseRequest` envelope.
    pub fn gerar_nfse(document: &str) -> Self {
        let header = format!(
            r#"<cabecalho xmlns="{NFSE_NS}" versao="{LAYOUT_VERSION}"><versaoDados>{LAYOUT_VERSION}</versaoDados></cabecalho>"#
        );
        let body = format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<soapenv:Envelope xmlns:soapenv="{env}" xmlns:nfse="{ws}">"#,
                "<soapenv:Header/><soapenv:Body><nfse:GerarNfseRequest>",
                "<nfseCabecMsg>{header}</nfseCabecMsg>",
                "<nfseDadosMsg>{data}</nfseDadosMsg>",
                "</nfse:GerarNfseRequest></soapenv:Body></soapenv:Envelope>"
            ),
            env = SOAP_ENV_NS,
            ws = NFSE_WS_NS,
            header = escape(header.as_str()),
            data = escape(document),
        );
        Self {
            action: GERAR_NFSE_ACTION,
            body,
        }
    }

    pub fn action(&self) -> &str {
        self.action
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Moves one SOAP request to a host and brings back whatever came back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(
        &self,
        host: &ServiceHost,
        request: &SoapRequest,
    ) -> Result<TransportResponse, SubmissionError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, SubmissionError> {
        let client = Client::builder().build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn exchange(
        &self,
        host: &ServiceHost,
        request: &SoapRequest,
    ) -> Result<TransportResponse, SubmissionError> {
        let response = self
            .client
            .post(host.as_str())
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .header("SOAPAction", request.action())
            .body(request.body().to_owned())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;
        Ok(TransportResponse { status, body })
    }
}

fn transport_error(error: reqwest::Error) -> SubmissionError {
    if error.is_timeout() {
        SubmissionError::Timeout
    } else {
        SubmissionError::TransportFailure {
            connect: error.is_connect(),
            message: error.to_string(),
        }
    }
}

/// Attempt budget and pacing for one submission run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(
        retries: u32,
        backoff_base: Duration,
        backoff_max: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            retries,
            backoff_base,
            backoff_max,
            attempt_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.retries(),
            config.backoff_base(),
            config.backoff_max(),
            config.attempt_timeout(),
        )
    }

    /// Retries after the first attempt.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Delay before retry `n` (1-based): `base * 2^(n-1)`, capped at the maximum.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// What a response body says, when it says anything conclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Issued(String),
    Fault { code: String, message: String },
}

#[derive(Default)]
struct ReplyFields {
    protocol: Option<String>,
    nfse_number: Option<String>,
    fault_code: Option<String>,
    fault_message: Option<String>,
}

impl ReplyFields {
    fn merge(&mut self, other: ReplyFields) {
        self.protocol = self.protocol.take().or(other.protocol);
        self.nfse_number = self.nfse_number.take().or(other.nfse_number);
        self.fault_code = self.fault_code.take().or(other.fault_code);
        self.fault_message = self.fault_message.take().or(other.fault_message);
    }

    fn into_reply(self) -> Option<Reply> {
        if let Some(number) = self.protocol.or(self.nfse_number) {
            return Some(Reply::Issued(number));
        }
        if self.fault_code.is_some() || self.fault_message.is_some() {
            return Some(Reply::Fault {
                code: self.fault_code.unwrap_or_default(),
                message: self.fault_message.unwrap_or_default(),
            });
        }
        None
    }
}

/// Responses may carry the ABRASF reply as escaped text inside the SOAP body.
const MAX_NESTING: usize = 2;

fn parse_reply(body: &str) -> Option<Reply> {
    collect_fields(body, 0)?.into_reply()
}

fn collect_fields(xml: &str, depth: usize) -> Option<ReplyFields> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut fields = ReplyFields::default();
    let mut saw_element = false;

    loop {
        let text = match reader.read_event().ok()? {
            Event::Start(start) => {
                saw_element = true;
                path.push(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
                continue;
            }
            Event::Empty(_) => {
                saw_element = true;
                continue;
            }
            Event::End(_) => {
                path.pop();
                continue;
            }
            Event::Text(text) => text.unescape().ok()?.into_owned(),
            Event::CData(data) => String::from_utf8_lossy(&data.into_inner()).into_owned(),
            Event::Eof => break,
            _ => continue,
        };

        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let inside = |name: &str| path.iter().any(|segment| segment == name);
        // ListaMensagemAlertaRetorno carries warnings that accompany an issued NFS-e.
        let in_error_list = path
            .iter()
            .any(|segment| segment.starts_with("ListaMensagemRetorno"));
        match path.last().map(String::as_str) {
            Some("Protocolo") => fields.protocol.get_or_insert_with(|| text.to_owned()),
            Some("Numero") if inside("InfNfse") => {
                fields.nfse_number.get_or_insert_with(|| text.to_owned())
            }
            Some("faultcode") => fields.fault_code.get_or_insert_with(|| text.to_owned()),
            Some("faultstring") => fields.fault_message.get_or_insert_with(|| text.to_owned()),
            Some("Codigo") if in_error_list => {
                fields.fault_code.get_or_insert_with(|| text.to_owned())
            }
            Some("Mensagem") if in_error_list => {
                fields.fault_message.get_or_insert_with(|| text.to_owned())
            }
            _ => {
                if text.starts_with('<') && depth < MAX_NESTING {
                    if let Some(nested) = collect_fields(text, depth + 1) {
                        fields.merge(nested);
                    }
                }
                continue;
            }
        };
    }

    saw_element.then_some(fields)
}

fn classify(response: &TransportResponse) -> Result<Reply, SubmissionError> {
    match parse_reply(&response.body) {
        Some(reply @ Reply::Fault { .. }) => Ok(reply),
        Some(reply @ Reply::Issued(_)) if response.status < 500 => Ok(reply),
        _ => Err(SubmissionError::TransportFailure {
            connect: false,
            message: format!("inconclusive response with status {}", response.status),
        }),
    }
}

enum Verdict {
    Done(SubmissionOutcome),
    Retry(SubmissionError),
}

/// Sends signed documents, retrying transport failures and recording every attempt.
pub struct SubmissionClient {
    transport: Arc<dyn Transport>,
    attempts: Arc<dyn AttemptLog>,
    policy: RetryPolicy,
}

impl SubmissionClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        attempts: Arc<dyn AttemptLog>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            attempts,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Submit `document` starting at `endpoint`.
    ///
    /// Faults and success replies end the run immediately. Timeouts, network
    /// errors and unreadable replies are retried per the policy; a connect
    /// failure also re-resolves the endpoint from `hosts`.
    ///
    /// # Errors
    /// Only attempt-log failures are returned as errors. Everything the
    /// authority or the network does is expressed as a [`SubmissionOutcome`].
    pub async fn submit(
        &self,
        invoice_id: InvoiceId,
        document: &SignedDocument,
        endpoint: &ResolvedEndpoint,
        hosts: &[ServiceHost],
        resolver: &EndpointResolver,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let request = SoapRequest::gerar_nfse(document.xml());
        let mut endpoint = endpoint.clone();
        let mut sequence = self.attempts.count_for(invoice_id).await?;
        let max_attempts = self.policy.retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.policy.backoff(attempt - 1);
                debug!(invoice_id = %invoice_id, attempt, ?delay, "backing off before retry");
                tokio::time::sleep(delay).await;
            }
            sequence += 1;
            let host = endpoint.host().clone();

            let exchanged = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.transport.exchange(&host, &request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SubmissionError::Timeout),
            };

            let (outcome, response_text, verdict) = match exchanged {
                Ok(response) => match classify(&response) {
                    Ok(Reply::Issued(protocol_number)) => (
                        AttemptOutcome::Success,
                        response.body,
                        Verdict::Done(SubmissionOutcome::Issued { protocol_number }),
                    ),
                    Ok(Reply::Fault { code, message }) => (
                        AttemptOutcome::Fault,
                        response.body,
                        Verdict::Done(SubmissionOutcome::Rejected {
                            fault_code: code,
                            fault_message: message,
                        }),
                    ),
                    Err(error) => (AttemptOutcome::NetworkError, response.body, Verdict::Retry(error)),
                },
                Err(SubmissionError::Timeout) => (
                    AttemptOutcome::Timeout,
                    SubmissionError::Timeout.to_string(),
                    Verdict::Retry(SubmissionError::Timeout),
                ),
                Err(error) => (AttemptOutcome::NetworkError, error.to_string(), Verdict::Retry(error)),
            };

            self.attempts
                .record(SubmissionAttempt::new(
                    invoice_id,
                    host.as_str(),
                    sequence,
                    outcome,
                    &response_text,
                ))
                .await?;
            info!(invoice_id = %invoice_id, host = %host, attempt = sequence, outcome = ?outcome, "submission attempt recorded");

            match verdict {
                Verdict::Done(outcome) => return Ok(outcome),
                Verdict::Retry(error) => {
                    if attempt < max_attempts && error.is_connect() {
                        match resolver.resolve(endpoint.environment(), hosts).await {
                            Ok(fresh) => endpoint = fresh,
                            Err(resolve_error) => {
                                warn!(host = %host, error = %resolve_error, "re-resolution failed, keeping current endpoint");
                            }
                        }
                    }
                    last_error = error.to_string();
                }
            }
        }

        warn!(invoice_id = %invoice_id, attempts = max_attempts, %last_error, "submission inconclusive");
        Ok(SubmissionOutcome::Inconclusive {
            attempts: max_attempts,
            last_error,
        })
    }
}
