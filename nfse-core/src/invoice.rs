//! Invoice domain types, payload validation and the status state machine.
pub mod sign;
pub mod xml;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Maximum number of characters kept from a response body or error text.
pub const RESPONSE_EXCERPT_LIMIT: usize = 512;

/// Structured validation error with field-level issues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invoice payload validation failed: {}", describe_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    pub fn has_issue(&self, field: InvoiceField) -> bool {
        self.issues.iter().any(|issue| issue.field == field)
    }
}

fn describe_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{:?} ({:?})", issue.field, issue.kind))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Single validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: InvoiceField,
    pub kind: ValidationKind,
}

#[non_exhaustive]
/// Payload field associated with a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceField {
    RpsNumber,
    RpsSeries,
    ServiceAmount,
    DeductionAmount,
    PisAmount,
    CofinsAmount,
    IssAmount,
    IssRate,
    UnconditionalDiscount,
    ServiceItemCode,
    ServiceDescription,
    MunicipalityCode,
    ProviderCnpj,
    TakerDocument,
    TakerName,
}

#[non_exhaustive]
/// Classification of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    Missing,
    Empty,
    InvalidFormat,
}

/// Tenant identifier; every certificate and invoice belongs to one company.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(String);

impl CompanyId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(Uuid);

impl InvoiceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InvoiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InvoiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// RPS identification block (provisional receipt number, series and type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpsIdentification {
    #[serde(default)]
    pub numero: String,
    #[serde(default)]
    pub serie: String,
    #[serde(default = "default_rps_type")]
    pub tipo: u8,
    pub data_emissao: NaiveDate,
}

fn default_rps_type() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceValues {
    pub valor_servicos: f64,
    #[serde(default)]
    pub valor_deducoes: Option<f64>,
    #[serde(default)]
    pub valor_pis: Option<f64>,
    #[serde(default)]
    pub valor_cofins: Option<f64>,
    #[serde(default)]
    pub valor_iss: Option<f64>,
    #[serde(default)]
    pub aliquota: Option<f64>,
    #[serde(default)]
    pub desconto_incondicionado: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub valores: ServiceValues,
    #[serde(default)]
    pub iss_retido: bool,
    #[serde(default)]
    pub item_lista_servico: String,
    #[serde(default)]
    pub codigo_cnae: Option<String>,
    #[serde(default)]
    pub discriminacao: String,
    #[serde(default)]
    pub codigo_municipio: String,
    #[serde(default = "default_exigibilidade")]
    pub exigibilidade_iss: u8,
}

fn default_exigibilidade() -> u8 {
    1
}

/// Service provider ("prestador").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    #[serde(default)]
    pub cnpj: String,
    #[serde(default)]
    pub inscricao_municipal: Option<String>,
}

/// Service taker ("tomador").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taker {
    #[serde(default)]
    pub cpf_cnpj: String,
    #[serde(default)]
    pub razao_social: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Business content of an invoice, serialized into the signed `InfDeclaracaoPrestacaoServico`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicePayload {
    pub rps: RpsIdentification,
    pub competencia: NaiveDate,
    pub servico: Service,
    pub prestador: Provider,
    #[serde(default)]
    pub tomador: Option<Taker>,
    #[serde(default)]
    pub optante_simples_nacional: bool,
    #[serde(default)]
    pub incentivo_fiscal: bool,
}

impl InvoicePayload {
    /// Value of the `Id` attribute carried by the signed element.
    pub fn reference_id(&self) -> String {
        format!("rps{}{}", self.rps.numero.trim(), self.rps.serie.trim())
    }

    /// Default correlation key: RPS number and series.
    pub fn default_external_reference(&self) -> String {
        format!("{}-{}", self.rps.numero.trim(), self.rps.serie.trim())
    }

    /// Check that every field the document schema requires is present.
    ///
    /// # Errors
    /// Returns [`ValidationError`] listing every absent or empty field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        require_text(&mut issues, InvoiceField::RpsNumber, &self.rps.numero);
        require_text(&mut issues, InvoiceField::RpsSeries, &self.rps.serie);
        require_text(
            &mut issues,
            InvoiceField::ServiceItemCode,
            &self.servico.item_lista_servico,
        );
        require_text(
            &mut issues,
            InvoiceField::ServiceDescription,
            &self.servico.discriminacao,
        );
        require_text(
            &mut issues,
            InvoiceField::MunicipalityCode,
            &self.servico.codigo_municipio,
        );
        require_text(&mut issues, InvoiceField::ProviderCnpj, &self.prestador.cnpj);

        let values = &self.servico.valores;
        require_amount(&mut issues, InvoiceField::ServiceAmount, Some(values.valor_servicos));
        require_amount(&mut issues, InvoiceField::DeductionAmount, values.valor_deducoes);
        require_amount(&mut issues, InvoiceField::PisAmount, values.valor_pis);
        require_amount(&mut issues, InvoiceField::CofinsAmount, values.valor_cofins);
        require_amount(&mut issues, InvoiceField::IssAmount, values.valor_iss);
        require_amount(&mut issues, InvoiceField::IssRate, values.aliquota);
        require_amount(
            &mut issues,
            InvoiceField::UnconditionalDiscount,
            values.desconto_incondicionado,
        );
        if self.rps.numero.chars().any(char::is_whitespace) && !self.rps.numero.trim().is_empty()
        {
            issues.push(ValidationIssue {
                field: InvoiceField::RpsNumber,
                kind: ValidationKind::InvalidFormat,
            });
        }

        if let Some(taker) = &self.tomador {
            require_text(&mut issues, InvoiceField::TakerDocument, &taker.cpf_cnpj);
            require_text(&mut issues, InvoiceField::TakerName, &taker.razao_social);
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(issues))
        }
    }
}

/// Amounts and rates must be finite and not negative.
fn require_amount(issues: &mut Vec<ValidationIssue>, field: InvoiceField, value: Option<f64>) {
    if value.is_some_and(|v| !v.is_finite() || v < 0.0) {
        issues.push(ValidationIssue {
            field,
            kind: ValidationKind::InvalidFormat,
        });
    }
}

fn require_text(issues: &mut Vec<ValidationIssue>, field: InvoiceField, value: &str) {
    let kind = if value.is_empty() {
        ValidationKind::Missing
    } else if value.trim().is_empty() {
        ValidationKind::Empty
    } else {
        return;
    };
    issues.push(ValidationIssue { field, kind });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Issued,
    Failed,
    Canceled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Failed => "failed",
            InvoiceStatus::Canceled => "canceled",
        }
    }

    /// Resolve the next status for `event`.
    ///
    /// # Errors
    /// Returns [`TransitionError::NotAllowed`] for any pair outside the transition table.
    pub fn apply(self, event: StatusEvent) -> Result<Transition, TransitionError> {
        use InvoiceStatus::*;
        use StatusEvent::*;

        match (self, event) {
            (Pending, SubmissionIssued) => Ok(Transition::Moved(Issued)),
            (Pending, SubmissionRejected | SubmissionInconclusive | LocalFailure) => {
                Ok(Transition::Moved(Failed))
            }
            (Failed, RetryRequested) => Ok(Transition::Moved(Pending)),
            (Pending | Failed, AuthorityIssued) => Ok(Transition::Moved(Issued)),
            (Issued, AuthorityIssued) => Ok(Transition::Duplicate),
            (Issued, AuthorityCanceled) => Ok(Transition::Moved(Canceled)),
            (Canceled, AuthorityCanceled) => Ok(Transition::Duplicate),
            (from, event) => Err(TransitionError::NotAllowed { from, event }),
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive [`InvoiceStatus`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    SubmissionIssued,
    SubmissionRejected,
    SubmissionInconclusive,
    LocalFailure,
    RetryRequested,
    AuthorityIssued,
    AuthorityCanceled,
}

/// Result of a permitted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved(InvoiceStatus),
    /// The invoice is already in the target state.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("transition from {from} on {event:?} is not allowed")]
    NotAllowed {
        from: InvoiceStatus,
        event: StatusEvent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Certificate,
    Signature,
    Endpoint,
    Rejected,
    Inconclusive,
}

/// Why an invoice ended up in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    kind: FailureKind,
    message: String,
    requires_reconciliation: bool,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            requires_reconciliation: kind == FailureKind::Inconclusive,
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when the authority may have accepted the document despite the local failure.
    pub fn requires_reconciliation(&self) -> bool {
        self.requires_reconciliation
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    id: InvoiceId,
    company_id: CompanyId,
    external_reference: String,
    payload: InvoicePayload,
    status: InvoiceStatus,
    signed_document: Option<String>,
    protocol_number: Option<String>,
    last_error: Option<FailureCause>,
    updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Create a pending invoice. The external reference falls back to the RPS number and series.
    pub fn new(
        company_id: CompanyId,
        external_reference: Option<String>,
        payload: InvoicePayload,
    ) -> Self {
        let external_reference = external_reference
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| payload.default_external_reference());
        Self {
            id: InvoiceId::new(),
            company_id,
            external_reference,
            payload,
            status: InvoiceStatus::Pending,
            signed_document: None,
            protocol_number: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> InvoiceId {
        self.id
    }

    pub fn company_id(&self) -> &CompanyId {
        &self.company_id
    }

    pub fn external_reference(&self) -> &str {
        &self.external_reference
    }

    pub fn payload(&self) -> &InvoicePayload {
        &self.payload
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn signed_document(&self) -> Option<&str> {
        self.signed_document.as_deref()
    }

    pub fn protocol_number(&self) -> Option<&str> {
        self.protocol_number.as_deref()
    }

    pub fn last_error(&self) -> Option<&FailureCause> {
        self.last_error.as_ref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Apply a status event, touching `updated_at` only when the status moved.
    pub fn apply(&mut self, event: StatusEvent) -> Result<Transition, TransitionError> {
        let transition = self.status.apply(event)?;
        if let Transition::Moved(next) = transition {
            self.status = next;
            if next != InvoiceStatus::Failed {
                self.last_error = None;
            }
            self.touch();
        }
        Ok(transition)
    }

    pub(crate) fn set_signed_document(&mut self, document: String) {
        self.signed_document = Some(document);
        self.touch();
    }

    pub(crate) fn set_protocol_number(&mut self, protocol: impl Into<String>) {
        self.protocol_number = Some(protocol.into());
        self.touch();
    }

    pub(crate) fn set_last_error(&mut self, cause: FailureCause) {
        self.last_error = Some(cause);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Fault,
    Timeout,
    NetworkError,
}

/// One network exchange with the authority. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    invoice_id: InvoiceId,
    endpoint: String,
    sequence: u32,
    outcome: AttemptOutcome,
    response_excerpt: String,
    recorded_at: DateTime<Utc>,
}

impl SubmissionAttempt {
    pub fn new(
        invoice_id: InvoiceId,
        endpoint: impl Into<String>,
        sequence: u32,
        outcome: AttemptOutcome,
        response: &str,
    ) -> Self {
        Self {
            invoice_id,
            endpoint: endpoint.into(),
            sequence,
            outcome,
            response_excerpt: excerpt(response),
            recorded_at: Utc::now(),
        }
    }

    pub fn invoice_id(&self) -> InvoiceId {
        self.invoice_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    pub fn response_excerpt(&self) -> &str {
        &self.response_excerpt
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

pub(crate) fn excerpt(text: &str) -> String {
    text.chars().take(RESPONSE_EXCERPT_LIMIT).collect()
}
