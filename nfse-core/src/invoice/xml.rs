//! Canonical ABRASF XML serialization for invoice payloads and signature blocks.
pub(crate) mod constants;

use super::{InvoicePayload, Provider, RpsIdentification, Service, ServiceValues, Taker};
use constants::{
    C14N_ALGORITHM, DS_NS, ECDSA_SHA256_ALGORITHM, ENVELOPED_SIGNATURE_TRANSFORM, NFSE_NS,
    SHA256_ALGORITHM, SIGNED_ELEMENT,
};
use helpers::{FixedPrecision, date_text, flag_code};
use quick_xml::se::{SeError, Serializer as QuickXmlSerializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

/// XML serialization error.
#[derive(Debug, Error)]
pub enum InvoiceXmlError {
    #[error("failed to serialize invoice to XML: {source}")]
    Serialize {
        #[from]
        source: SeError,
    },
}

mod helpers {
    use chrono::NaiveDate;
    use serde::ser::{Serialize, Serializer};
    use std::fmt::{self, Display, Formatter};

    pub(super) struct FixedPrecision {
        value: f64,
        precision: usize,
    }

    impl FixedPrecision {
        pub(super) fn amount(value: f64) -> Self {
            Self {
                value,
                precision: 2,
            }
        }

        pub(super) fn rate(value: f64) -> Self {
            Self {
                value,
                precision: 4,
            }
        }
    }

    impl Display for FixedPrecision {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "{:.*}", self.precision, self.value)
        }
    }

    impl Serialize for FixedPrecision {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(self)
        }
    }

    /// ABRASF encodes yes/no flags as 1/2.
    pub(super) fn flag_code(value: bool) -> u8 {
        if value { 1 } else { 2 }
    }

    pub(super) fn date_text(date: &NaiveDate) -> String {
        date.format("%Y-%m-%d").to_string()
    }
}

/// Serialize the element that gets signed, in its canonical compact form.
///
/// The output is byte-for-byte deterministic for a given payload: fixed field
/// order, the ABRASF namespace declared on the element, optional fields omitted.
///
/// # Errors
/// Returns [`InvoiceXmlError`] if the serializer rejects a value.
pub fn canonical_xml(payload: &InvoicePayload) -> Result<String, InvoiceXmlError> {
    to_compact_xml(&DeclarationXml(payload))
}

pub(crate) fn signed_info_xml(
    reference_id: &str,
    digest_b64: &str,
) -> Result<String, InvoiceXmlError> {
    to_compact_xml(&SignedInfoXml {
        reference_uri: format!("#{reference_id}"),
        digest_b64,
    })
}

/// Assemble `<Signature>` around an already serialized `SignedInfo`.
///
/// `signed_info` is inserted verbatim so the signed bytes survive unchanged.
pub(crate) fn signature_xml(signed_info: &str, signature_b64: &str, certificate_b64: &str) -> String {
    format!(
        "<Signature xmlns=\"{DS_NS}\">{signed_info}<SignatureValue>{signature_b64}</SignatureValue><KeyInfo><X509Data><X509Certificate>{certificate_b64}</X509Certificate></X509Data></KeyInfo></Signature>"
    )
}

/// Wrap the signed element and its signature in the `GerarNfseEnvio` request document.
pub(crate) fn request_document(declaration: &str, signature: &str) -> String {
    format!("<GerarNfseEnvio xmlns=\"{NFSE_NS}\"><Rps>{declaration}{signature}</Rps></GerarNfseEnvio>")
}

fn to_compact_xml<T: Serialize>(value: &T) -> Result<String, InvoiceXmlError> {
    let mut buffer = String::with_capacity(2048);
    value.serialize(QuickXmlSerializer::new(&mut buffer))?;
    Ok(buffer)
}

struct DeclarationXml<'a>(&'a InvoicePayload);

impl Serialize for DeclarationXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let payload = self.0;
        let mut st = s.serialize_struct(SIGNED_ELEMENT, 10)?;
        st.serialize_field("@xmlns", NFSE_NS)?;
        st.serialize_field("@Id", &payload.reference_id())?;
        st.serialize_field("Rps", &RpsXml(&payload.rps))?;
        st.serialize_field("Competencia", &date_text(&payload.competencia))?;
        st.serialize_field("Servico", &ServiceXml(&payload.servico))?;
        st.serialize_field("Prestador", &ProviderXml(&payload.prestador))?;
        if let Some(taker) = &payload.tomador {
            st.serialize_field("TomadorServico", &TakerXml(taker))?;
        }
        st.serialize_field(
            "OptanteSimplesNacional",
            &flag_code(payload.optante_simples_nacional),
        )?;
        st.serialize_field("IncentivoFiscal", &flag_code(payload.incentivo_fiscal))?;
        st.end()
    }
}

struct RpsXml<'a>(&'a RpsIdentification);

impl Serialize for RpsXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct IdentificationXml<'a>(&'a RpsIdentification);

        impl Serialize for IdentificationXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("IdentificacaoRps", 3)?;
                st.serialize_field("Numero", self.0.numero.trim())?;
                st.serialize_field("Serie", self.0.serie.trim())?;
                st.serialize_field("Tipo", &self.0.tipo)?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("Rps", 3)?;
        st.serialize_field("IdentificacaoRps", &IdentificationXml(self.0))?;
        st.serialize_field("DataEmissao", &date_text(&self.0.data_emissao))?;
        st.serialize_field("Status", &1u8)?;
        st.end()
    }
}

struct ValuesXml<'a>(&'a ServiceValues);

impl Serialize for ValuesXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let values = self.0;
        let mut st = s.serialize_struct("Valores", 7)?;
        st.serialize_field(
            "ValorServicos",
            &FixedPrecision::amount(values.valor_servicos),
        )?;
        let optional_amounts = [
            ("ValorDeducoes", values.valor_deducoes),
            ("ValorPis", values.valor_pis),
            ("ValorCofins", values.valor_cofins),
            ("ValorIss", values.valor_iss),
        ];
        for (tag, value) in optional_amounts {
            if let Some(value) = value {
                st.serialize_field(tag, &FixedPrecision::amount(value))?;
            }
        }
        if let Some(rate) = values.aliquota {
            st.serialize_field("Aliquota", &FixedPrecision::rate(rate))?;
        }
        if let Some(discount) = values.desconto_incondicionado {
            st.serialize_field("DescontoIncondicionado", &FixedPrecision::amount(discount))?;
        }
        st.end()
    }
}

struct ServiceXml<'a>(&'a Service);

impl Serialize for ServiceXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let service = self.0;
        let mut st = s.serialize_struct("Servico", 7)?;
        st.serialize_field("Valores", &ValuesXml(&service.valores))?;
        st.serialize_field("IssRetido", &flag_code(service.iss_retido))?;
        st.serialize_field("ItemListaServico", service.item_lista_servico.trim())?;
        if let Some(cnae) = service.codigo_cnae.as_deref() {
            st.serialize_field("CodigoCnae", cnae.trim())?;
        }
        st.serialize_field("Discriminacao", service.discriminacao.trim())?;
        st.serialize_field("CodigoMunicipio", service.codigo_municipio.trim())?;
        st.serialize_field("ExigibilidadeISS", &service.exigibilidade_iss)?;
        st.end()
    }
}

/// `CpfCnpj` choice: 11 digits is a CPF, anything else a CNPJ.
struct DocumentNumberXml<'a>(&'a str);

impl Serialize for DocumentNumberXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let number = self.0.trim();
        let tag = if number.len() == 11 { "Cpf" } else { "Cnpj" };
        let mut st = s.serialize_struct("CpfCnpj", 1)?;
        st.serialize_field(tag, number)?;
        st.end()
    }
}

struct ProviderXml<'a>(&'a Provider);

impl Serialize for ProviderXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("Prestador", 2)?;
        st.serialize_field("CpfCnpj", &DocumentNumberXml(&self.0.cnpj))?;
        if let Some(registration) = self.0.inscricao_municipal.as_deref() {
            st.serialize_field("InscricaoMunicipal", registration.trim())?;
        }
        st.end()
    }
}

struct TakerXml<'a>(&'a Taker);

impl Serialize for TakerXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct IdentificationXml<'a>(&'a str);

        impl Serialize for IdentificationXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("IdentificacaoTomador", 1)?;
                st.serialize_field("CpfCnpj", &DocumentNumberXml(self.0))?;
                st.end()
            }
        }

        struct ContactXml<'a>(&'a str);

        impl Serialize for ContactXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("Contato", 1)?;
                st.serialize_field("Email", self.0.trim())?;
                st.end()
            }
        }

        let taker = self.0;
        let mut st = s.serialize_struct("TomadorServico", 3)?;
        st.serialize_field("IdentificacaoTomador", &IdentificationXml(&taker.cpf_cnpj))?;
        st.serialize_field("RazaoSocial", taker.razao_social.trim())?;
        if let Some(email) = taker.email.as_deref() {
            st.serialize_field("Contato", &ContactXml(email))?;
        }
        st.end()
    }
}

struct AlgorithmXml(&'static str);

impl Serialize for AlgorithmXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("Algorithm", 1)?;
        st.serialize_field("@Algorithm", self.0)?;
        st.end()
    }
}

struct SignedInfoXml<'a> {
    reference_uri: String,
    digest_b64: &'a str,
}

impl Serialize for SignedInfoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct TransformsXml;

        impl Serialize for TransformsXml {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("Transforms", 1)?;
                st.serialize_field(
                    "Transform",
                    &[
                        AlgorithmXml(ENVELOPED_SIGNATURE_TRANSFORM),
                        AlgorithmXml(C14N_ALGORITHM),
                    ][..],
                )?;
                st.end()
            }
        }

        struct ReferenceXml<'a> {
            uri: &'a str,
            digest_b64: &'a str,
        }

        impl Serialize for ReferenceXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("Reference", 4)?;
                st.serialize_field("@URI", self.uri)?;
                st.serialize_field("Transforms", &TransformsXml)?;
                st.serialize_field("DigestMethod", &AlgorithmXml(SHA256_ALGORITHM))?;
                st.serialize_field("DigestValue", self.digest_b64)?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("SignedInfo", 4)?;
        st.serialize_field("@xmlns", DS_NS)?;
        st.serialize_field("CanonicalizationMethod", &AlgorithmXml(C14N_ALGORITHM))?;
        st.serialize_field("SignatureMethod", &AlgorithmXml(ECDSA_SHA256_ALGORITHM))?;
        st.serialize_field(
            "Reference",
            &ReferenceXml {
                uri: &self.reference_uri,
                digest_b64: self.digest_b64,
            },
        )?;
        st.end()
    }
}
