pub(crate) const NFSE_NS: &str = "http://www.abrasf.org.br/nfse.xsd";
pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub(crate) const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub(crate) const NFSE_WS_NS: &str = "http://nfse.abrasf.org.br";

pub(crate) const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub(crate) const ECDSA_SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";
pub(crate) const SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub(crate) const ENVELOPED_SIGNATURE_TRANSFORM: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

pub(crate) const SIGNED_ELEMENT: &str = "InfDeclaracaoPrestacaoServico";
pub(crate) const LAYOUT_VERSION: &str = "2.04";
