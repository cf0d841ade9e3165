// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functionality related to certificates.

use {
    crate::error::AppleCodeIdentityError,
    bcder::{decode::Constructed, ConstOid, Mode, Oid},
    chrono::{DateTime, NaiveDateTime, TimeZone, Utc},
    cryptographic_message_syntax::SignedData,
    std::{collections::HashSet, fmt::Debug},
    x509_certificate::{
        rfc4519::{
            OID_COMMON_NAME, OID_COUNTRY_NAME, OID_LOCALITY_NAME, OID_ORGANIZATIONAL_UNIT_NAME,
            OID_ORGANIZATION_NAME, OID_STATE_PROVINCE_NAME,
        },
        CapturedX509Certificate,
    },
};

/// Certificate policies extension.
///
/// 2.5.29.32
const OID_CERTIFICATE_POLICIES: ConstOid = Oid(&[85, 29, 32]);

/// Street address.
///
/// 2.5.4.9
const OID_STREET_ADDRESS: ConstOid = Oid(&[85, 4, 9]);

/// Description.
///
/// 2.5.4.13
const OID_DESCRIPTION: ConstOid = Oid(&[85, 4, 13]);

/// UserID.
///
/// 0.9.2342.19200300.100.1.1
pub const OID_USER_ID: ConstOid = Oid(&[9, 146, 38, 137, 147, 242, 44, 100, 1, 1]);

/// OID used for email address in subject Name field.
const OID_EMAIL_ADDRESS: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 1]);

/// Developer ID Application.
///
/// 1.2.840.113635.100.6.1.13
pub const OID_EXTENSION_DEVELOPER_ID_APPLICATION: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 99, 100, 6, 1, 13]);

/// Developer ID Installer.
///
/// 1.2.840.113635.100.6.1.14
pub const OID_EXTENSION_DEVELOPER_ID_INSTALLER: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 99, 100, 6, 1, 14]);

/// Developer ID Kernel.
///
/// 1.2.840.113635.100.6.1.18
pub const OID_EXTENSION_DEVELOPER_ID_KERNEL: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 99, 100, 6, 1, 18]);

/// Developer ID date.
///
/// 1.2.840.113635.100.6.1.33
pub const OID_EXTENSION_DEVELOPER_ID_DATE: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 99, 100, 6, 1, 33]);

/// Apple Worldwide Developer Relations certificate authority.
///
/// 1.2.840.113635.100.6.2.1
pub const OID_CA_EXTENSION_APPLE_WORLDWIDE_DEVELOPER_RELATIONS: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 99, 100, 6, 2, 1]);

/// Developer ID certificate authority.
///
/// 1.2.840.113635.100.6.2.6
pub const OID_CA_EXTENSION_DEVELOPER_ID: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 99, 100, 6, 2, 6]);

/// SHA-1 fingerprints of the Apple root certificate authorities.
///
/// These are `Apple Root CA` and `Apple Root CA - G3`.
pub const APPLE_ROOT_CERTIFICATE_SHA1: &[&str] = &[
    "611e5b662c593a08ff58d14ae22452d198df6c60",
    "b52cb02fd567e0359fe8fa4d4c41037970fe01b0",
];

/// Common Name of the intermediate that issues Apple's own code signing certificates.
pub const APPLE_CODE_SIGNING_CA_COMMON_NAME: &str = "Apple Code Signing Certification Authority";

/// Organization of Apple issued certificates.
pub const APPLE_ORGANIZATION: &str = "Apple Inc.";

/// A subject distinguished name component addressable from requirements.
///
/// Requirements name these as `subject.<field>`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubjectField {
    Country,
    CommonName,
    Description,
    Locality,
    Organization,
    OrganizationalUnit,
    Street,
    StateProvince,
    UserId,
    /// All email addresses, as an array.
    Email,
}

impl SubjectField {
    /// Resolve a requirement field name like `subject.CN`.
    pub fn from_requirement_field(name: &str) -> Option<Self> {
        match name.strip_prefix("subject.")? {
            "C" => Some(Self::Country),
            "CN" => Some(Self::CommonName),
            "D" => Some(Self::Description),
            "L" => Some(Self::Locality),
            "O" => Some(Self::Organization),
            "OU" => Some(Self::OrganizationalUnit),
            "STREET" => Some(Self::Street),
            "ST" => Some(Self::StateProvince),
            "UID" => Some(Self::UserId),
            "email" => Some(Self::Email),
            _ => None,
        }
    }

    fn oid(&self) -> &'static ConstOid {
        match self {
            Self::Country => &OID_COUNTRY_NAME,
            Self::CommonName => &OID_COMMON_NAME,
            Self::Description => &OID_DESCRIPTION,
            Self::Locality => &OID_LOCALITY_NAME,
            Self::Organization => &OID_ORGANIZATION_NAME,
            Self::OrganizationalUnit => &OID_ORGANIZATIONAL_UNIT_NAME,
            Self::Street => &OID_STREET_ADDRESS,
            Self::StateProvince => &OID_STATE_PROVINCE_NAME,
            Self::UserId => &OID_USER_ID,
            Self::Email => &OID_EMAIL_ADDRESS,
        }
    }
}

/// Obtain the SHA-1 digest of a certificate's DER encoding.
pub fn certificate_sha1(cert: &CapturedX509Certificate) -> Vec<u8> {
    ring::digest::digest(
        &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
        cert.constructed_data(),
    )
    .as_ref()
    .to_vec()
}

fn find_extension_value(cert: &CapturedX509Certificate, oid: &[u8]) -> Option<Vec<u8>> {
    let cert: &x509_certificate::rfc5280::Certificate = cert.as_ref();

    cert.iter_extensions()
        .find(|extension| extension.id.as_ref() == oid)
        .map(|extension| extension.value.clone().into_bytes().to_vec())
}

/// Decode the policy identifiers of a certificatePolicies extension value.
fn decode_policy_identifiers(data: &[u8]) -> Result<Vec<Vec<u8>>, AppleCodeIdentityError> {
    Constructed::decode(data, Mode::Der, |cons| {
        cons.take_sequence(|cons| {
            let mut oids = vec![];

            while let Some(oid) = cons.take_opt_sequence(|cons| {
                let oid = Oid::take_from(cons)?;
                cons.skip_all()?;
                Ok(oid)
            })? {
                oids.push(oid.as_ref().to_vec());
            }

            Ok(oids)
        })
    })
    .map_err(|e| AppleCodeIdentityError::CertificateDecode(format!("{:?}", e)))
}

/// Decode a DER GeneralizedTime or UTCTime.
fn decode_time(data: &[u8]) -> Option<DateTime<Utc>> {
    let (tag, len) = (*data.first()?, *data.get(1)? as usize);
    let content = std::str::from_utf8(data.get(2..2 + len)?).ok()?;

    let format = match tag {
        0x18 => "%Y%m%d%H%M%SZ",
        0x17 => "%y%m%d%H%M%SZ",
        _ => return None,
    };

    NaiveDateTime::parse_from_str(content, format)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Answers questions about certificates on behalf of the requirement interpreter.
///
/// Besides inspecting certificates and consulting its own notion of trust, an
/// implementation verifies that a chain is cryptographically linked.
pub trait CertificateVerifier: Debug + Send + Sync {
    /// Verify that every certificate in a chain is signed by its successor.
    ///
    /// The chain is ordered leaf first. A self-signed final certificate must
    /// verify against itself.
    fn verify_chain(&self, chain: &[CapturedX509Certificate]) -> Result<(), AppleCodeIdentityError> {
        for pair in chain.windows(2) {
            pair[0].verify_signed_by_certificate(&pair[1]).map_err(|e| {
                AppleCodeIdentityError::SignatureInvalid(format!(
                    "certificate {:?} is not signed by its issuer {:?}: {}",
                    pair[0].subject_common_name(),
                    pair[1].subject_common_name(),
                    e
                ))
            })?;
        }

        if let Some(anchor) = chain.last() {
            if anchor.subject_is_issuer() {
                anchor.verify_signed_by_certificate(anchor).map_err(|e| {
                    AppleCodeIdentityError::SignatureInvalid(format!(
                        "self-signed certificate {:?} does not verify: {}",
                        anchor.subject_common_name(),
                        e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// The hash of a certificate as used by `anchor H"..."` expressions.
    fn certificate_hash(&self, cert: &CapturedX509Certificate) -> Vec<u8> {
        certificate_sha1(cert)
    }

    /// Resolve a subject name component.
    ///
    /// Returns `None` if the certificate doesn't have the component.
    fn subject_field(
        &self,
        cert: &CapturedX509Certificate,
        field: SubjectField,
    ) -> Result<Option<plist::Value>, AppleCodeIdentityError>;

    /// Whether the certificate carries an extension with the given OID.
    fn has_extension(&self, cert: &CapturedX509Certificate, oid: &[u8]) -> bool;

    /// Whether the certificate asserts the given policy OID.
    fn has_policy(
        &self,
        cert: &CapturedX509Certificate,
        oid: &[u8],
    ) -> Result<bool, AppleCodeIdentityError>;

    /// Obtain a date stored in the extension with the given OID.
    fn extension_date(
        &self,
        cert: &CapturedX509Certificate,
        oid: &[u8],
    ) -> Result<Option<DateTime<Utc>>, AppleCodeIdentityError>;

    /// Whether the certificate is trusted for code signing by local policy.
    fn is_trusted(&self, cert: &CapturedX509Certificate) -> bool;

    /// Whether the certificate is an Apple root certificate authority.
    fn is_apple_root(&self, cert: &CapturedX509Certificate) -> bool;
}

/// A [CertificateVerifier] backed by the `x509-certificate` crate.
#[derive(Clone, Debug)]
pub struct X509CertificateVerifier {
    apple_roots: HashSet<Vec<u8>>,
    trusted: HashSet<Vec<u8>>,
}

impl Default for X509CertificateVerifier {
    fn default() -> Self {
        Self {
            apple_roots: APPLE_ROOT_CERTIFICATE_SHA1
                .iter()
                .filter_map(|h| hex::decode(h).ok())
                .collect(),
            trusted: HashSet::new(),
        }
    }
}

impl X509CertificateVerifier {
    /// Trust certificates having the given SHA-1 fingerprints.
    pub fn with_trusted_hashes(mut self, hashes: impl IntoIterator<Item = Vec<u8>>) -> Self {
        self.trusted.extend(hashes);
        self
    }

    /// Recognize an additional certificate as an Apple root.
    pub fn with_apple_root_hash(mut self, hash: Vec<u8>) -> Self {
        self.apple_roots.insert(hash);
        self
    }
}

impl CertificateVerifier for X509CertificateVerifier {
    fn subject_field(
        &self,
        cert: &CapturedX509Certificate,
        field: SubjectField,
    ) -> Result<Option<plist::Value>, AppleCodeIdentityError> {
        let oid = Oid(field.oid().0.into());
        let name = cert.subject_name();

        if field == SubjectField::Email {
            let addresses = name
                .iter_by_oid(oid)
                .map(|atv| {
                    atv.to_string()
                        .map(plist::Value::String)
                        .map_err(|e| AppleCodeIdentityError::CertificateDecode(format!("{:?}", e)))
                })
                .collect::<Result<Vec<_>, _>>()?;

            return Ok(if addresses.is_empty() {
                None
            } else {
                Some(plist::Value::Array(addresses))
            });
        }

        Ok(name
            .find_first_attribute_string(oid)
            .map_err(|e| AppleCodeIdentityError::CertificateDecode(format!("{:?}", e)))?
            .map(plist::Value::String))
    }

    fn has_extension(&self, cert: &CapturedX509Certificate, oid: &[u8]) -> bool {
        find_extension_value(cert, oid).is_some()
    }

    fn has_policy(
        &self,
        cert: &CapturedX509Certificate,
        oid: &[u8],
    ) -> Result<bool, AppleCodeIdentityError> {
        match find_extension_value(cert, OID_CERTIFICATE_POLICIES.as_ref()) {
            Some(value) => Ok(decode_policy_identifiers(&value)?
                .iter()
                .any(|policy| policy == oid)),
            None => Ok(false),
        }
    }

    fn extension_date(
        &self,
        cert: &CapturedX509Certificate,
        oid: &[u8],
    ) -> Result<Option<DateTime<Utc>>, AppleCodeIdentityError> {
        Ok(find_extension_value(cert, oid).and_then(|value| decode_time(&value)))
    }

    fn is_trusted(&self, cert: &CapturedX509Certificate) -> bool {
        self.trusted.contains(&certificate_sha1(cert))
    }

    fn is_apple_root(&self, cert: &CapturedX509Certificate) -> bool {
        self.apple_roots.contains(&certificate_sha1(cert))
    }
}

/// Verify a detached CMS signature over a code directory.
///
/// Every signer's signature must verify and its `message-digest` attribute
/// must match the code directory bytes.
pub fn verify_cms_signature(
    signed_data: &SignedData,
    code_directory: &[u8],
) -> Result<(), AppleCodeIdentityError> {
    let mut signers = 0;

    for signer in signed_data.signers() {
        signer.verify_signature_with_signed_data(signed_data)?;
        signer.verify_message_digest_with_content(code_directory)?;
        signers += 1;
    }

    if signers == 0 {
        return Err(AppleCodeIdentityError::SignatureInvalid(
            "CMS signature has no signers".into(),
        ));
    }

    Ok(())
}

/// Resolve and verify the signing certificate chain of a CMS signature.
///
/// The CMS signature must cover `code_directory` and the resulting chain must
/// pass [CertificateVerifier::verify_chain].
pub fn verified_certificate_chain(
    signed_data: &SignedData,
    code_directory: &[u8],
    verifier: &dyn CertificateVerifier,
) -> Result<Vec<CapturedX509Certificate>, AppleCodeIdentityError> {
    verify_cms_signature(signed_data, code_directory)?;

    let chain = certificate_chain(signed_data);
    verifier.verify_chain(&chain)?;

    Ok(chain)
}

/// Resolve the signing certificate chain of a CMS signature.
///
/// The chain is ordered leaf first, then its issuers, as far as the
/// certificates embedded in the signature allow. Issuers are matched by name
/// only; see [verified_certificate_chain].
fn certificate_chain(signed_data: &SignedData) -> Vec<CapturedX509Certificate> {
    let certs = signed_data.certificates().collect::<Vec<_>>();

    let leaf = signed_data.signers().find_map(|signer| {
        let (issuer, serial) = signer.certificate_issuer_and_serial()?;

        certs
            .iter()
            .find(|cert| cert.issuer_name() == issuer && cert.serial_number_asn1() == serial)
            .copied()
    });

    let mut chain: Vec<CapturedX509Certificate> = vec![];

    let mut current = match leaf {
        Some(cert) => cert,
        None => return chain,
    };

    loop {
        chain.push(current.clone());

        if current.subject_is_issuer() || chain.len() > certs.len() {
            break;
        }

        match certs
            .iter()
            .find(|cert| cert.subject_name() == current.issuer_name())
        {
            Some(issuer) => current = *issuer,
            None => break,
        }
    }

    chain
}
