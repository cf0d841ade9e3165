// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Apple trust policies.
//!
//! Apple operating systems have a number of pre-canned trust policies
//! that must be fulfilled in order to trust signed code. These are
//! often based off the presence of specific X.509 certificates in the
//! issuing chain and/or the presence of attributes in X.509 certificates.
//!
//! The policies defined here are resolvable as named anchors, so a
//! requirement can say `anchor apple developer-id-notarized-executable`.
//!
//! Apple's certificates can be found at
//! <https://www.apple.com/certificateauthority/>.

use {
    crate::{
        certificate::{
            CertificateVerifier, SubjectField, OID_CA_EXTENSION_APPLE_WORLDWIDE_DEVELOPER_RELATIONS,
            OID_CA_EXTENSION_DEVELOPER_ID, OID_EXTENSION_DEVELOPER_ID_APPLICATION,
            OID_EXTENSION_DEVELOPER_ID_INSTALLER,
        },
        code_requirement::{
            CodeRequirementExpression, CodeRequirementMatchExpression, RequirementProgram,
        },
        error::AppleCodeIdentityError,
        fragments::{FragmentKind, FragmentSource},
    },
    once_cell::sync::Lazy,
    std::{borrow::Cow, ops::Deref},
    x509_certificate::CapturedX509Certificate,
};

/// Code signing requirement for Mac Developer ID.
///
/// `anchor apple generic and certificate 1[field.1.2.840.113635.100.6.2.6] exists and
/// (certificate leaf[field.1.2.840.113635.100.6.1.14] or certificate leaf[field.1.2.840.113635.100.6.1.13])`
static POLICY_MAC_DEVELOPER_ID: Lazy<CodeRequirementExpression<'static>> = Lazy::new(|| {
    CodeRequirementExpression::And(
        Box::new(developer_id_issued()),
        Box::new(CodeRequirementExpression::Or(
            Box::new(leaf_extension(OID_EXTENSION_DEVELOPER_ID_INSTALLER.0)),
            Box::new(leaf_extension(OID_EXTENSION_DEVELOPER_ID_APPLICATION.0)),
        )),
    )
});

/// Notarized executable.
///
/// `anchor apple generic and certificate 1[field.1.2.840.113635.100.6.2.6] exists and
/// certificate leaf[field.1.2.840.113635.100.6.1.13] exists and notarized`
static POLICY_NOTARIZED_EXECUTABLE: Lazy<CodeRequirementExpression<'static>> = Lazy::new(|| {
    CodeRequirementExpression::And(
        Box::new(CodeRequirementExpression::And(
            Box::new(developer_id_issued()),
            Box::new(leaf_extension(OID_EXTENSION_DEVELOPER_ID_APPLICATION.0)),
        )),
        Box::new(CodeRequirementExpression::Notarized),
    )
});

/// Notarized installer.
///
/// `anchor apple generic and certificate 1[field.1.2.840.113635.100.6.2.6] exists
/// and (certificate leaf[field.1.2.840.113635.100.6.1.14] or certificate
/// leaf[field.1.2.840.113635.100.6.1.13]) and notarized`
static POLICY_NOTARIZED_INSTALLER: Lazy<CodeRequirementExpression<'static>> = Lazy::new(|| {
    CodeRequirementExpression::And(
        Box::new(POLICY_MAC_DEVELOPER_ID.clone()),
        Box::new(CodeRequirementExpression::Notarized),
    )
});

/// `anchor apple generic and certificate 1[field.1.2.840.113635.100.6.2.6] exists`
fn developer_id_issued() -> CodeRequirementExpression<'static> {
    CodeRequirementExpression::And(
        Box::new(CodeRequirementExpression::AnchorAppleGeneric),
        Box::new(CodeRequirementExpression::CertificateGeneric(
            1,
            OID_CA_EXTENSION_DEVELOPER_ID,
            CodeRequirementMatchExpression::Exists,
        )),
    )
}

fn leaf_extension(oid: &'static [u8]) -> CodeRequirementExpression<'static> {
    CodeRequirementExpression::CertificateGeneric(
        0,
        bcder::Oid(oid),
        CodeRequirementMatchExpression::Exists,
    )
}

/// Defines well-known execution policies for signed code.
///
/// Instances can be obtained from a human-readable string for convenience. Those
/// strings are:
///
/// * `developer-id-signed`
/// * `developer-id-notarized-executable`
/// * `developer-id-notarized-installer`
///
/// The same strings name the policies as anchor fragments.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionPolicy {
    /// Code is signed by a certificate authorized for signing Mac applications or
    /// installers and that certificate was issued by Apple's Developer ID
    /// certificate authority.
    DeveloperIdSigned,

    /// Like [Self::DeveloperIdSigned] but only applies to executables (not installers)
    /// and the executable must be notarized.
    DeveloperIdNotarizedExecutable,

    /// Like [Self::DeveloperIdSigned] but the installer must be notarized.
    DeveloperIdNotarizedInstaller,
}

impl Deref for ExecutionPolicy {
    type Target = CodeRequirementExpression<'static>;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::DeveloperIdSigned => POLICY_MAC_DEVELOPER_ID.deref(),
            Self::DeveloperIdNotarizedExecutable => POLICY_NOTARIZED_EXECUTABLE.deref(),
            Self::DeveloperIdNotarizedInstaller => POLICY_NOTARIZED_INSTALLER.deref(),
        }
    }
}

impl TryFrom<&str> for ExecutionPolicy {
    type Error = AppleCodeIdentityError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "developer-id-signed" => Ok(Self::DeveloperIdSigned),
            "developer-id-notarized-executable" => Ok(Self::DeveloperIdNotarizedExecutable),
            "developer-id-notarized-installer" => Ok(Self::DeveloperIdNotarizedInstaller),
            _ => Err(AppleCodeIdentityError::RequirementUnsupported(format!(
                "unknown execution policy: {}",
                s
            ))),
        }
    }
}

impl ExecutionPolicy {
    pub fn all() -> &'static [Self] {
        &[
            Self::DeveloperIdSigned,
            Self::DeveloperIdNotarizedExecutable,
            Self::DeveloperIdNotarizedInstaller,
        ]
    }

    /// The name this policy is resolvable by as a named anchor.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeveloperIdSigned => "developer-id-signed",
            Self::DeveloperIdNotarizedExecutable => "developer-id-notarized-executable",
            Self::DeveloperIdNotarizedInstaller => "developer-id-notarized-installer",
        }
    }
}

/// Serves [ExecutionPolicy] requirements as named anchor fragments.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutionPolicyFragmentSource;

impl FragmentSource for ExecutionPolicyFragmentSource {
    fn load(
        &self,
        name: &str,
        kind: FragmentKind,
    ) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
        if kind != FragmentKind::AnchorRequirement {
            return Ok(None);
        }

        match ExecutionPolicy::try_from(name) {
            Ok(policy) => Ok(Some(
                RequirementProgram::Expression(policy.deref().clone()).to_blob_data()?,
            )),
            Err(_) => Ok(None),
        }
    }
}

/// Derive the implicit designated requirement for code lacking an explicit one.
///
/// `chain` is the signing certificate chain, leaf first. Ad-hoc signed code
/// (no chain) is pinned to its code directory hash.
pub fn derive_designated_requirement(
    chain: &[CapturedX509Certificate],
    verifier: &dyn CertificateVerifier,
    identifier: &str,
    cdhash: &[u8],
) -> Result<CodeRequirementExpression<'static>, AppleCodeIdentityError> {
    let (leaf, anchor) = match (chain.first(), chain.last()) {
        (Some(leaf), Some(anchor)) => (leaf, anchor),
        _ => {
            return Ok(CodeRequirementExpression::CodeDirectoryHash(Cow::Owned(
                cdhash.to_vec(),
            )))
        }
    };

    let leaf_string = |field| -> Result<Option<String>, AppleCodeIdentityError> {
        Ok(verifier
            .subject_field(leaf, field)?
            .and_then(|v| v.into_string()))
    };

    let identity = if verifier.is_apple_root(anchor) {
        let developer_id = chain
            .get(1)
            .map(|ca| verifier.has_extension(ca, OID_CA_EXTENSION_DEVELOPER_ID.as_ref()))
            .unwrap_or(false);

        if developer_id {
            let team_id = leaf_string(SubjectField::OrganizationalUnit)?.ok_or_else(|| {
                AppleCodeIdentityError::RequirementUnsupported(
                    "Developer ID certificate lacks a team identifier".into(),
                )
            })?;

            CodeRequirementExpression::And(
                Box::new(developer_id_issued()),
                Box::new(CodeRequirementExpression::And(
                    Box::new(leaf_extension(OID_EXTENSION_DEVELOPER_ID_APPLICATION.0)),
                    Box::new(CodeRequirementExpression::CertificateField(
                        0,
                        "subject.OU".into(),
                        CodeRequirementMatchExpression::Equal(team_id.into()),
                    )),
                )),
            )
        } else {
            let cn = leaf_string(SubjectField::CommonName)?.ok_or_else(|| {
                AppleCodeIdentityError::RequirementUnsupported(
                    "signing certificate lacks a common name".into(),
                )
            })?;

            CodeRequirementExpression::And(
                Box::new(CodeRequirementExpression::AnchorAppleGeneric),
                Box::new(CodeRequirementExpression::And(
                    Box::new(CodeRequirementExpression::CertificateField(
                        0,
                        "subject.CN".into(),
                        CodeRequirementMatchExpression::Equal(cn.into()),
                    )),
                    Box::new(CodeRequirementExpression::CertificateGeneric(
                        1,
                        OID_CA_EXTENSION_APPLE_WORLDWIDE_DEVELOPER_RELATIONS,
                        CodeRequirementMatchExpression::Exists,
                    )),
                )),
            )
        }
    } else {
        CodeRequirementExpression::AnchorCertificateHash(
            -1,
            Cow::Owned(verifier.certificate_hash(anchor)),
        )
    };

    Ok(CodeRequirementExpression::And(
        Box::new(CodeRequirementExpression::Identifier(Cow::Owned(
            identifier.to_string(),
        ))),
        Box::new(identity),
    ))
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{certificate::X509CertificateVerifier, testutil::unit_tester_certificate},
    };

    #[test]
    fn get_policies() {
        for policy in ExecutionPolicy::all() {
            policy.to_bytes().unwrap();
            assert_eq!(ExecutionPolicy::try_from(policy.name()).unwrap(), *policy);
        }

        assert_eq!(
            ExecutionPolicy::DeveloperIdNotarizedExecutable.to_string(),
            "(((anchor apple generic) and (certificate 1[field.1.2.840.113635.100.6.2.6] /* exists */)) \
            and (certificate leaf[field.1.2.840.113635.100.6.1.13] /* exists */)) and (notarized)"
        );
    }

    #[test]
    fn policies_are_named_anchors() -> Result<(), AppleCodeIdentityError> {
        let source = ExecutionPolicyFragmentSource::default();

        let blob = source
            .load("developer-id-signed", FragmentKind::AnchorRequirement)?
            .expect("policy resolves");
        assert_eq!(
            RequirementProgram::parse_blob(&blob)?,
            RequirementProgram::Expression(ExecutionPolicy::DeveloperIdSigned.deref().clone())
        );

        assert!(source
            .load("developer-id-signed", FragmentKind::SubRequirement)?
            .is_none());
        assert!(source
            .load("unknown", FragmentKind::AnchorRequirement)?
            .is_none());

        Ok(())
    }

    #[test]
    fn designated_requirement_derivation() -> Result<(), AppleCodeIdentityError> {
        let verifier = X509CertificateVerifier::default();

        let adhoc = derive_designated_requirement(&[], &verifier, "com.example", &[0xaa; 20])?;
        assert_eq!(
            adhoc,
            CodeRequirementExpression::CodeDirectoryHash(vec![0xaa; 20].into())
        );

        let cert = unit_tester_certificate();
        let expr = derive_designated_requirement(
            &[cert.clone()],
            &verifier,
            "com.example",
            &[0xaa; 20],
        )?;
        assert_eq!(
            expr,
            CodeRequirementExpression::And(
                Box::new(CodeRequirementExpression::Identifier("com.example".into())),
                Box::new(CodeRequirementExpression::AnchorCertificateHash(
                    -1,
                    verifier.certificate_hash(&cert).into()
                )),
            )
        );

        // Pretend the unit test certificate is an Apple root.
        let verifier = X509CertificateVerifier::default()
            .with_apple_root_hash(verifier.certificate_hash(&cert));
        let expr = derive_designated_requirement(&[cert], &verifier, "com.example", &[])?;
        assert_eq!(
            expr.to_string(),
            "(identifier \"com.example\") and ((anchor apple generic) and \
            ((certificate leaf[subject.CN] = \"Unit Tester\") and \
            (certificate 1[field.1.2.840.113635.100.6.2.1] /* exists */)))"
        );

        Ok(())
    }
}
