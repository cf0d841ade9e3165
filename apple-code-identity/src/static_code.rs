// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code on disk and validation of requirements against it.

[StaticCode] combines a [DiskRepresentation] with views over its signature.
[RequirementValidator] evaluates requirement programs against a
[StaticCode].
*/

use {
    crate::{
        certificate::{verified_certificate_chain, CertificateVerifier, X509CertificateVerifier},
        code_directory::CodeDirectoryBlob,
        code_requirement::{RequirementProgram, RequirementType},
        disk_rep::{open_disk_representation, DiskRepresentation},
        embedded_signature::{Blob, CodeSigningSlot, EmbeddedSignature},
        error::{AppleCodeIdentityError, Verdict},
        notarization::{NotarizationChecker, NotarizationService, StapledTicket},
        policy::derive_designated_requirement,
        requirement_interpreter::{EvaluationContext, LightweightRequirementEvaluator},
        ticket_lookup::OnlineNotarizationService,
        verification_settings::VerificationSettings,
    },
    log::{debug, info, warn},
    std::path::Path,
    x509_certificate::CapturedX509Certificate,
};

/// Code stored on disk.
#[derive(Debug)]
pub struct StaticCode {
    rep: Box<dyn DiskRepresentation>,
}

impl StaticCode {
    pub fn new(rep: Box<dyn DiskRepresentation>) -> Self {
        Self { rep }
    }

    /// Open code at a path, detecting its container format.
    pub fn open(
        path: impl AsRef<Path>,
        settings: &VerificationSettings,
    ) -> Result<Self, AppleCodeIdentityError> {
        Ok(Self::new(open_disk_representation(path, settings)?))
    }

    pub fn disk_representation(&self) -> &dyn DiskRepresentation {
        self.rep.as_ref()
    }

    pub fn path(&self) -> &Path {
        self.rep.path()
    }

    pub fn is_signed(&self) -> bool {
        self.rep.signature_data().is_some()
    }

    pub fn signature(&self) -> Result<Option<EmbeddedSignature<'_>>, AppleCodeIdentityError> {
        self.rep.signature()
    }

    /// The code directory with the strongest digest type.
    pub fn code_directory(
        &self,
    ) -> Result<Option<CodeDirectoryBlob<'static>>, AppleCodeIdentityError> {
        Ok(match self.signature()? {
            Some(sig) => sig.preferred_code_directory()?.map(|cd| cd.to_owned()),
            None => None,
        })
    }

    pub fn cdhash(&self) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
        self.code_directory()?.map(|cd| cd.cdhash()).transpose()
    }

    /// The signing identifier recorded in the code directory.
    pub fn identifier(&self) -> Result<Option<String>, AppleCodeIdentityError> {
        Ok(self.code_directory()?.map(|cd| cd.ident.to_string()))
    }

    pub fn entitlements(&self) -> Result<Option<plist::Dictionary>, AppleCodeIdentityError> {
        match self.signature()? {
            Some(sig) => sig.entitlements()?.map(|e| e.dictionary()).transpose(),
            None => Ok(None),
        }
    }

    pub fn info_plist(&self) -> Result<Option<plist::Dictionary>, AppleCodeIdentityError> {
        self.rep.info_plist()
    }

    /// The verified signing certificate chain, leaf first.
    ///
    /// Empty for unsigned and ad-hoc signed code. A CMS signature that doesn't
    /// cover the primary code directory, or a chain whose certificates aren't
    /// signed by their issuers, is an error.
    pub fn certificate_chain(
        &self,
        verifier: &dyn CertificateVerifier,
    ) -> Result<Vec<CapturedX509Certificate>, AppleCodeIdentityError> {
        let sig = match self.signature()? {
            Some(sig) => sig,
            None => return Ok(vec![]),
        };

        let signed_data = match sig.signed_data()? {
            Some(signed_data) => signed_data,
            None => return Ok(vec![]),
        };

        let code_directory = sig.component(CodeSigningSlot::CodeDirectory).ok_or_else(|| {
            AppleCodeIdentityError::SignatureInvalid(
                "CMS signature present without a code directory".into(),
            )
        })?;

        verified_certificate_chain(&signed_data, code_directory, verifier)
    }

    /// Blob of the designated requirement.
    ///
    /// An explicit designated requirement in the signature wins. Otherwise one
    /// is derived from the certificate chain. Unsigned code has none.
    pub fn designated_requirement_blob(
        &self,
        verifier: &dyn CertificateVerifier,
    ) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
        let sig = match self.signature()? {
            Some(sig) => sig,
            None => return Ok(None),
        };

        if let Some(reqs) = sig.code_requirements()? {
            if let Some(blob) = reqs.requirement(RequirementType::Designated) {
                return Ok(Some(blob.to_blob_bytes()?));
            }
        }

        let cd = match sig.preferred_code_directory()? {
            Some(cd) => cd,
            None => return Ok(None),
        };

        let expr = derive_designated_requirement(
            &self.certificate_chain(verifier)?,
            verifier,
            &cd.ident,
            &cd.cdhash()?,
        )?;

        debug!("derived designated requirement {}", expr);

        Ok(Some(RequirementProgram::Expression(expr).to_blob_data()?))
    }

    /// Re-read the code from disk.
    pub fn flush(&mut self) -> Result<(), AppleCodeIdentityError> {
        self.rep.flush()
    }
}

/// Validates code against requirement programs.
#[derive(Debug)]
pub struct RequirementValidator {
    settings: VerificationSettings,
    verifier: Box<dyn CertificateVerifier>,
    notarization: NotarizationChecker,
    lightweight: Option<Box<dyn LightweightRequirementEvaluator>>,
}

impl RequirementValidator {
    /// Construct an instance from settings.
    ///
    /// Certificates trusted by the settings are trusted by the default
    /// verifier. Online notarization lookups are enabled if the settings say so.
    pub fn new(settings: VerificationSettings) -> Result<Self, AppleCodeIdentityError> {
        let verifier = X509CertificateVerifier::default()
            .with_trusted_hashes(settings.trusted_certificates().iter().cloned());

        let online: Option<Box<dyn NotarizationService>> = if settings.online_notarization() {
            info!("enabling online notarization ticket lookups");
            Some(Box::new(OnlineNotarizationService::new()?))
        } else {
            None
        };

        Ok(Self {
            settings,
            verifier: Box::new(verifier),
            notarization: NotarizationChecker::new(online),
            lightweight: None,
        })
    }

    /// Use a different certificate verifier.
    pub fn with_verifier(mut self, verifier: Box<dyn CertificateVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Replace the notarization checker.
    pub fn with_notarization(mut self, checker: NotarizationChecker) -> Self {
        self.notarization = checker;
        self
    }

    /// Evaluate lightweight requirement programs with an evaluator.
    pub fn with_lightweight_evaluator(
        mut self,
        evaluator: Box<dyn LightweightRequirementEvaluator>,
    ) -> Self {
        self.lightweight = Some(evaluator);
        self
    }

    pub fn settings(&self) -> &VerificationSettings {
        &self.settings
    }

    pub fn notarization(&self) -> &NotarizationChecker {
        &self.notarization
    }

    /// Evaluate a requirement program against code.
    pub fn validate(
        &self,
        code: &StaticCode,
        program: &RequirementProgram<'_>,
    ) -> Result<bool, AppleCodeIdentityError> {
        let cd = code.code_directory()?;
        let cdhash = cd.as_ref().map(|cd| cd.cdhash()).transpose()?;
        let chain = code.certificate_chain(self.verifier.as_ref())?;
        let info = code.info_plist()?;
        let entitlements = code.entitlements()?;

        let stapled = match (&cd, &cdhash) {
            (Some(cd), Some(cdhash)) => code
                .disk_representation()
                .stapled_ticket()?
                .map(|data| {
                    debug!("{}: found stapled ticket", code.path().display());
                    StapledTicket::new(cd.hash_type, cdhash.clone(), data)
                }),
            _ => None,
        };
        let notarization = self.notarization.with_stapled(stapled);

        let mut context = EvaluationContext::new(
            self.verifier.as_ref(),
            self.settings.fragment_cache(),
            &self.settings,
        )
        .with_chain(&chain)
        .with_notarization(&notarization);

        if let (Some(cd), Some(cdhash)) = (&cd, &cdhash) {
            context = context.with_code_directory(cd, cdhash);
        }
        if let Some(info) = &info {
            context = context.with_info_plist(info);
        }
        if let Some(entitlements) = &entitlements {
            context = context.with_entitlements(entitlements);
        }
        if let Some(lightweight) = &self.lightweight {
            context = context.with_lightweight(lightweight.as_ref());
        }

        context.evaluate_program(program)
    }

    /// Evaluate the code's own designated requirement.
    ///
    /// Unsigned code never satisfies it.
    pub fn validate_designated(&self, code: &StaticCode) -> Result<bool, AppleCodeIdentityError> {
        match code.designated_requirement_blob(self.verifier.as_ref())? {
            Some(blob) => self.validate(code, &RequirementProgram::parse_blob(&blob)?),
            None => {
                warn!(
                    "{} is unsigned and has no designated requirement",
                    code.path().display()
                );
                Ok(false)
            }
        }
    }

    /// Evaluate a requirement program, folding the outcome into a [Verdict].
    pub fn verify(&self, code: &StaticCode, program: &RequirementProgram<'_>) -> Verdict {
        Verdict::from_evaluation(self.validate(code, program), program)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            code_requirement::{CodeRequirementExpression, CodeRequirementMatchExpression},
            embedded_signature::{
                BlobData, BlobWrapperBlob, CodeSigningSlot, DigestType, EntitlementsBlob,
                RequirementBlob, RequirementSetBlob,
            },
            embedded_signature_builder::EmbeddedSignatureBuilder,
            notarization::{TicketStatus, TicketVerifier},
            testutil::{generated_certificate, synthetic_macho},
        },
        cryptographic_message_syntax::{SignedDataBuilder, SignerBuilder},
        indoc::indoc,
        std::{borrow::Cow, path::PathBuf},
    };

    const ENTITLEMENTS: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
        <plist version="1.0">
        <dict>
            <key>com.apple.security.app-sandbox</key>
            <true/>
        </dict>
        </plist>
    "#};

    fn identifier(ident: &str) -> RequirementProgram<'static> {
        CodeRequirementExpression::Identifier(Cow::Owned(ident.to_string())).into()
    }

    /// How the fixture's CMS signature is produced.
    #[derive(Clone, Copy, PartialEq)]
    enum Cms {
        AdHoc,
        /// Signed over the code directory.
        CodeDirectory,
        /// Signed over bytes that aren't the code directory.
        OtherContent,
    }

    struct Fixture {
        designated: Option<RequirementProgram<'static>>,
        ticket: Option<Vec<u8>>,
        cms: Cms,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                designated: None,
                ticket: None,
                cms: Cms::AdHoc,
            }
        }
    }

    #[derive(Debug)]
    struct AcceptTicket(&'static [u8]);

    impl TicketVerifier for AcceptTicket {
        fn verify_ticket(
            &self,
            ticket: &[u8],
            _: DigestType,
            _: &[u8],
        ) -> Result<TicketStatus, AppleCodeIdentityError> {
            Ok(if ticket == self.0 {
                TicketStatus::Valid
            } else {
                TicketStatus::NotFound
            })
        }
    }

    impl Fixture {
        fn write(&self, dir: &Path) -> Result<PathBuf, AppleCodeIdentityError> {
            std::fs::create_dir_all(dir)?;
            let mut builder = EmbeddedSignatureBuilder::default();

            if let Some(program) = &self.designated {
                let mut reqs = RequirementSetBlob::default();
                reqs.set_requirements(
                    RequirementType::Designated,
                    RequirementBlob::try_from(program)?,
                );
                builder.add_blob(CodeSigningSlot::RequirementSet, &BlobData::from(reqs))?;
            }

            builder.add_blob(
                CodeSigningSlot::Entitlements,
                &BlobData::from(EntitlementsBlob::from_string(ENTITLEMENTS)),
            )?;
            builder.add_cms_signature(vec![])?;
            builder.add_code_directory(
                CodeSigningSlot::CodeDirectory,
                crate::code_directory::CodeDirectoryBlob::new(
                    "com.example.tool",
                    DigestType::Sha256,
                )?,
            )?;

            if let Some(ticket) = &self.ticket {
                builder.add_raw(
                    CodeSigningSlot::Ticket,
                    BlobWrapperBlob::from_data_owned(ticket.clone()).to_blob_bytes()?,
                );
            }

            if self.cms != Cms::AdHoc {
                let superblob = builder.create_superblob()?;
                let sig = EmbeddedSignature::from_bytes(&superblob)?;
                let code_directory = match self.cms {
                    Cms::CodeDirectory => sig.component(CodeSigningSlot::CodeDirectory).unwrap(),
                    _ => &b"not the code directory"[..],
                };

                let (cert, key) = generated_certificate("Developer", None, None);
                let der = SignedDataBuilder::default()
                    .content_external(code_directory.to_vec())
                    .signer(SignerBuilder::new(&key, cert))
                    .build_der()?;
                builder.add_cms_signature(der)?;
            }

            let path = dir.join("tool");
            std::fs::write(
                &path,
                synthetic_macho(Some([1; 16]), Some(&builder.create_superblob()?)),
            )?;

            Ok(path)
        }
    }

    #[test]
    fn static_code_views() -> Result<(), AppleCodeIdentityError> {
        let td = tempfile::tempdir()?;
        let settings = VerificationSettings::default();

        let path = Fixture {
            designated: None,
            ticket: None,
            cms: Cms::AdHoc,
        }
        .write(td.path())?;

        let code = StaticCode::open(&path, &settings)?;
        assert!(code.is_signed());
        assert_eq!(code.identifier()?.as_deref(), Some("com.example.tool"));
        assert_eq!(code.cdhash()?.map(|h| h.len()), Some(20));
        assert!(code
            .certificate_chain(&X509CertificateVerifier::default())?
            .is_empty());
        assert!(code.info_plist()?.is_none());

        let entitlements = code.entitlements()?.unwrap();
        assert_eq!(
            entitlements.get("com.apple.security.app-sandbox"),
            Some(&plist::Value::Boolean(true))
        );

        Ok(())
    }

    #[test]
    fn unsigned_code() -> Result<(), AppleCodeIdentityError> {
        crate::testutil::init_logging();

        let td = tempfile::tempdir()?;
        let settings = VerificationSettings::default();
        let path = td.path().join("tool");
        std::fs::write(&path, synthetic_macho(None, None))?;

        let code = StaticCode::open(&path, &settings)?;
        assert!(!code.is_signed());
        assert!(code.code_directory()?.is_none());
        assert!(code.cdhash()?.is_none());
        assert!(code.entitlements()?.is_none());

        let validator = RequirementValidator::new(settings)?;
        assert!(!validator.validate_designated(&code)?);
        assert!(validator
            .verify(&code, &identifier("com.example.tool"))
            .is_reject());

        Ok(())
    }

    #[test]
    fn explicit_designated_requirement() -> Result<(), AppleCodeIdentityError> {
        let td = tempfile::tempdir()?;
        let settings = VerificationSettings::default();

        let path = Fixture {
            designated: Some(identifier("com.example.tool")),
            ..Default::default()
        }
        .write(td.path())?;
        let code = StaticCode::open(&path, &settings)?;
        let validator = RequirementValidator::new(settings)?;

        let blob = code
            .designated_requirement_blob(&X509CertificateVerifier::default())?
            .unwrap();
        assert_eq!(
            RequirementProgram::parse_blob(&blob)?,
            identifier("com.example.tool")
        );
        assert!(validator.validate_designated(&code)?);

        assert!(validator
            .verify(&code, &identifier("com.example.other"))
            .is_reject());

        let sandboxed: RequirementProgram = CodeRequirementExpression::EntitlementsKey(
            "com.apple.security.app-sandbox".into(),
            CodeRequirementMatchExpression::Exists,
        )
        .into();
        assert!(validator.verify(&code, &sandboxed).is_accept());

        Ok(())
    }

    #[test]
    fn derived_designated_requirement() -> Result<(), AppleCodeIdentityError> {
        let td = tempfile::tempdir()?;
        let settings = VerificationSettings::default();

        let path = Fixture {
            designated: None,
            ticket: None,
            cms: Cms::AdHoc,
        }
        .write(td.path())?;
        let code = StaticCode::open(&path, &settings)?;
        let validator = RequirementValidator::new(settings)?;

        // Ad-hoc code is pinned to its cdhash.
        let blob = code
            .designated_requirement_blob(&X509CertificateVerifier::default())?
            .unwrap();
        let cdhash = code.cdhash()?.unwrap();
        assert_eq!(
            RequirementProgram::parse_blob(&blob)?,
            CodeRequirementExpression::CodeDirectoryHash(Cow::Owned(cdhash)).into()
        );
        assert!(validator.validate_designated(&code)?);

        Ok(())
    }

    #[test]
    fn stapled_ticket_requires_verification() -> Result<(), AppleCodeIdentityError> {
        let td = tempfile::tempdir()?;
        let notarized: RequirementProgram = CodeRequirementExpression::Notarized.into();

        let unstapled = Fixture::default().write(td.path())?;
        let stapled = Fixture {
            ticket: Some(b"ticket".to_vec()),
            ..Default::default()
        }
        .write(td.path().join("stapled").as_path())?;
        let junk = Fixture {
            ticket: Some(vec![0xff; 8]),
            ..Default::default()
        }
        .write(td.path().join("junk").as_path())?;

        // Stapled bytes alone don't make code notarized.
        let validator = RequirementValidator::new(VerificationSettings::default())?;
        for path in [&unstapled, &stapled, &junk].iter() {
            let code = StaticCode::open(path, validator.settings())?;
            assert!(!validator.validate(&code, &notarized)?);
        }

        let validator = RequirementValidator::new(VerificationSettings::default())?
            .with_notarization(
                NotarizationChecker::default()
                    .with_ticket_verifier(Box::new(AcceptTicket(b"ticket"))),
            );

        let code = StaticCode::open(&junk, validator.settings())?;
        assert!(validator.verify(&code, &notarized).is_reject());

        let code = StaticCode::open(&stapled, validator.settings())?;
        assert!(validator.verify(&code, &notarized).is_accept());

        // Same code directory, hence the same cdhash, but nothing stapled.
        let code = StaticCode::open(&unstapled, validator.settings())?;
        assert!(validator.verify(&code, &notarized).is_reject());
        assert!(validator
            .notarization()
            .ticket_status(DigestType::Sha256, &code.cdhash()?.unwrap())
            .map(|status| status == TicketStatus::NotFound)?);

        Ok(())
    }

    #[test]
    fn cms_signature_must_cover_code_directory() -> Result<(), AppleCodeIdentityError> {
        let td = tempfile::tempdir()?;
        let settings = VerificationSettings::default();
        let verifier = X509CertificateVerifier::default();

        let signed = Fixture {
            cms: Cms::CodeDirectory,
            ..Default::default()
        }
        .write(td.path())?;
        let code = StaticCode::open(&signed, &settings)?;
        let chain = code.certificate_chain(&verifier)?;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].subject_common_name().as_deref(), Some("Developer"));

        let validator = RequirementValidator::new(settings.clone())?;
        assert!(validator
            .verify(&code, &identifier("com.example.tool"))
            .is_accept());

        let forged = Fixture {
            cms: Cms::OtherContent,
            ..Default::default()
        }
        .write(td.path().join("forged").as_path())?;
        let code = StaticCode::open(&forged, &settings)?;
        assert!(code.certificate_chain(&verifier).is_err());
        assert!(validator.validate(&code, &identifier("com.example.tool")).is_err());
        assert!(!validator
            .verify(&code, &identifier("com.example.tool"))
            .is_accept());

        Ok(())
    }
}
