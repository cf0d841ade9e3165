// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Evaluation of code requirements.

A requirement program is evaluated against an [EvaluationContext] describing
the code: its certificate chain, code directory, Info.plist and entitlements.
Evaluation yields a boolean or an error. Errors mean the requirement could
not be evaluated and must never be interpreted as `false`.

Certificate slots address the chain from the leaf (`0`) or, when negative,
from the anchor (`-1`).
*/

use {
    crate::{
        certificate::{
            CertificateVerifier, SubjectField, APPLE_CODE_SIGNING_CA_COMMON_NAME,
            APPLE_ORGANIZATION,
        },
        code_directory::CodeDirectoryBlob,
        code_requirement::{
            CodeRequirementExpression, CodeRequirementMatchExpression, RequirementProgram,
        },
        error::AppleCodeIdentityError,
        fragments::{FragmentCache, FragmentKind},
        notarization::{NotarizationService, TicketStatus},
        verification_settings::VerificationSettings,
    },
    log::{debug, warn},
    std::fmt::Debug,
    x509_certificate::CapturedX509Certificate,
};

/// Evaluates requirements of the lightweight kind.
pub trait LightweightRequirementEvaluator: Debug + Send + Sync {
    /// Evaluate a lightweight program.
    ///
    /// `program` is the blob payload following the kind field.
    fn evaluate(
        &self,
        program: &[u8],
        context: &EvaluationContext<'_>,
    ) -> Result<bool, AppleCodeIdentityError>;
}

/// Everything a requirement can ask about the code being evaluated.
///
/// The context only borrows. It is cheap to construct for every evaluation.
#[derive(Clone, Copy, Debug)]
pub struct EvaluationContext<'a> {
    /// Signing certificate chain, leaf first.
    pub chain: &'a [CapturedX509Certificate],
    pub code_directory: Option<&'a CodeDirectoryBlob<'a>>,
    pub cdhash: Option<&'a [u8]>,
    pub info_plist: Option<&'a plist::Dictionary>,
    pub entitlements: Option<&'a plist::Dictionary>,
    pub verifier: &'a dyn CertificateVerifier,
    pub fragments: &'a FragmentCache,
    pub notarization: Option<&'a dyn NotarizationService>,
    pub lightweight: Option<&'a dyn LightweightRequirementEvaluator>,
    pub settings: &'a VerificationSettings,
}

impl<'a> EvaluationContext<'a> {
    /// Construct a context describing unsigned code with no metadata.
    pub fn new(
        verifier: &'a dyn CertificateVerifier,
        fragments: &'a FragmentCache,
        settings: &'a VerificationSettings,
    ) -> Self {
        Self {
            chain: &[],
            code_directory: None,
            cdhash: None,
            info_plist: None,
            entitlements: None,
            verifier,
            fragments,
            notarization: None,
            lightweight: None,
            settings,
        }
    }

    pub fn with_chain(mut self, chain: &'a [CapturedX509Certificate]) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_code_directory(mut self, cd: &'a CodeDirectoryBlob<'a>, cdhash: &'a [u8]) -> Self {
        self.code_directory = Some(cd);
        self.cdhash = Some(cdhash);
        self
    }

    pub fn with_cdhash(mut self, cdhash: &'a [u8]) -> Self {
        self.cdhash = Some(cdhash);
        self
    }

    pub fn with_info_plist(mut self, info: &'a plist::Dictionary) -> Self {
        self.info_plist = Some(info);
        self
    }

    pub fn with_entitlements(mut self, entitlements: &'a plist::Dictionary) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    pub fn with_notarization(mut self, service: &'a dyn NotarizationService) -> Self {
        self.notarization = Some(service);
        self
    }

    pub fn with_lightweight(mut self, evaluator: &'a dyn LightweightRequirementEvaluator) -> Self {
        self.lightweight = Some(evaluator);
        self
    }

    /// Resolve a certificate slot.
    pub fn certificate(&self, slot: i32) -> Option<&'a CapturedX509Certificate> {
        let index = if slot < 0 {
            self.chain.len() as i64 + slot as i64
        } else {
            slot as i64
        };

        if index < 0 {
            None
        } else {
            self.chain.get(index as usize)
        }
    }

    /// Evaluate a requirement program.
    pub fn evaluate_program(
        &self,
        program: &RequirementProgram<'_>,
    ) -> Result<bool, AppleCodeIdentityError> {
        Interpreter::new(self).program(program, 0)
    }

    /// Evaluate a requirement expression.
    pub fn evaluate(
        &self,
        expr: &CodeRequirementExpression<'_>,
    ) -> Result<bool, AppleCodeIdentityError> {
        Interpreter::new(self).eval(expr, 0)
    }
}

struct Interpreter<'c, 'a> {
    context: &'c EvaluationContext<'a>,
    max_depth: usize,
}

impl<'c, 'a> Interpreter<'c, 'a> {
    fn new(context: &'c EvaluationContext<'a>) -> Self {
        Self {
            context,
            max_depth: context.settings.max_requirement_depth(),
        }
    }

    fn program(
        &self,
        program: &RequirementProgram<'_>,
        depth: usize,
    ) -> Result<bool, AppleCodeIdentityError> {
        match program {
            RequirementProgram::Expression(expr) => self.eval(expr, depth),
            RequirementProgram::Lightweight(data) => match self.context.lightweight {
                Some(evaluator) => evaluator.evaluate(data, self.context),
                None => Err(AppleCodeIdentityError::LightweightRequirementEvaluatorMissing),
            },
        }
    }

    fn eval(
        &self,
        expr: &CodeRequirementExpression<'_>,
        depth: usize,
    ) -> Result<bool, AppleCodeIdentityError> {
        if depth >= self.max_depth {
            return Err(AppleCodeIdentityError::RequirementTooDeep(self.max_depth));
        }

        let ctx = self.context;
        let next = depth + 1;

        Ok(match expr {
            CodeRequirementExpression::False => false,
            CodeRequirementExpression::True => true,
            CodeRequirementExpression::Identifier(ident) => ctx
                .code_directory
                .map(|cd| cd.ident == *ident)
                .unwrap_or(false),
            CodeRequirementExpression::AnchorApple => self.apple_signed(),
            CodeRequirementExpression::AnchorAppleGeneric => self.apple_anchored(),
            CodeRequirementExpression::AnchorCertificateHash(slot, hash) => ctx
                .certificate(*slot)
                .map(|cert| ctx.verifier.certificate_hash(cert) == &**hash)
                .unwrap_or(false),
            CodeRequirementExpression::AnchorTrusted => {
                ctx.chain.iter().any(|cert| ctx.verifier.is_trusted(cert))
            }
            CodeRequirementExpression::CertificateTrusted(slot) => ctx
                .certificate(*slot)
                .map(|cert| ctx.verifier.is_trusted(cert))
                .unwrap_or(false),
            CodeRequirementExpression::InfoKeyValueLegacy(key, value) => ctx
                .info_plist
                .and_then(|info| info.get(key))
                .and_then(|v| v.as_string())
                .map(|v| v == &**value)
                .unwrap_or(false),
            CodeRequirementExpression::InfoPlistKeyField(key, m) => {
                m.matches(ctx.info_plist.and_then(|info| info.get(key)))?
            }
            CodeRequirementExpression::EntitlementsKey(key, m) => {
                m.matches(ctx.entitlements.and_then(|e| e.get(key)))?
            }
            CodeRequirementExpression::CodeDirectoryHash(hash) => {
                ctx.cdhash.map(|h| h == &**hash).unwrap_or(false)
            }
            CodeRequirementExpression::And(a, b) => {
                let a = self.eval(a, next)?;
                let b = self.eval(b, next)?;
                a && b
            }
            CodeRequirementExpression::Or(a, b) => {
                let a = self.eval(a, next)?;
                let b = self.eval(b, next)?;
                a || b
            }
            CodeRequirementExpression::Not(e) => !self.eval(e, next)?,
            CodeRequirementExpression::CertificateField(slot, field, m) => {
                self.certificate_field(*slot, field, m)?
            }
            CodeRequirementExpression::CertificateGeneric(slot, oid, m) => {
                match ctx.certificate(*slot) {
                    Some(cert) => {
                        ctx.verifier.has_extension(cert, oid.as_ref())
                            && m.matches(Some(&plist::Value::Boolean(true)))?
                    }
                    None => false,
                }
            }
            CodeRequirementExpression::CertificatePolicy(slot, oid, m) => {
                match ctx.certificate(*slot) {
                    Some(cert) => {
                        ctx.verifier.has_policy(cert, oid.as_ref())?
                            && m.matches(Some(&plist::Value::Boolean(true)))?
                    }
                    None => false,
                }
            }
            CodeRequirementExpression::CertificateFieldDate(slot, oid, m) => {
                match ctx.certificate(*slot) {
                    Some(cert) => match ctx.verifier.extension_date(cert, oid.as_ref())? {
                        Some(date) => m.matches_date(Some(date))?,
                        None => false,
                    },
                    None => false,
                }
            }
            CodeRequirementExpression::NamedAnchor(name) => {
                self.named(name, FragmentKind::AnchorRequirement, next)?
            }
            CodeRequirementExpression::NamedCode(name) => {
                self.named(name, FragmentKind::SubRequirement, next)?
            }
            CodeRequirementExpression::Platform(platform) => ctx
                .code_directory
                .map(|cd| cd.platform as u32 == *platform)
                .unwrap_or(false),
            CodeRequirementExpression::Notarized => self.notarized()?,
            CodeRequirementExpression::LegacyDeveloperId => ctx
                .cdhash
                .map(|h| ctx.settings.is_legacy_developer_id(h))
                .unwrap_or(false),
            CodeRequirementExpression::UnknownDefaultFalse(opcode, _) => {
                debug!("unknown requirement opcode {:#x} evaluates to false", opcode);
                false
            }
            CodeRequirementExpression::UnknownSkipped(opcode, _, e) => {
                debug!("skipping unknown requirement opcode {:#x}", opcode);
                self.eval(e, next)?
            }
        })
    }

    /// Whether the chain is anchored at an Apple root.
    fn apple_anchored(&self) -> bool {
        self.context
            .chain
            .last()
            .map(|anchor| self.context.verifier.is_apple_root(anchor))
            .unwrap_or(false)
    }

    /// `anchor apple`: code signed by Apple itself.
    fn apple_signed(&self) -> bool {
        let ctx = self.context;

        if let Some(cdhash) = ctx.cdhash {
            if ctx.settings.trust_cache_contains(cdhash) {
                debug!("cdhash {} is in the trust cache", hex::encode(cdhash));
                return true;
            }
        }

        if self.apple_anchored() {
            if let Some(intermediate) = ctx.certificate(-2) {
                let component = |field| -> Option<String> {
                    ctx.verifier
                        .subject_field(intermediate, field)
                        .ok()
                        .flatten()
                        .and_then(|v| v.into_string())
                };

                if component(SubjectField::CommonName).as_deref()
                    == Some(APPLE_CODE_SIGNING_CA_COMMON_NAME)
                    && component(SubjectField::Organization).as_deref() == Some(APPLE_ORGANIZATION)
                {
                    return true;
                }
            }
        }

        if let Some(leaf) = ctx.chain.first() {
            let anchors = ctx.settings.additional_trusted_anchors();

            if !anchors.is_empty() && anchors.contains(&ctx.verifier.certificate_hash(leaf)) {
                debug!("leaf certificate is an additional trusted anchor");
                return true;
            }
        }

        false
    }

    fn certificate_field(
        &self,
        slot: i32,
        field: &str,
        m: &CodeRequirementMatchExpression<'_>,
    ) -> Result<bool, AppleCodeIdentityError> {
        let ctx = self.context;

        let cert = match ctx.certificate(slot) {
            Some(cert) => cert,
            None => return Ok(false),
        };

        let field = match SubjectField::from_requirement_field(field) {
            Some(field) => field,
            None => {
                warn!("certificate field {} not understood; evaluating to false", field);
                return Ok(false);
            }
        };

        match ctx.verifier.subject_field(cert, field)? {
            Some(value) => m.matches(Some(&value)),
            None => Ok(false),
        }
    }

    fn named(
        &self,
        name: &str,
        kind: FragmentKind,
        depth: usize,
    ) -> Result<bool, AppleCodeIdentityError> {
        match self.context.fragments.get(name, kind)? {
            Some(blob) => {
                let program = RequirementProgram::parse_blob(&blob)?;

                self.program(&program, depth)
            }
            None => Ok(false),
        }
    }

    fn notarized(&self) -> Result<bool, AppleCodeIdentityError> {
        let ctx = self.context;

        let (cd, cdhash) = match (ctx.code_directory, ctx.cdhash) {
            (Some(cd), Some(cdhash)) => (cd, cdhash),
            _ => return Ok(false),
        };

        match ctx.notarization {
            Some(service) => {
                Ok(service.ticket_status(cd.hash_type, cdhash)? == TicketStatus::Valid)
            }
            None => {
                debug!("no notarization service configured; code is not notarized");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            certificate::{certificate_sha1, X509CertificateVerifier},
            embedded_signature::DigestType,
            fragments::MemoryFragmentSource,
            testutil::{generated_certificate, unit_tester_certificate},
        },
    };

    const CDHASH: [u8; 20] = [0x42; 20];

    fn nest(levels: usize) -> CodeRequirementExpression<'static> {
        let mut expr = CodeRequirementExpression::True;
        for _ in 1..levels {
            expr = CodeRequirementExpression::Not(Box::new(CodeRequirementExpression::Not(
                Box::new(expr),
            )));
        }
        expr
    }

    #[test]
    fn depth_limit() -> Result<(), AppleCodeIdentityError> {
        let verifier = X509CertificateVerifier::default();
        let fragments = FragmentCache::new(vec![]);
        let expr = nest(10);
        let depth = expr.depth();

        let mut settings = VerificationSettings::default();
        settings.set_max_requirement_depth(depth);
        assert!(EvaluationContext::new(&verifier, &fragments, &settings).evaluate(&expr)?);

        settings.set_max_requirement_depth(depth - 1);
        assert!(matches!(
            EvaluationContext::new(&verifier, &fragments, &settings).evaluate(&expr),
            Err(AppleCodeIdentityError::RequirementTooDeep(_))
        ));

        Ok(())
    }

    #[test]
    fn self_referencing_fragment_is_too_deep() -> Result<(), AppleCodeIdentityError> {
        let mut source = MemoryFragmentSource::default();
        source.insert_program(
            "loop",
            FragmentKind::SubRequirement,
            &RequirementProgram::Expression(CodeRequirementExpression::NamedCode("loop".into())),
        )?;
        let fragments = FragmentCache::new(vec![Box::new(source)]);
        let verifier = X509CertificateVerifier::default();
        let mut settings = VerificationSettings::default();
        settings.set_max_requirement_depth(64);

        assert!(matches!(
            EvaluationContext::new(&verifier, &fragments, &settings)
                .evaluate(&CodeRequirementExpression::NamedCode("loop".into())),
            Err(AppleCodeIdentityError::RequirementTooDeep(_))
        ));

        Ok(())
    }

    #[test]
    fn boolean_operators_evaluate_both_sides() -> Result<(), AppleCodeIdentityError> {
        let fragments = FragmentCache::new(vec![Box::new(MemoryFragmentSource::default())]);
        let verifier = X509CertificateVerifier::default();
        let settings = VerificationSettings::default();
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings);

        let and = CodeRequirementExpression::And(
            Box::new(CodeRequirementExpression::False),
            Box::new(CodeRequirementExpression::NamedCode("right-of-and".into())),
        );
        assert!(!ctx.evaluate(&and)?);
        assert!(fragments.contains("right-of-and", FragmentKind::SubRequirement));

        let or = CodeRequirementExpression::Or(
            Box::new(CodeRequirementExpression::True),
            Box::new(CodeRequirementExpression::NamedAnchor("right-of-or".into())),
        );
        assert!(ctx.evaluate(&or)?);
        assert!(fragments.contains("right-of-or", FragmentKind::AnchorRequirement));

        Ok(())
    }

    #[test]
    fn named_fragments() -> Result<(), AppleCodeIdentityError> {
        let mut source = MemoryFragmentSource::default();
        source.insert_program(
            "yes",
            FragmentKind::SubRequirement,
            &RequirementProgram::Expression(CodeRequirementExpression::True),
        )?;
        let fragments = FragmentCache::new(vec![Box::new(source)]);
        let verifier = X509CertificateVerifier::default();
        let settings = VerificationSettings::default();
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings);

        assert!(ctx.evaluate(&CodeRequirementExpression::NamedCode("yes".into()))?);
        assert!(!ctx.evaluate(&CodeRequirementExpression::NamedAnchor("yes".into()))?);
        assert!(!ctx.evaluate(&CodeRequirementExpression::NamedCode("no".into()))?);

        Ok(())
    }

    #[test]
    fn anchor_apple_with_mismatched_common_name() -> Result<(), AppleCodeIdentityError> {
        let chain = vec![unit_tester_certificate()];
        let verifier = X509CertificateVerifier::default();
        let fragments = FragmentCache::new(vec![]);
        let mut settings = VerificationSettings::default();
        settings.add_trust_cache_cdhash(CDHASH.to_vec());

        let ctx = EvaluationContext::new(&verifier, &fragments, &settings)
            .with_chain(&chain)
            .with_cdhash(&CDHASH);

        let field = |value: &'static str| {
            CodeRequirementExpression::CertificateField(
                0,
                "subject.CN".into(),
                CodeRequirementMatchExpression::Equal(value.into()),
            )
        };

        let mismatch = CodeRequirementExpression::And(
            Box::new(CodeRequirementExpression::AnchorApple),
            Box::new(field("Somebody Else")),
        );
        assert!(!ctx.evaluate(&mismatch)?);

        let matching = CodeRequirementExpression::And(
            Box::new(CodeRequirementExpression::AnchorApple),
            Box::new(field("Unit Tester")),
        );
        assert!(ctx.evaluate(&matching)?);

        // Without the trust cache entry, a self-signed chain isn't Apple's.
        let settings = VerificationSettings::default();
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings)
            .with_chain(&chain)
            .with_cdhash(&CDHASH);
        assert!(!ctx.evaluate(&CodeRequirementExpression::AnchorApple)?);

        Ok(())
    }

    #[test]
    fn anchor_apple_intermediate_is_next_to_root() -> Result<(), AppleCodeIdentityError> {
        let (root, _) = generated_certificate("Test Root", Some(APPLE_ORGANIZATION), None);
        let (apple_ca, _) = generated_certificate(
            APPLE_CODE_SIGNING_CA_COMMON_NAME,
            Some(APPLE_ORGANIZATION),
            Some(&root),
        );
        let (other_ca, _) = generated_certificate("Other CA", Some("Other"), None);
        let (leaf, _) = generated_certificate("Software Signing", Some(APPLE_ORGANIZATION), None);

        let verifier =
            X509CertificateVerifier::default().with_apple_root_hash(certificate_sha1(&root));
        let fragments = FragmentCache::new(vec![]);
        let settings = VerificationSettings::default();

        let chain = vec![leaf.clone(), other_ca.clone(), apple_ca.clone(), root.clone()];
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings).with_chain(&chain);
        assert!(ctx.evaluate(&CodeRequirementExpression::AnchorApple)?);

        // The Apple intermediate must issue directly below the root.
        let chain = vec![leaf.clone(), apple_ca.clone(), other_ca, root.clone()];
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings).with_chain(&chain);
        assert!(!ctx.evaluate(&CodeRequirementExpression::AnchorApple)?);

        let chain = vec![leaf, apple_ca, root];
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings).with_chain(&chain);
        assert!(ctx.evaluate(&CodeRequirementExpression::AnchorApple)?);

        // A lone root has no intermediate.
        let chain = vec![unit_tester_certificate()];
        let verifier = X509CertificateVerifier::default()
            .with_apple_root_hash(certificate_sha1(&unit_tester_certificate()));
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings).with_chain(&chain);
        assert!(!ctx.evaluate(&CodeRequirementExpression::AnchorApple)?);

        Ok(())
    }

    #[test]
    fn additional_trusted_anchor() -> Result<(), AppleCodeIdentityError> {
        let cert = unit_tester_certificate();
        let chain = vec![cert.clone()];
        let verifier = X509CertificateVerifier::default();
        let fragments = FragmentCache::new(vec![]);
        let mut settings = VerificationSettings::default();
        settings.add_additional_trusted_anchor(certificate_sha1(&cert));

        let ctx = EvaluationContext::new(&verifier, &fragments, &settings).with_chain(&chain);
        assert!(ctx.evaluate(&CodeRequirementExpression::AnchorApple)?);
        assert!(!ctx.evaluate(&CodeRequirementExpression::AnchorAppleGeneric)?);

        Ok(())
    }

    #[test]
    fn certificate_expressions() -> Result<(), AppleCodeIdentityError> {
        let cert = unit_tester_certificate();
        let hash = certificate_sha1(&cert);
        let chain = vec![cert];
        let verifier = X509CertificateVerifier::default().with_trusted_hashes(vec![hash.clone()]);
        let fragments = FragmentCache::new(vec![]);
        let settings = VerificationSettings::default();
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings).with_chain(&chain);

        assert!(ctx.evaluate(&CodeRequirementExpression::AnchorCertificateHash(
            -1,
            hash.clone().into()
        ))?);
        assert!(!ctx.evaluate(&CodeRequirementExpression::AnchorCertificateHash(
            1,
            hash.into()
        ))?);
        assert!(ctx.evaluate(&CodeRequirementExpression::AnchorTrusted)?);
        assert!(ctx.evaluate(&CodeRequirementExpression::CertificateTrusted(0))?);
        assert!(!ctx.evaluate(&CodeRequirementExpression::CertificateTrusted(-2))?);

        // Unknown fields are false, not errors.
        assert!(!ctx.evaluate(&CodeRequirementExpression::CertificateField(
            0,
            "subject.XYZ".into(),
            CodeRequirementMatchExpression::Exists,
        ))?);
        // As are missing components, even for the absent match.
        assert!(!ctx.evaluate(&CodeRequirementExpression::CertificateField(
            0,
            "subject.UID".into(),
            CodeRequirementMatchExpression::Absent,
        ))?);
        assert!(ctx.evaluate(&CodeRequirementExpression::CertificateField(
            -1,
            "subject.O".into(),
            CodeRequirementMatchExpression::Equal("testing".into()),
        ))?);

        // basicConstraints
        assert!(ctx.evaluate(&CodeRequirementExpression::CertificateGeneric(
            0,
            bcder::Oid(&[85u8, 29, 19][..]),
            CodeRequirementMatchExpression::Exists,
        ))?);
        assert!(!ctx.evaluate(&CodeRequirementExpression::CertificateGeneric(
            0,
            bcder::Oid(&[85u8, 29, 17][..]),
            CodeRequirementMatchExpression::Exists,
        ))?);

        Ok(())
    }

    #[test]
    fn plist_and_code_directory_expressions() -> Result<(), AppleCodeIdentityError> {
        let verifier = X509CertificateVerifier::default();
        let fragments = FragmentCache::new(vec![]);
        let settings = VerificationSettings::default();

        let mut cd = CodeDirectoryBlob::new("com.example.app", DigestType::Sha256)?;
        cd.platform = 2;
        let cdhash = cd.cdhash()?;

        let mut info = plist::Dictionary::new();
        info.insert("CFBundleVersion".into(), "1.0".into());
        let mut entitlements = plist::Dictionary::new();
        entitlements.insert("com.apple.security.app-sandbox".into(), true.into());

        let ctx = EvaluationContext::new(&verifier, &fragments, &settings)
            .with_code_directory(&cd, &cdhash)
            .with_info_plist(&info)
            .with_entitlements(&entitlements);

        assert!(ctx.evaluate(&CodeRequirementExpression::Identifier("com.example.app".into()))?);
        assert!(!ctx.evaluate(&CodeRequirementExpression::Identifier("com.example".into()))?);
        assert!(ctx.evaluate(&CodeRequirementExpression::CodeDirectoryHash(
            cdhash.clone().into()
        ))?);
        assert!(ctx.evaluate(&CodeRequirementExpression::Platform(2))?);
        assert!(!ctx.evaluate(&CodeRequirementExpression::Platform(1))?);
        assert!(ctx.evaluate(&CodeRequirementExpression::InfoKeyValueLegacy(
            "CFBundleVersion".into(),
            "1.0".into()
        ))?);
        assert!(ctx.evaluate(&CodeRequirementExpression::InfoPlistKeyField(
            "CFBundleIdentifier".into(),
            CodeRequirementMatchExpression::Absent,
        ))?);
        assert!(ctx.evaluate(&CodeRequirementExpression::EntitlementsKey(
            "com.apple.security.app-sandbox".into(),
            CodeRequirementMatchExpression::Exists,
        ))?);
        assert!(!ctx.evaluate(&CodeRequirementExpression::LegacyDeveloperId)?);

        // Absent maps behave like absent keys.
        let bare = EvaluationContext::new(&verifier, &fragments, &settings);
        assert!(bare.evaluate(&CodeRequirementExpression::EntitlementsKey(
            "anything".into(),
            CodeRequirementMatchExpression::Absent,
        ))?);
        assert!(!bare.evaluate(&CodeRequirementExpression::Identifier("x".into()))?);

        Ok(())
    }

    /// Knows a single notarized digest.
    #[derive(Debug)]
    struct SingleTicket(Vec<u8>);

    impl NotarizationService for SingleTicket {
        fn ticket_status(
            &self,
            _: DigestType,
            digest: &[u8],
        ) -> Result<TicketStatus, AppleCodeIdentityError> {
            Ok(if digest == self.0 {
                TicketStatus::Valid
            } else {
                TicketStatus::NotFound
            })
        }
    }

    #[test]
    fn notarized() -> Result<(), AppleCodeIdentityError> {
        let verifier = X509CertificateVerifier::default();
        let fragments = FragmentCache::new(vec![]);
        let settings = VerificationSettings::default();
        let cd = CodeDirectoryBlob::new("com.example.app", DigestType::Sha256)?;
        let cdhash = cd.cdhash()?;

        let unknown = SingleTicket(vec![0; 20]);
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings)
            .with_code_directory(&cd, &cdhash)
            .with_notarization(&unknown);
        assert!(!ctx.evaluate(&CodeRequirementExpression::Notarized)?);

        let known = SingleTicket(cdhash.clone());
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings)
            .with_code_directory(&cd, &cdhash)
            .with_notarization(&known);
        assert!(ctx.evaluate(&CodeRequirementExpression::Notarized)?);

        // No code directory, no ticket.
        let unsigned =
            EvaluationContext::new(&verifier, &fragments, &settings).with_notarization(&known);
        assert!(!unsigned.evaluate(&CodeRequirementExpression::Notarized)?);

        // No service, no ticket.
        let offline = EvaluationContext::new(&verifier, &fragments, &settings)
            .with_code_directory(&cd, &cdhash);
        assert!(!offline.evaluate(&CodeRequirementExpression::Notarized)?);

        Ok(())
    }

    #[test]
    fn unknown_opcodes() -> Result<(), AppleCodeIdentityError> {
        let verifier = X509CertificateVerifier::default();
        let fragments = FragmentCache::new(vec![]);
        let settings = VerificationSettings::default();
        let ctx = EvaluationContext::new(&verifier, &fragments, &settings);

        assert!(!ctx.evaluate(&CodeRequirementExpression::UnknownDefaultFalse(
            0x80000063,
            vec![].into()
        ))?);
        assert!(ctx.evaluate(&CodeRequirementExpression::UnknownSkipped(
            0x40000063,
            vec![].into(),
            Box::new(CodeRequirementExpression::True)
        ))?);

        Ok(())
    }

    #[test]
    fn lightweight_programs() -> Result<(), AppleCodeIdentityError> {
        #[derive(Debug)]
        struct NonEmpty;

        impl LightweightRequirementEvaluator for NonEmpty {
            fn evaluate(
                &self,
                program: &[u8],
                _: &EvaluationContext<'_>,
            ) -> Result<bool, AppleCodeIdentityError> {
                Ok(!program.is_empty())
            }
        }

        let evaluator = NonEmpty;
        let verifier = X509CertificateVerifier::default();
        let fragments = FragmentCache::new(vec![]);
        let settings = VerificationSettings::default();
        let program = RequirementProgram::Lightweight(vec![0xde, 0xad].into());

        let ctx = EvaluationContext::new(&verifier, &fragments, &settings);
        assert!(matches!(
            ctx.evaluate_program(&program),
            Err(AppleCodeIdentityError::LightweightRequirementEvaluatorMissing)
        ));

        assert!(ctx.with_lightweight(&evaluator).evaluate_program(&program)?);

        Ok(())
    }
}
