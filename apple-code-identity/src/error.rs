// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    cryptographic_message_syntax::CmsError, std::path::PathBuf, thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Unified error type for Apple code identity evaluation.
///
/// Variants fall into three families. Format errors describe malformed
/// containers and are fatal to the parse that produced them. Requirement
/// errors describe programs that cannot be evaluated and are fatal to the
/// evaluation. Everything else wraps a failure reported by an external
/// collaborator, carrying that collaborator's own message.
#[derive(Debug, Error)]
pub enum AppleCodeIdentityError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("malformed superblob")]
    SuperblobMalformed,

    #[error("superblob length mismatch: header declares {declared} bytes; have {actual}")]
    SuperblobLengthMismatch { declared: usize, actual: usize },

    #[error("superblob advertises slot {0} more than once")]
    SuperblobDuplicateSlot(u32),

    #[error("superblob slot {0} lies outside of the superblob")]
    SuperblobSlotOutOfBounds(u32),

    #[error("malformed blob: {0}")]
    BlobMalformed(&'static str),

    #[error("unknown digest algorithm")]
    DigestUnknownAlgorithm,

    #[error("entitlements data not valid UTF-8: {0}")]
    EntitlementsBadUtf8(std::str::Utf8Error),

    #[error("encrypted image version {0} is not supported")]
    EncryptedImageUnsupportedVersion(u32),

    #[error("encrypted image is truncated")]
    EncryptedImageTruncated,

    #[error("auth table declares {0} entries; exceeds limit")]
    AuthTableTooManyEntries(u32),

    #[error("auth table contains more than one signature entry")]
    AuthTableDuplicateSignature,

    #[error("auth table entry for mechanism {0} has mismatched offset and length")]
    AuthTableOffsetLengthMismatch(u32),

    #[error("auth table region would extend past data fork start ({end} > {data_offset})")]
    AuthTableOverlapsData { end: u64, data_offset: u64 },

    #[error("certificate decode error: {0}")]
    CertificateDecode(String),

    #[error("code signature data is invalid: {0}")]
    SignatureInvalid(String),

    #[error("no Mach-O architecture matches {0}")]
    MachOArchitectureNotFound(String),

    #[error("unrecognized disk representation: {}", .0.display())]
    UnrecognizedFormat(PathBuf),

    #[error("requirement evaluation exceeded maximum depth of {0}")]
    RequirementTooDeep(usize),

    #[error("unknown requirement opcode: {0}")]
    RequirementUnknownOpcode(u32),

    #[error("unknown requirement match expression: {0}")]
    RequirementUnknownMatchExpression(u32),

    #[error("requirement data is malformed: {0}")]
    RequirementMalformed(&'static str),

    #[error("requirement is not supported: {0}")]
    RequirementUnsupported(String),

    #[error("requirement program kind {0} is not recognized")]
    RequirementUnknownKind(u32),

    #[error("no evaluator for lightweight requirements is configured")]
    LightweightRequirementEvaluatorMissing,

    #[error("kernel host error: {0}")]
    KernelHost(String),

    #[error("guest {0} cannot be resolved to code on disk")]
    GuestUnresolvable(String),

    #[error("error looking up notarization ticket: {0}")]
    NotarizationLookupFailure(String),

    #[error("notarization service error: {0}")]
    NotarizationService(String),

    #[error("bad notarization trailer: {0}")]
    BadNotarizationTrailer(&'static str),

    #[error("archive signature provider error: {0}")]
    ArchiveSignature(String),
}

impl AppleCodeIdentityError {
    /// Whether this error describes a malformed container.
    ///
    /// Format errors are distinct from the absence of a signature, which is
    /// never reported as an error.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::BadMagic(_)
                | Self::Scroll(_)
                | Self::SuperblobMalformed
                | Self::SuperblobLengthMismatch { .. }
                | Self::SuperblobDuplicateSlot(_)
                | Self::SuperblobSlotOutOfBounds(_)
                | Self::BlobMalformed(_)
                | Self::EncryptedImageUnsupportedVersion(_)
                | Self::EncryptedImageTruncated
                | Self::AuthTableTooManyEntries(_)
                | Self::AuthTableDuplicateSignature
                | Self::AuthTableOffsetLengthMismatch(_)
                | Self::AuthTableOverlapsData { .. }
                | Self::SignatureInvalid(_)
                | Self::BadNotarizationTrailer(_)
        )
    }

    /// Whether this error was raised while evaluating a requirement program.
    pub fn is_requirement_error(&self) -> bool {
        matches!(
            self,
            Self::RequirementTooDeep(_)
                | Self::RequirementUnknownOpcode(_)
                | Self::RequirementUnknownMatchExpression(_)
                | Self::RequirementMalformed(_)
                | Self::RequirementUnsupported(_)
                | Self::RequirementUnknownKind(_)
                | Self::LightweightRequirementEvaluatorMissing
        )
    }
}

/// The outcome of verifying code against a requirement.
#[derive(Debug)]
pub enum Verdict {
    /// The code satisfies the requirement.
    Accept,
    /// The code was evaluated and does not satisfy the requirement.
    Reject(String),
    /// Evaluation could not complete.
    Inconclusive(AppleCodeIdentityError),
}

impl Verdict {
    /// Convert the result of an evaluation into a verdict.
    pub fn from_evaluation(
        result: Result<bool, AppleCodeIdentityError>,
        requirement: impl std::fmt::Display,
    ) -> Self {
        match result {
            Ok(true) => Self::Accept,
            Ok(false) => Self::Reject(format!("code failed to satisfy `{}`", requirement)),
            Err(e) => Self::Inconclusive(e),
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject(_))
    }

    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Self::Inconclusive(_))
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => f.write_str("accepted"),
            Self::Reject(reason) => f.write_fmt(format_args!("rejected: {}", reason)),
            Self::Inconclusive(e) => f.write_fmt(format_args!("inconclusive: {}", e)),
        }
    }
}
