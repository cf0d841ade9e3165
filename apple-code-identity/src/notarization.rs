// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Notarization ticket checks.

Apple issues notarization tickets for code it has inspected. A ticket is
addressed by the hash of the notarized entity, which for signed code is its
cdhash. Tickets are either published online or stapled to the entity itself.

The `notarized` requirement opcode asks a [NotarizationService] whether a
valid ticket exists for the code being evaluated. A stapled ticket only
counts once a [TicketVerifier] vouches for it.
*/

use {
    crate::{embedded_signature::DigestType, error::AppleCodeIdentityError},
    log::{debug, warn},
    std::fmt::Debug,
};

/// Status of a notarization ticket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TicketStatus {
    /// A ticket exists and hasn't been revoked.
    Valid,
    /// A ticket was issued and later revoked.
    Revoked,
    /// No ticket is known.
    NotFound,
}

/// Answers whether a hash carries a valid notarization ticket.
///
/// Implementations report failures of their backing store as errors. A
/// ticket that doesn't exist is [TicketStatus::NotFound], not an error.
pub trait NotarizationService: Debug + Send + Sync {
    fn ticket_status(
        &self,
        digest_type: DigestType,
        digest: &[u8],
    ) -> Result<TicketStatus, AppleCodeIdentityError>;
}

/// Resolve the ticket record name for a digest.
///
/// The record name is of the form `2/<digest_type>/<hex digest>`. e.g.
/// `2/2/deadbeefdeadbeef....`.
pub fn ticket_record_name(digest_type: DigestType, digest: &[u8]) -> String {
    format!("2/{}/{}", u8::from(digest_type), hex::encode(digest))
}

/// Judges notarization tickets stapled to code.
///
/// Stapled ticket bytes travel with the code and are not trustworthy by
/// themselves. Implementations answer [TicketStatus::Valid] only after
/// verifying the ticket's signature and that it covers the given digest.
pub trait TicketVerifier: Debug + Send + Sync {
    fn verify_ticket(
        &self,
        ticket: &[u8],
        digest_type: DigestType,
        digest: &[u8],
    ) -> Result<TicketStatus, AppleCodeIdentityError>;
}

/// A ticket found stapled to the code under evaluation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StapledTicket {
    pub digest_type: DigestType,
    pub digest: Vec<u8>,
    pub data: Vec<u8>,
}

impl StapledTicket {
    pub fn new(digest_type: DigestType, digest: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            digest_type,
            digest,
            data,
        }
    }

    fn covers(&self, digest_type: DigestType, digest: &[u8]) -> bool {
        self.digest_type == digest_type && self.digest == digest
    }
}

/// Combines stapled ticket verification with an optional online service.
///
/// When an online service is configured it is always consulted, so a
/// revocation overrides a stapled ticket. A stapled ticket counts only when a
/// [TicketVerifier] accepts it. Without one, stapled tickets are ignored.
/// Errors from either collaborator propagate.
#[derive(Debug, Default)]
pub struct NotarizationChecker {
    online: Option<Box<dyn NotarizationService>>,
    ticket_verifier: Option<Box<dyn TicketVerifier>>,
}

impl NotarizationChecker {
    pub fn new(online: Option<Box<dyn NotarizationService>>) -> Self {
        Self {
            online,
            ticket_verifier: None,
        }
    }

    /// Judge stapled tickets with a verifier.
    pub fn with_ticket_verifier(mut self, verifier: Box<dyn TicketVerifier>) -> Self {
        self.ticket_verifier = Some(verifier);
        self
    }

    /// Obtain a service that also considers a ticket stapled to the code
    /// being evaluated.
    ///
    /// The ticket is only visible through the returned value.
    pub fn with_stapled(&self, ticket: Option<StapledTicket>) -> StapledNotarization<'_> {
        StapledNotarization {
            checker: self,
            ticket,
        }
    }

    fn stapled_status(
        &self,
        ticket: Option<&StapledTicket>,
        digest_type: DigestType,
        digest: &[u8],
    ) -> Result<TicketStatus, AppleCodeIdentityError> {
        let ticket = match ticket {
            Some(ticket) if ticket.covers(digest_type, digest) => ticket,
            _ => return Ok(TicketStatus::NotFound),
        };

        match &self.ticket_verifier {
            Some(verifier) => verifier.verify_ticket(&ticket.data, digest_type, digest),
            None => {
                warn!(
                    "ignoring stapled ticket for {}; no ticket verifier is configured",
                    ticket_record_name(digest_type, digest)
                );
                Ok(TicketStatus::NotFound)
            }
        }
    }

    fn status(
        &self,
        ticket: Option<&StapledTicket>,
        digest_type: DigestType,
        digest: &[u8],
    ) -> Result<TicketStatus, AppleCodeIdentityError> {
        let status = match &self.online {
            Some(online) => match online.ticket_status(digest_type, digest)? {
                TicketStatus::NotFound => self.stapled_status(ticket, digest_type, digest)?,
                status => status,
            },
            None => self.stapled_status(ticket, digest_type, digest)?,
        };

        debug!(
            "notarization status of {}: {:?}",
            ticket_record_name(digest_type, digest),
            status
        );

        Ok(status)
    }
}

impl NotarizationService for NotarizationChecker {
    fn ticket_status(
        &self,
        digest_type: DigestType,
        digest: &[u8],
    ) -> Result<TicketStatus, AppleCodeIdentityError> {
        self.status(None, digest_type, digest)
    }
}

/// A [NotarizationChecker] scoped to a single piece of code.
#[derive(Debug)]
pub struct StapledNotarization<'a> {
    checker: &'a NotarizationChecker,
    ticket: Option<StapledTicket>,
}

impl<'a> StapledNotarization<'a> {
    pub fn ticket(&self) -> Option<&StapledTicket> {
        self.ticket.as_ref()
    }
}

impl<'a> NotarizationService for StapledNotarization<'a> {
    fn ticket_status(
        &self,
        digest_type: DigestType,
        digest: &[u8],
    ) -> Result<TicketStatus, AppleCodeIdentityError> {
        self.checker.status(self.ticket.as_ref(), digest_type, digest)
    }
}
