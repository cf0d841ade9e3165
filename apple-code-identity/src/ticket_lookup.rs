// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Online notarization ticket lookup.

Apple publishes notarization tickets through a CloudKit database. Records are
named after the hash of the notarized entity (see
[crate::notarization::ticket_record_name]). A record deleted from the
database denotes a revoked ticket.
*/

use {
    crate::{
        embedded_signature::DigestType,
        error::AppleCodeIdentityError,
        notarization::{ticket_record_name, NotarizationService, TicketStatus},
    },
    log::{info, warn},
    reqwest::blocking::{Client, ClientBuilder},
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
};

/// URL of HTTP service where Apple publishes notarization tickets.
pub const APPLE_TICKET_LOOKUP_URL: &str = "https://api.apple-cloudkit.com/database/1/com.apple.gk.ticket-delivery/production/public/records/lookup";

/// CloudKit error code for records that don't exist.
const SERVER_ERROR_NOT_FOUND: &str = "NOT_FOUND";

/// Main JSON request object for ticket lookup requests.
#[derive(Clone, Debug, Serialize)]
pub struct TicketLookupRequest {
    pub records: Vec<TicketLookupRequestRecord>,
}

/// Represents a single record to look up in a ticket lookup request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLookupRequestRecord {
    pub record_name: String,
}

/// Main JSON response object to ticket lookup requests.
#[derive(Clone, Debug, Deserialize)]
pub struct TicketLookupResponse {
    pub records: Vec<TicketLookupResponseRecord>,
}

impl TicketLookupResponse {
    /// Find the response record for a record name.
    pub fn record(&self, record_name: &str) -> Option<&TicketLookupResponseRecord> {
        self.records.iter().find(|r| r.record_name() == record_name)
    }

    /// Resolve the ticket status of a record name.
    ///
    /// A record missing from the response or a server error other than
    /// not found are errors.
    pub fn ticket_status(&self, record_name: &str) -> Result<TicketStatus, AppleCodeIdentityError> {
        match self.record(record_name) {
            Some(TicketLookupResponseRecord::Success(r)) if r.deleted => Ok(TicketStatus::Revoked),
            Some(TicketLookupResponseRecord::Success(r)) => {
                // Make sure the ticket is actually there.
                r.signed_ticket_data().ok_or_else(|| {
                    AppleCodeIdentityError::NotarizationLookupFailure(format!(
                        "record {} has no signed ticket",
                        record_name
                    ))
                })??;

                Ok(TicketStatus::Valid)
            }
            Some(TicketLookupResponseRecord::Failure(r))
                if r.server_error_code == SERVER_ERROR_NOT_FOUND =>
            {
                Ok(TicketStatus::NotFound)
            }
            Some(TicketLookupResponseRecord::Failure(r)) => {
                Err(AppleCodeIdentityError::NotarizationLookupFailure(format!(
                    "{}: {}",
                    r.server_error_code, r.reason
                )))
            }
            None => Err(AppleCodeIdentityError::NotarizationLookupFailure(format!(
                "record {} not in response",
                record_name
            ))),
        }
    }
}

/// Describes the results of a ticket lookup for a specific record.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TicketLookupResponseRecord {
    /// Some error occurred.
    ///
    /// Listed first since success records have few required fields.
    Failure(TicketLookupResponseRecordFailure),

    /// Ticket was found.
    Success(TicketLookupResponseRecordSuccess),
}

impl TicketLookupResponseRecord {
    /// Obtain the record name associated with this record.
    pub fn record_name(&self) -> &str {
        match self {
            Self::Success(r) => &r.record_name,
            Self::Failure(r) => &r.record_name,
        }
    }
}

/// Represents a successful ticket lookup response record.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLookupResponseRecordSuccess {
    /// Name of record that was looked up.
    pub record_name: String,

    #[serde(default)]
    pub deleted: bool,
    /// The `signedTicket` key holds the ticket.
    #[serde(default)]
    pub fields: HashMap<String, Field>,
    /// A value like `DeveloperIDTicket`.
    #[serde(default)]
    pub record_type: Option<String>,
}

impl TicketLookupResponseRecordSuccess {
    /// Obtain the raw signed ticket data in this record.
    ///
    /// Evaluates to `None` if the record has no ticket field. The inner
    /// result carries decoding failures.
    pub fn signed_ticket_data(&self) -> Option<Result<Vec<u8>, AppleCodeIdentityError>> {
        self.fields.get("signedTicket").map(|field| {
            if field.typ == "BYTES" {
                base64::decode(&field.value).map_err(|e| {
                    AppleCodeIdentityError::NotarizationLookupFailure(format!(
                        "ticket data is not base64: {}",
                        e
                    ))
                })
            } else {
                Err(AppleCodeIdentityError::NotarizationLookupFailure(format!(
                    "ticket field has type {}; expected BYTES",
                    field.typ
                )))
            }
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLookupResponseRecordFailure {
    pub record_name: String,
    pub reason: String,
    pub server_error_code: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Field {
    #[serde(rename = "type")]
    pub typ: String,
    pub value: String,
}

/// Obtain the default [Client] to use for HTTP requests.
pub fn default_client() -> Result<Client, AppleCodeIdentityError> {
    Ok(ClientBuilder::default()
        .user_agent("apple-code-identity crate")
        .build()?)
}

/// Look up notarization tickets given an HTTP client and record names.
pub fn lookup_notarization_tickets<'a>(
    client: &Client,
    record_names: impl Iterator<Item = &'a str>,
) -> Result<TicketLookupResponse, AppleCodeIdentityError> {
    let body = TicketLookupRequest {
        records: record_names
            .map(|x| {
                info!("looking up notarization ticket for {}", x);
                TicketLookupRequestRecord {
                    record_name: x.to_string(),
                }
            })
            .collect::<Vec<_>>(),
    };

    let response = client
        .post(APPLE_TICKET_LOOKUP_URL)
        .header("Accept", "application/json")
        .header("Content-Type", "application/json")
        .json(&body)
        .send()?;

    let body = response.bytes()?;

    Ok(serde_json::from_slice::<TicketLookupResponse>(&body)?)
}

/// A [NotarizationService] backed by Apple's ticket delivery service.
#[derive(Debug)]
pub struct OnlineNotarizationService {
    client: Client,
}

impl OnlineNotarizationService {
    pub fn new() -> Result<Self, AppleCodeIdentityError> {
        Ok(Self {
            client: default_client()?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl NotarizationService for OnlineNotarizationService {
    fn ticket_status(
        &self,
        digest_type: DigestType,
        digest: &[u8],
    ) -> Result<TicketStatus, AppleCodeIdentityError> {
        let record_name = ticket_record_name(digest_type, digest);

        let status = lookup_notarization_tickets(&self.client, std::iter::once(record_name.as_str()))?
            .ticket_status(&record_name)?;

        if status == TicketStatus::Revoked {
            warn!("notarization ticket {} has been revoked", record_name);
        }

        Ok(status)
    }
}
