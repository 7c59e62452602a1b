//! Request and response bodies.
//!
//! Every body is CBOR. An upload is split into one request per batch part,
//! all carrying the session id; the server answers the final one with its
//! run summary and the first download part. Further download parts are
//! fetched one request at a time.

use crate::types::{SyncStatus, SyncType, PROTOCOL_VERSION};
use rowsync_codec::{from_cbor, to_cbor, CodecResult};
use rowsync_core::{BatchPartInfo, ResolvedConflict, ScopeInfo, SyncParameters, SyncSet};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// CBOR encoding shared by every message.
pub trait Message: Serialize + DeserializeOwned {
    /// Encodes to CBOR.
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

/// One batch part in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartPayload {
    /// Part metadata.
    pub info: BatchPartInfo,
    /// Part content.
    pub set: SyncSet,
}

/// Asks the server for its scope, provisioning it on first use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureScopeRequest {
    /// Protocol version of the client.
    pub protocol_version: u16,
    /// Session of the run.
    pub session_id: Uuid,
    /// Scope name.
    pub scope_name: String,
}

impl EnsureScopeRequest {
    /// Creates a request.
    pub fn new(session_id: Uuid, scope_name: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id,
            scope_name: scope_name.into(),
        }
    }
}

impl Message for EnsureScopeRequest {}

/// Server scope, from which the client provisions itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureScopeResponse {
    /// Server scope record, including setup and schema.
    pub server_scope: ScopeInfo,
}

impl Message for EnsureScopeResponse {}

/// One part of the client upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendChangesRequest {
    /// Session of the run.
    pub session_id: Uuid,
    /// Scope name.
    pub scope_name: String,
    /// Run kind.
    pub sync_type: SyncType,
    /// Client scope: identity, setup fingerprint and server watermark.
    pub client_scope: ScopeInfo,
    /// Filter parameter values.
    pub parameters: SyncParameters,
    /// Position of this request in the upload.
    pub batch_index: usize,
    /// Number of requests in the upload. An empty upload is one request
    /// without a part.
    pub batch_count: usize,
    /// True on the final request.
    pub is_last: bool,
    /// Part content, absent for an empty upload.
    pub part: Option<PartPayload>,
    /// Client timestamp the upload was selected at.
    pub client_timestamp: u64,
}

impl Message for SendChangesRequest {}

/// Summary of the download prepared by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSummary {
    /// Number of parts.
    pub batch_count: usize,
    /// Total rows.
    pub row_count: usize,
    /// True if the download is a snapshot.
    pub from_snapshot: bool,
}

/// Server answer to an upload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendChangesResponse {
    /// Session of the run.
    pub session_id: Uuid,
    /// Outcome.
    pub status: SyncStatus,
    /// Server watermark the client stores once it applied the download.
    pub server_timestamp: u64,
    /// Upload rows applied by the server.
    pub applied: usize,
    /// Upload rows the server failed to apply.
    pub failed: usize,
    /// Conflicts the server resolved.
    pub conflicts: Vec<ResolvedConflict>,
    /// Download summary, present on the final response of a run.
    pub download: Option<DownloadSummary>,
    /// First download part.
    pub part: Option<PartPayload>,
}

impl SendChangesResponse {
    /// Acknowledges a non-final upload part.
    pub fn ack(session_id: Uuid) -> Self {
        Self {
            session_id,
            status: SyncStatus::Ok,
            server_timestamp: 0,
            applied: 0,
            failed: 0,
            conflicts: Vec::new(),
            download: None,
            part: None,
        }
    }

    /// Signals an outdated client.
    pub fn outdated(session_id: Uuid) -> Self {
        Self {
            status: SyncStatus::Outdated,
            ..Self::ack(session_id)
        }
    }
}

impl Message for SendChangesResponse {}

/// Asks for one download part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMoreChangesRequest {
    /// Session of the run.
    pub session_id: Uuid,
    /// Scope name.
    pub scope_name: String,
    /// Part index.
    pub batch_index: usize,
}

impl Message for GetMoreChangesRequest {}

/// One download part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMoreChangesResponse {
    /// Session of the run.
    pub session_id: Uuid,
    /// The part.
    pub part: PartPayload,
}

impl Message for GetMoreChangesResponse {}

/// Releases a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionRequest {
    /// Session of the run.
    pub session_id: Uuid,
    /// Scope name.
    pub scope_name: String,
}

impl Message for EndSessionRequest {}

/// Acknowledges a released session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionResponse {
    /// Session released.
    pub session_id: Uuid,
}

impl Message for EndSessionResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_core::{RowState, SyncRow, SyncSchema, SyncSetup, SyncTable};

    #[test]
    fn upload_request_survives_encoding() {
        let scope = ScopeInfo::new("default", SyncSetup::new(["Customer"]), SyncSchema::default()).unwrap();
        let mut set = SyncSet::new();
        let template = SyncTable::new("Customer", vec!["id".into()], vec!["id".into()]);
        set.push(&template, SyncRow::upsert(RowState::Inserted, vec![1i64.into()]));

        let request = SendChangesRequest {
            session_id: Uuid::new_v4(),
            scope_name: "default".into(),
            sync_type: SyncType::Normal,
            client_scope: scope,
            parameters: SyncParameters::new().with("Region", "EU"),
            batch_index: 0,
            batch_count: 1,
            is_last: true,
            part: Some(PartPayload {
                info: BatchPartInfo::describe(0, &set),
                set,
            }),
            client_timestamp: 4,
        };
        let decoded = SendChangesRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn outdated_response_has_no_download() {
        let response = SendChangesResponse::outdated(Uuid::nil());
        assert_eq!(response.status, SyncStatus::Outdated);
        assert!(response.download.is_none());
        let decoded = SendChangesResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(EndSessionRequest::decode(b"not cbor").is_err());
    }
}
