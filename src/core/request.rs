//! Request payloads carried through the topology
//!
//! A [`DataRequest`] holds an ordered list of [`Document`]s. The number of
//! documents is conserved across every hop of a well-formed request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::error::GatewayResult;
use crate::request_error;

/// Version of the document schema this gateway understands.
pub const SCHEMA_VERSION: u32 = 1;

const DEFAULT_ENDPOINT: &str = "/";

/// One structured item of a payload.
///
/// A field is "populated" when it is `Some(_)` or, for maps, non-empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, f64>,
}

impl Document {
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Overwrites every field of `self` that is populated in `later`.
    ///
    /// Fields left empty in `later` keep their current value.
    pub fn overwrite_from(&mut self, later: Document) {
        let Document {
            id,
            text,
            uri,
            mime_type,
            embedding,
            tags,
            scores,
        } = later;

        if id.is_some() {
            self.id = id;
        }
        if text.is_some() {
            self.text = text;
        }
        if uri.is_some() {
            self.uri = uri;
        }
        if mime_type.is_some() {
            self.mime_type = mime_type;
        }
        if embedding.is_some() {
            self.embedding = embedding;
        }
        if !tags.is_empty() {
            self.tags = tags;
        }
        if !scores.is_empty() {
            self.scores = scores;
        }
    }
}

/// Request and response payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Correlation id; generated by the streamer when left empty
    #[serde(default)]
    pub request_id: String,
    #[serde(default = "DataRequest::default_endpoint")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub parameters: JsonValue,
    #[serde(default)]
    pub docs: Vec<Document>,
    #[serde(default = "DataRequest::default_schema_version")]
    pub schema_version: u32,
}

impl Default for DataRequest {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            endpoint: Self::default_endpoint(),
            parameters: JsonValue::Null,
            docs: Vec::new(),
            schema_version: SCHEMA_VERSION,
        }
    }
}

impl DataRequest {
    pub fn new(endpoint: impl Into<String>, docs: Vec<Document>) -> Self {
        Self {
            endpoint: endpoint.into(),
            docs,
            ..Default::default()
        }
    }

    fn default_endpoint() -> String {
        DEFAULT_ENDPOINT.to_string()
    }

    fn default_schema_version() -> u32 {
        SCHEMA_VERSION
    }

    /// Copy of this request carrying `docs` instead of the current documents.
    pub fn with_docs(&self, docs: Vec<Document>) -> Self {
        Self {
            request_id: self.request_id.clone(),
            endpoint: self.endpoint.clone(),
            parameters: self.parameters.clone(),
            docs,
            schema_version: self.schema_version,
        }
    }

    /// Rejects payloads the gateway cannot route.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(request_error!(
                "unsupported document schema version {} (expected {SCHEMA_VERSION})",
                self.schema_version
            ));
        }
        if self.endpoint.is_empty() {
            return Err(request_error!("request endpoint must not be empty"));
        }
        Ok(())
    }
}
