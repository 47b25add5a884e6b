//! Handshake header contract shared by agents and the control plane.
//!
//! An agent's upgrade request carries its credential and a base64 JSON
//! registration payload in two headers. The payload is camelCase on the
//! wire.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header carrying the agent credential
pub const TOKEN_HEADER: &str = "X-API-Tunnel-Token";
/// Header carrying the base64 JSON registration payload
pub const PARAMS_HEADER: &str = "X-API-Tunnel-Params";

/// Registration payload carried in [`PARAMS_HEADER`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationParams {
    /// Node registration section, present when a node agent connects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeParams>,
    /// Cluster bootstrap section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterParams>,
}

/// Node section of the registration payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeParams {
    /// Hostname the node asks to be registered under
    pub requested_hostname: String,
    /// Advertised address, when the node knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Cluster section of the registration payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterParams {
    /// Display name requested at bootstrap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Raised when a params header value is not valid base64 JSON
#[derive(Error, Debug)]
#[error("malformed tunnel params: {0}")]
pub struct ParamsError(String);

/// Decode the base64 JSON registration payload
pub fn decode_params(raw: &str) -> Result<RegistrationParams, ParamsError> {
    let bytes = BASE64.decode(raw).map_err(|e| ParamsError(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ParamsError(e.to_string()))
}

/// Encode a registration payload for the params header
pub fn encode_params(params: &RegistrationParams) -> String {
    // serializing a plain struct cannot fail
    BASE64.encode(serde_json::to_vec(params).expect("params serialize"))
}
