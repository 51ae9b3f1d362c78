//! Wire protocol for the realtime gateway.
//!
//! Frames are JSON objects tagged by `type`, exchanged over a WebSocket
//! negotiated with the `graphql-ws` subprotocol. The realtime endpoint
//! is derived from the HTTPS GraphQL endpoint, with the handshake's
//! authorization headers and payload carried as base64 query parameters.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::Result;

/// Opaque identifier of one logical subscription, stable across
/// reconnects.
pub type SubscriptionId = uuid::Uuid;

/// WebSocket subprotocol the gateway expects.
pub(crate) const WEBSOCKET_SUBPROTOCOL: &str = "graphql-ws";

/// Client metadata header attached to every start frame.
pub(crate) const USER_AGENT_HEADER: &str = "x-amz-user-agent";
pub(crate) const USER_AGENT: &str = concat!("appsync-realtime-sdk/", env!("CARGO_PKG_VERSION"));

const REALTIME_PATH: &str = "/realtime";
const STANDARD_DOMAIN_SUFFIX: &str = ".amazonaws.com";
const STANDARD_HOST_MARKER: &str = ".appsync-api.";
const API_ID_LEN: usize = 26;

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ClientMessage {
    ConnectionInit,
    Start {
        id: SubscriptionId,
        payload: StartPayload,
    },
    Stop {
        id: SubscriptionId,
    },
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct StartPayload {
    /// Serialized query and variables, re-sent verbatim on reconnects
    pub data: String,
    pub extensions: StartExtensions,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct StartExtensions {
    pub authorization: BTreeMap<String, String>,
}

/// Frames received from the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ServerMessage {
    ConnectionAck {
        #[serde(default)]
        payload: Option<ConnectionAckPayload>,
    },
    ConnectionError {
        #[serde(default)]
        payload: Option<ConnectionErrorPayload>,
    },
    Ka,
    StartAck {
        id: SubscriptionId,
    },
    Data {
        id: SubscriptionId,
        payload: Value,
    },
    Error {
        #[serde(default)]
        id: Option<SubscriptionId>,
        #[serde(default)]
        payload: Value,
    },
    Complete {
        id: SubscriptionId,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct ConnectionAckPayload {
    /// Server-advertised keepalive timeout
    #[serde(rename = "connectionTimeoutMs")]
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ConnectionErrorPayload {
    #[serde(default)]
    pub errors: Vec<ProtocolError>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProtocolError {
    #[serde(rename = "errorType", default)]
    pub error_type: String,
    #[serde(rename = "errorCode", default)]
    pub error_code: u16,
}

/// Whether the endpoint is a standard gateway domain
/// (`<api-id>.appsync-api.<region>.amazonaws.com/graphql`) as opposed to
/// a custom domain.
fn is_standard_domain(endpoint: &Url) -> bool {
    if endpoint.path() != "/graphql" {
        return false;
    }
    let Some(host) = endpoint.host_str() else {
        return false;
    };
    let Some(rest) = host.strip_suffix(STANDARD_DOMAIN_SUFFIX) else {
        return false;
    };
    let Some((api_id, region)) = rest.split_once(STANDARD_HOST_MARKER) else {
        return false;
    };
    api_id.len() == API_ID_LEN
        && api_id.chars().all(char::is_alphanumeric)
        && !region.is_empty()
        && !region.contains('.')
}

/// Derive the realtime WebSocket endpoint from the HTTPS GraphQL
/// endpoint. Standard domains swap to the realtime host; custom domains
/// get the realtime path suffix.
pub(crate) fn realtime_endpoint(endpoint: &Url, ssl: bool) -> Result<Url> {
    let mut discoverable = endpoint.clone();
    if is_standard_domain(endpoint) {
        if let Some(host) = endpoint.host_str() {
            let realtime_host = host.replacen("appsync-api", "appsync-realtime-api", 1);
            discoverable.set_host(Some(&realtime_host))?;
        }
    } else {
        let path = format!("{}{REALTIME_PATH}", endpoint.path().trim_end_matches('/'));
        discoverable.set_path(&path);
    }

    let scheme = if ssl { "wss" } else { "ws" };
    let raw = discoverable.as_str();
    let rewritten = raw
        .strip_prefix("https://")
        .or_else(|| raw.strip_prefix("http://"))
        .map_or_else(|| raw.to_owned(), |rest| format!("{scheme}://{rest}"));
    Ok(Url::parse(&rewritten)?)
}

/// Append the handshake's authorization headers and payload as base64
/// query parameters.
pub(crate) fn with_connection_params(url: &Url, header_json: &str, payload_json: &str) -> Url {
    let mut out = url.clone();
    out.query_pairs_mut()
        .append_pair("header", &STANDARD.encode(header_json))
        .append_pair("payload", &STANDARD.encode(payload_json));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_init_shape() {
        let json = serde_json::to_value(ClientMessage::ConnectionInit).expect("serialize");
        assert_eq!(json, serde_json::json!({ "type": "connection_init" }));
    }

    #[test]
    fn start_frame_shape() {
        let id = SubscriptionId::new_v4();
        let mut authorization = BTreeMap::new();
        authorization.insert("host".to_owned(), "example.com".to_owned());
        let frame = ClientMessage::Start {
            id,
            payload: StartPayload {
                data: r#"{"query":"subscription { onEvent }","variables":{}}"#.to_owned(),
                extensions: StartExtensions { authorization },
            },
        };

        let json = serde_json::to_value(&frame).expect("serialize");

        assert_eq!(json["type"], "start");
        assert_eq!(json["id"], id.to_string());
        assert_eq!(json["payload"]["extensions"]["authorization"]["host"], "example.com");
    }

    #[test]
    fn server_frames_parse() {
        let ack: ServerMessage =
            serde_json::from_str(r#"{"type":"connection_ack","payload":{"connectionTimeoutMs":300000}}"#)
                .expect("parse");
        match ack {
            ServerMessage::ConnectionAck { payload } => {
                assert_eq!(payload.map(|p| p.connection_timeout_ms), Some(300_000));
            }
            other => panic!("expected connection_ack, got {other:?}"),
        }

        let ka: ServerMessage = serde_json::from_str(r#"{"type":"ka"}"#).expect("parse");
        assert!(matches!(ka, ServerMessage::Ka), "keepalive frame");

        let rejected: ServerMessage = serde_json::from_str(
            r#"{"type":"connection_error","payload":{"errors":[{"errorType":"UnauthorizedException","errorCode":401}]}}"#,
        )
        .expect("parse");
        match rejected {
            ServerMessage::ConnectionError { payload } => {
                let error = payload.and_then(|p| p.errors.into_iter().next()).expect("error entry");
                assert_eq!(error.error_type, "UnauthorizedException");
                assert_eq!(error.error_code, 401);
            }
            other => panic!("expected connection_error, got {other:?}"),
        }

        let id = SubscriptionId::new_v4();
        let data: ServerMessage = serde_json::from_str(&format!(
            r#"{{"type":"data","id":"{id}","payload":{{"data":{{"value":1}}}}}}"#
        ))
        .expect("parse");
        match data {
            ServerMessage::Data { id: got, payload } => {
                assert_eq!(got, id);
                assert_eq!(payload["data"]["value"], 1);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn standard_domain_swaps_to_realtime_host() {
        let endpoint =
            Url::parse("https://abcdefghijklmnopqrstuvwxyz.appsync-api.us-east-1.amazonaws.com/graphql")
                .expect("valid url");

        let realtime = realtime_endpoint(&endpoint, true).expect("realtime endpoint");

        assert_eq!(
            realtime.as_str(),
            "wss://abcdefghijklmnopqrstuvwxyz.appsync-realtime-api.us-east-1.amazonaws.com/graphql"
        );
    }

    #[test]
    fn custom_domain_gets_realtime_path() {
        let endpoint = Url::parse("https://api.example.com/graphql").expect("valid url");

        let realtime = realtime_endpoint(&endpoint, true).expect("realtime endpoint");

        assert_eq!(realtime.as_str(), "wss://api.example.com/graphql/realtime");
    }

    #[test]
    fn insecure_endpoints_use_plain_ws() {
        let endpoint = Url::parse("http://127.0.0.1:8080/graphql").expect("valid url");

        let realtime = realtime_endpoint(&endpoint, false).expect("realtime endpoint");

        assert_eq!(realtime.as_str(), "ws://127.0.0.1:8080/graphql/realtime");
    }

    #[test]
    fn connection_params_are_base64_encoded() {
        let url = Url::parse("wss://example.com/graphql/realtime").expect("valid url");

        let with_params = with_connection_params(&url, r#"{"host":"example.com"}"#, "{}");

        let pairs: BTreeMap<_, _> = with_params.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("payload").map(String::as_str), Some("e30="));
        let header = pairs.get("header").expect("header param");
        let decoded = STANDARD.decode(header).expect("valid base64");
        assert_eq!(decoded, br#"{"host":"example.com"}"#);
    }
}
