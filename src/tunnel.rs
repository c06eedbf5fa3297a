//! Cross-cluster tunnel between a main instance and a remote gateway: one
//! persistent duplex websocket per gateway, carrying authorization RPCs as
//! single binary frames in a versioned, length-prefixed schema.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::WebSocket;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite;

use crate::lifecycle::{JobCallAuthData, LifecycleClient, LifecycleError};
use crate::server::Services;

pub const GATEWAY_TOKEN_HEADER: &str = "X-Racetrack-Gateway-Token";
pub const JOB_INTERNAL_NAME_HEADER: &str = "X-Racetrack-Job-Internal-Name";

const FRAME_VERSION: u8 = 1;
const KIND_AUTHORIZE_REQUEST: u8 = 1;
const KIND_AUTHORIZE_RESPONSE: u8 = 2;

/// Shared tunnel state for both roles: the single connection accepted from
/// the main instance (remote gateway role) and the set of gateways this
/// instance keeps a connection open to (main role).
#[derive(Default)]
pub struct RemoteTunnel {
    pub master_connection: Arc<Mutex<Option<WebSocket>>>,
    active_gateways: Mutex<HashSet<String>>,
}

impl RemoteTunnel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeRequest {
    pub job_name: String,
    pub job_version: String,
    pub endpoint: String,
    pub auth_token: String,
    pub request_id: String,
}

#[derive(Debug, Clone)]
pub struct AuthorizeResponse {
    /// 0 on success; an HTTP-alike error code otherwise.
    pub error_code: u16,
    pub error_details: String,
    pub auth_data: Option<JobCallAuthData>,
}

fn put_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn take_field<'a>(data: &mut &'a [u8]) -> anyhow::Result<&'a [u8]> {
    anyhow::ensure!(data.len() >= 4, "truncated frame: missing field length");
    let (len_bytes, rest) = data.split_at(4);
    let len = u32::from_be_bytes(len_bytes.try_into().expect("4 bytes")) as usize;
    anyhow::ensure!(rest.len() >= len, "truncated frame: field shorter than declared");
    let (field, rest) = rest.split_at(len);
    *data = rest;
    Ok(field)
}

fn take_string(data: &mut &[u8]) -> anyhow::Result<String> {
    let field = take_field(data)?;
    String::from_utf8(field.to_vec()).context("frame field is not valid UTF-8")
}

fn frame_header(data: &mut &[u8], expected_kind: u8) -> anyhow::Result<()> {
    anyhow::ensure!(data.len() >= 2, "truncated frame: missing header");
    let (header, rest) = data.split_at(2);
    anyhow::ensure!(
        header[0] == FRAME_VERSION,
        "unsupported frame version: {}",
        header[0]
    );
    anyhow::ensure!(header[1] == expected_kind, "unexpected frame kind: {}", header[1]);
    *data = rest;
    Ok(())
}

pub fn encode_authorize_request(request: &AuthorizeRequest) -> Vec<u8> {
    let mut out = vec![FRAME_VERSION, KIND_AUTHORIZE_REQUEST];
    put_field(&mut out, request.job_name.as_bytes());
    put_field(&mut out, request.job_version.as_bytes());
    put_field(&mut out, request.endpoint.as_bytes());
    put_field(&mut out, request.auth_token.as_bytes());
    put_field(&mut out, request.request_id.as_bytes());
    out
}

pub fn decode_authorize_request(mut data: &[u8]) -> anyhow::Result<AuthorizeRequest> {
    frame_header(&mut data, KIND_AUTHORIZE_REQUEST)?;
    Ok(AuthorizeRequest {
        job_name: take_string(&mut data)?,
        job_version: take_string(&mut data)?,
        endpoint: take_string(&mut data)?,
        auth_token: take_string(&mut data)?,
        request_id: take_string(&mut data)?,
    })
}

pub fn encode_authorize_response(response: &AuthorizeResponse) -> anyhow::Result<Vec<u8>> {
    let mut out = vec![FRAME_VERSION, KIND_AUTHORIZE_RESPONSE];
    put_field(&mut out, &response.error_code.to_be_bytes());
    put_field(&mut out, response.error_details.as_bytes());
    // JSON keeps the authorization payload readable from any language.
    let auth_data = match &response.auth_data {
        Some(auth_data) => serde_json::to_vec(auth_data).context("encode auth data")?,
        None => Vec::new(),
    };
    put_field(&mut out, &auth_data);
    Ok(out)
}

pub fn decode_authorize_response(mut data: &[u8]) -> anyhow::Result<AuthorizeResponse> {
    frame_header(&mut data, KIND_AUTHORIZE_RESPONSE)?;
    let code_field = take_field(&mut data)?;
    anyhow::ensure!(code_field.len() == 2, "malformed error code field");
    let error_code = u16::from_be_bytes(code_field.try_into().expect("2 bytes"));
    let error_details = take_string(&mut data)?;
    let auth_field = take_field(&mut data)?;
    let auth_data = if auth_field.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(auth_field).context("decode auth data")?)
    };
    Ok(AuthorizeResponse {
        error_code,
        error_details,
        auth_data,
    })
}

/// Main role: make sure a persistent connection to the remote gateway
/// exists, so the remote can authorize calls against this cluster's
/// Lifecycle. Dial failures are logged, not fatal: the proxied call may
/// still succeed if the remote holds a previous connection.
pub async fn ensure_gateway_connection(
    services: &Arc<Services>,
    gateway_host: &str,
    gateway_token: Option<&str>,
) {
    {
        let active = services.tunnel.active_gateways.lock().await;
        if active.contains(gateway_host) {
            return;
        }
    }

    let url = format!("ws://{gateway_host}/pub/remote/ws");
    tracing::debug!(url = %url, "connecting to remote websocket");
    let mut request = match tungstenite::client::IntoClientRequest::into_client_request(url.as_str())
    {
        Ok(request) => request,
        Err(err) => {
            tracing::error!(error = %err, url = %url, "invalid remote websocket URL");
            return;
        }
    };
    if let Some(token) = gateway_token {
        if let Ok(value) = token.parse() {
            request.headers_mut().insert(GATEWAY_TOKEN_HEADER, value);
        }
    }

    match tokio_tungstenite::connect_async(request).await {
        Ok((ws_stream, _)) => {
            services
                .tunnel
                .active_gateways
                .lock()
                .await
                .insert(gateway_host.to_string());
            tracing::info!(url = %url, "connected to remote websocket");
            tokio::spawn(serve_gateway_calls(
                services.clone(),
                ws_stream,
                gateway_host.to_string(),
            ));
        }
        Err(err) => {
            tracing::error!(error = %err, url = %url, "failed to connect to remote websocket");
        }
    }
}

/// Main role: answer authorization RPCs arriving from the remote gateway
/// over the tunnel, one frame in, one frame out.
async fn serve_gateway_calls(
    services: Arc<Services>,
    mut ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    gateway_host: String,
) {
    loop {
        let message = match ws_stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                tracing::error!(error = %err, "gateway websocket error, closing connection");
                break;
            }
            None => break,
        };
        let data = match message {
            tungstenite::Message::Binary(data) => data,
            tungstenite::Message::Close(_) => break,
            _ => continue,
        };

        let response_frame = match handle_gateway_call(&services, &data).await {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "gateway websocket call error");
                continue;
            }
        };
        if let Err(err) = ws_stream
            .send(tungstenite::Message::Binary(response_frame.into()))
            .await
        {
            tracing::error!(error = %err, "gateway websocket write failed");
            break;
        }
        tracing::debug!(remote_gateway = %gateway_host, "Lifecycle call made on behalf of remote instance");
    }

    services
        .tunnel
        .active_gateways
        .lock()
        .await
        .remove(&gateway_host);
    tracing::debug!(gateway_host = %gateway_host, "connection closed to remote websocket");
}

/// Decode one authorize request, call the local Lifecycle on the remote's
/// behalf and encode the verdict.
async fn handle_gateway_call(services: &Arc<Services>, data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let request = decode_authorize_request(data)?;
    let client = services.master_lifecycle_client(&request.auth_token, &request.request_id);
    let response = match client
        .authorize_caller(&request.job_name, &request.job_version, &request.endpoint)
        .await
    {
        Ok(auth_data) => AuthorizeResponse {
            error_code: 0,
            error_details: String::new(),
            auth_data: Some(auth_data),
        },
        Err(err) => {
            let error_code = match &err {
                LifecycleError::Unauthenticated(_) => 401,
                LifecycleError::NotFound(_) => 404,
                LifecycleError::ServiceUnavailable(_) => 503,
                LifecycleError::Other(_) => 500,
            };
            AuthorizeResponse {
                error_code,
                error_details: err.to_string(),
                auth_data: None,
            }
        }
    };
    encode_authorize_response(&response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_request_round_trips() {
        let request = AuthorizeRequest {
            job_name: "adder".to_string(),
            job_version: "latest".to_string(),
            endpoint: "/api/v1/perform".to_string(),
            auth_token: "secret".to_string(),
            request_id: "req-1".to_string(),
        };
        let decoded = decode_authorize_request(&encode_authorize_request(&request)).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn authorize_response_carries_error_code() {
        let response = AuthorizeResponse {
            error_code: 401,
            error_details: "authentication failed".to_string(),
            auth_data: None,
        };
        let decoded =
            decode_authorize_response(&encode_authorize_response(&response).unwrap()).unwrap();
        assert_eq!(decoded.error_code, 401);
        assert_eq!(decoded.error_details, "authentication failed");
        assert!(decoded.auth_data.is_none());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut frame = encode_authorize_request(&AuthorizeRequest {
            job_name: "adder".to_string(),
            job_version: "latest".to_string(),
            endpoint: "/".to_string(),
            auth_token: String::new(),
            request_id: String::new(),
        });
        frame[0] = 9;
        assert!(decode_authorize_request(&frame).is_err());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = encode_authorize_request(&AuthorizeRequest {
            job_name: "adder".to_string(),
            job_version: "latest".to_string(),
            endpoint: "/".to_string(),
            auth_token: String::new(),
            request_id: String::new(),
        });
        assert!(decode_authorize_request(&frame[..frame.len() - 3]).is_err());
    }
}
