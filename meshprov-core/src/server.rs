//! JSON request server over TCP.
//!
//! Each message in either direction is a 2-byte little-endian length followed
//! by that many bytes of UTF-8 JSON. Requests are `{"method", "id", "params"?}`;
//! responses are `{"jsonrpc": "2.0", "result"?, "error", "id"}`. Requests from
//! every connection run one at a time.

use crate::error::MeshError;
use crate::session::MeshSession;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::io;
use std::sync::Arc;
use strum::Display;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default listen address of the request server.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:1234";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    Ok,
    Format,
    NoMethodFound,
    InvalidArguments,
    Internal,
    DeviceNotFound,
    ElementNotFound,
    ModelNotFound,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::Format => 1,
            ErrorCode::NoMethodFound => 2,
            ErrorCode::InvalidArguments => 3,
            ErrorCode::Internal => 4,
            ErrorCode::DeviceNotFound => 100,
            ErrorCode::ElementNotFound => 101,
            ErrorCode::ModelNotFound => 102,
        }
    }
}

impl From<&MeshError> for ErrorCode {
    fn from(err: &MeshError) -> Self {
        match err {
            MeshError::DeviceNotFound(_) => ErrorCode::DeviceNotFound,
            MeshError::ElementNotFound { .. } => ErrorCode::ElementNotFound,
            MeshError::ModelNotFound { .. } => ErrorCode::ModelNotFound,
            MeshError::InvalidArgument(_) => ErrorCode::InvalidArguments,
            _ => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub method: String,
    pub id: Value,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub error: i32,
    pub id: Value,
}

impl Response {
    pub fn new(result: Option<Value>, error: ErrorCode, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result,
            error: error.code(),
            id,
        }
    }

    pub fn ok(result: Option<Value>, id: Value) -> Self {
        Self::new(result, ErrorCode::Ok, id)
    }

    pub fn error(error: ErrorCode, id: Value) -> Self {
        Self::new(None, error, id)
    }
}

/// Read one length-prefixed frame. `Ok(None)` when the peer closed cleanly
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 2];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut payload = vec![0u8; usize::from(u16::from_le_bytes(len))];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the 2-byte length prefix", payload.len()),
        )
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

fn param<T: DeserializeOwned>(
    params: Option<&Map<String, Value>>,
    name: &str,
) -> Result<T, ErrorCode> {
    let value = params
        .and_then(|p| p.get(name))
        .ok_or(ErrorCode::InvalidArguments)?;
    serde_json::from_value(value.clone()).map_err(|_| ErrorCode::InvalidArguments)
}

fn parse_uuid(text: &str) -> Result<[u8; 16], ErrorCode> {
    let mut uuid = [0u8; 16];
    hex::decode_to_slice(text, &mut uuid).map_err(|_| ErrorCode::InvalidArguments)?;
    Ok(uuid)
}

/// `list_nodes` entries: element indices and bare model ids.
pub fn nodes_to_json(session: &MeshSession) -> Value {
    session
        .nodes()
        .iter()
        .map(|node| {
            let elements: Vec<Value> = node
                .elements
                .iter()
                .map(|element| {
                    let models: Vec<u16> = element.models.iter().map(|m| m.model_id).collect();
                    json!({ "index": element.index, "models": models })
                })
                .collect();
            json!({ "unicast_address": node.unicast_address, "elements": elements })
        })
        .collect()
}

pub struct RequestServer {
    session: Arc<MeshSession>,
    execution: Mutex<()>,
}

impl RequestServer {
    pub fn new(session: Arc<MeshSession>) -> Self {
        Self {
            session,
            execution: Mutex::new(()),
        }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!("Request server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            info!("Client connected: {peer}");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!("Connection {peer} failed: {e}");
                }
                info!("Client disconnected: {peer}");
            });
        }
    }

    /// Answer framed requests on `stream` until the peer closes it.
    pub async fn handle_connection<S>(&self, mut stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(frame) = read_frame(&mut stream).await? {
            let response = self.handle_frame(&frame).await;
            let payload = serde_json::to_vec(&response).map_err(io::Error::other)?;
            write_frame(&mut stream, &payload).await?;
        }
        Ok(())
    }

    async fn handle_frame(&self, frame: &[u8]) -> Response {
        let value: Value = match serde_json::from_slice(frame) {
            Ok(value) => value,
            Err(e) => {
                debug!("Malformed request: {e}");
                return Response::error(ErrorCode::Format, json!(-1));
            }
        };
        let id = value.get("id").cloned().unwrap_or(json!(-1));
        match serde_json::from_value::<Request>(value) {
            Ok(request) => self.execute(request).await,
            Err(e) => {
                debug!("Malformed request: {e}");
                Response::error(ErrorCode::Format, id)
            }
        }
    }

    pub async fn execute(&self, request: Request) -> Response {
        let _serialized = self.execution.lock().await;
        debug!("Executing {method}", method = request.method);
        let id = request.id.clone();
        match self.run(&request).await {
            Ok(result) => Response::ok(result, id),
            Err((code, result)) => {
                if code == ErrorCode::Internal {
                    warn!("{method} failed", method = request.method);
                }
                Response::new(result, code, id)
            }
        }
    }

    async fn run(&self, request: &Request) -> Result<Option<Value>, (ErrorCode, Option<Value>)> {
        let session = &self.session;
        let params = request.params.as_ref();
        let bare = |code: ErrorCode| (code, None);
        let mesh = |err: MeshError| {
            debug!("{err}");
            (ErrorCode::from(&err), None)
        };

        match request.method.as_str() {
            "start_scan" => session.start_scan().map_err(mesh).map(|_| None),
            "stop_scan" => session.stop_scan().map_err(mesh).map(|_| None),
            "list_unprovisioned_devices" => {
                let uuids: Vec<String> = session
                    .unprovisioned_devices()
                    .iter()
                    .map(hex::encode)
                    .collect();
                Ok(Some(json!(uuids)))
            }
            "provision" => {
                let text: String = param(params, "uuid").map_err(bare)?;
                let uuid = parse_uuid(&text).map_err(bare)?;
                let report = session.provision(uuid).await.map_err(mesh)?;
                if report.is_success() {
                    Ok(None)
                } else {
                    Err((ErrorCode::Internal, serde_json::to_value(&report).ok()))
                }
            }
            "unprovision" => {
                let address: u16 = param(params, "unicast_address").map_err(bare)?;
                session.unprovision(address).await.map_err(mesh)?;
                Ok(None)
            }
            "list_nodes" => Ok(Some(nodes_to_json(session))),
            "client_set_publish" | "server_set_subscribe" => {
                let address: u16 = param(params, "unicast_address").map_err(bare)?;
                let element: u16 = param(params, "element").map_err(bare)?;
                let model_id: u16 = param(params, "model_id").map_err(bare)?;
                let target: u16 = param(params, "address").map_err(bare)?;
                let configured = if request.method == "client_set_publish" {
                    session
                        .client_set_publish(address, element, model_id, target)
                        .await
                } else {
                    session
                        .server_set_subscribe(address, element, model_id, target)
                        .await
                };
                configured.map_err(mesh)?;
                Ok(None)
            }
            _ => Err(bare(ErrorCode::NoMethodFound)),
        }
    }
}
