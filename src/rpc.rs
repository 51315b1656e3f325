// =============================================================================
// MOONWIRE v1.1 - JSON-RPC Server
// =============================================================================
//
// A single JSON-RPC entry with `chan_`-prefixed methods fronting the node.
// Every method schema-validates its params before touching the engine;
// read-only methods go straight to the store, mutating methods funnel
// through the update protocol (which takes the channel lock itself).
//
// Results are tagged: success carries `{"ok": value}`, failure serializes
// the engine error as `{message, context}` in the JSON-RPC error slot.
//
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::builder::{ConditionalTransferInput, ResolveConditionInput, WithdrawInput};
use crate::node::RouterNode;
use crate::schema::{
    get_bool, get_bytes32, get_identifier, get_object, get_opt_address, get_opt_amount,
    get_opt_identifier, get_str, get_u64, get_address, get_amount, Field, FieldKind, Schema,
};
use crate::types::{EngineError, QueuedUpdateStatus};

/// Default RPC listen port
pub const RPC_PORT: u16 = 8045;

// =============================================================================
// Envelope
// =============================================================================

#[derive(Deserialize)]
struct RpcRequest {
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: String,
    result: Option<Value>,
    error: Option<RpcError>,
    id: Value,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
    context: Value,
}

impl RpcResponse {
    fn success(id: Value, value: Value) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_string(),
            result: Some(json!({ "ok": value })),
            error: None,
            id,
        }
    }

    fn failure(id: Value, code: i32, err: &EngineError) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: err.message.clone(),
                context: json!({
                    "kind": err.kind,
                    "channel_address": err.channel_address,
                    "transfer_id": err.transfer_id,
                    "extra": err.context,
                }),
            }),
            id,
        }
    }

    fn parse_error(id: Value) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code: -32700,
                message: "parse error".to_string(),
                context: Value::Null,
            }),
            id,
        }
    }
}

fn error_code(err: &EngineError) -> i32 {
    match err.kind {
        crate::types::ErrorKind::Validation => -32602,
        _ => -32000,
    }
}

// =============================================================================
// Schemas
// =============================================================================

const NO_PARAMS: Schema = Schema {
    name: "chan_getStatus",
    fields: &[],
};

const GET_CHANNEL_STATE: Schema = Schema {
    name: "chan_getChannelState",
    fields: &[Field::required("channel_address", FieldKind::HexAddress)],
};

const GET_CHANNEL_BY_PARTICIPANTS: Schema = Schema {
    name: "chan_getChannelStateByParticipants",
    fields: &[
        Field::required("counterparty", FieldKind::Identifier),
        Field::required("chain_id", FieldKind::Uint),
    ],
};

const GET_TRANSFER_STATE: Schema = Schema {
    name: "chan_getTransferState",
    fields: &[Field::required("transfer_id", FieldKind::HexBytes32)],
};

const GET_TRANSFERS_BY_ROUTING_ID: Schema = Schema {
    name: "chan_getTransfersByRoutingId",
    fields: &[Field::required("routing_id", FieldKind::HexBytes32)],
};

const GET_QUEUED_UPDATES: Schema = Schema {
    name: "chan_getQueuedUpdates",
    fields: &[
        Field::required("channel_address", FieldKind::HexAddress),
        Field::optional("status", FieldKind::Str),
    ],
};

const SETUP: Schema = Schema {
    name: "chan_setup",
    fields: &[
        Field::required("counterparty_identifier", FieldKind::Identifier),
        Field::required("chain_id", FieldKind::Uint),
        Field::optional("timeout", FieldKind::Uint),
    ],
};

const DEPOSIT: Schema = Schema {
    name: "chan_deposit",
    fields: &[
        Field::required("channel_address", FieldKind::HexAddress),
        Field::required("asset_id", FieldKind::HexAddress),
    ],
};

const CREATE_TRANSFER: Schema = Schema {
    name: "chan_createTransfer",
    fields: &[
        Field::required("channel_address", FieldKind::HexAddress),
        Field::required("transfer_type", FieldKind::Str),
        Field::required("amount", FieldKind::Amount),
        Field::required("asset_id", FieldKind::HexAddress),
        Field::optional("details", FieldKind::Object),
        Field::optional("recipient", FieldKind::Identifier),
        Field::optional("recipient_chain_id", FieldKind::Uint),
        Field::optional("recipient_asset_id", FieldKind::HexAddress),
        Field::optional("timeout", FieldKind::Uint),
        Field::optional("meta", FieldKind::Object),
    ],
};

const RESOLVE_TRANSFER: Schema = Schema {
    name: "chan_resolveTransfer",
    fields: &[
        Field::required("channel_address", FieldKind::HexAddress),
        Field::required("transfer_id", FieldKind::HexBytes32),
        Field::required("transfer_resolver", FieldKind::Object),
        Field::optional("meta", FieldKind::Object),
    ],
};

const WITHDRAW: Schema = Schema {
    name: "chan_withdraw",
    fields: &[
        Field::required("channel_address", FieldKind::HexAddress),
        Field::required("amount", FieldKind::Amount),
        Field::required("asset_id", FieldKind::HexAddress),
        Field::required("recipient", FieldKind::HexAddress),
        Field::optional("fee", FieldKind::Amount),
        Field::optional("timeout", FieldKind::Uint),
    ],
};

const RESTORE_STATE: Schema = Schema {
    name: "chan_restoreState",
    fields: &[
        Field::required("counterparty_identifier", FieldKind::Identifier),
        Field::required("chain_id", FieldKind::Uint),
    ],
};

const SEND_IS_ALIVE: Schema = Schema {
    name: "chan_sendIsAlive",
    fields: &[
        Field::required("channel_address", FieldKind::HexAddress),
        Field::optional("skip_check_in", FieldKind::Bool),
    ],
};

fn schema_for(method: &str) -> Option<&'static Schema> {
    match method {
        "chan_getStatus" => Some(&NO_PARAMS),
        "chan_getChannelState" | "chan_getActiveTransfers" => Some(&GET_CHANNEL_STATE),
        "chan_getChannelStateByParticipants" => Some(&GET_CHANNEL_BY_PARTICIPANTS),
        "chan_getTransferState" => Some(&GET_TRANSFER_STATE),
        "chan_getTransfersByRoutingId" => Some(&GET_TRANSFERS_BY_ROUTING_ID),
        "chan_getQueuedUpdates" => Some(&GET_QUEUED_UPDATES),
        "chan_setup" | "chan_requestSetup" => Some(&SETUP),
        "chan_deposit" => Some(&DEPOSIT),
        "chan_createTransfer" => Some(&CREATE_TRANSFER),
        "chan_resolveTransfer" => Some(&RESOLVE_TRANSFER),
        "chan_withdraw" => Some(&WITHDRAW),
        "chan_restoreState" => Some(&RESTORE_STATE),
        "chan_sendIsAlive" => Some(&SEND_IS_ALIVE),
        _ => None,
    }
}

// =============================================================================
// Dispatch
// =============================================================================

fn parse_status(raw: &str) -> Result<QueuedUpdateStatus, EngineError> {
    match raw {
        "pending" => Ok(QueuedUpdateStatus::Pending),
        "processing" => Ok(QueuedUpdateStatus::Processing),
        "complete" => Ok(QueuedUpdateStatus::Complete),
        "failed" => Ok(QueuedUpdateStatus::Failed),
        "unverified" => Ok(QueuedUpdateStatus::Unverified),
        other => Err(EngineError::validation(format!(
            "unknown status {:?}",
            other
        ))),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value)
        .map_err(|e| EngineError::external(format!("result serialization: {}", e)))
}

/// Execute one `chan_` method against the node.
pub async fn execute_method(
    node: &RouterNode,
    method: &str,
    params: &Value,
) -> Result<Value, EngineError> {
    let schema = schema_for(method).ok_or_else(|| {
        EngineError::validation(format!("method {:?} not found", method))
    })?;
    schema.validate(params)?;

    match method {
        "chan_getStatus" => Ok(node.status()),
        "chan_getChannelState" => {
            let channel = get_address(params, "channel_address")?;
            to_value(node.get_channel_state(&channel).await?)
        }
        "chan_getChannelStateByParticipants" => {
            let counterparty = get_identifier(params, "counterparty")?;
            let chain_id = get_u64(params, "chain_id").unwrap_or(0);
            to_value(
                node.get_channel_state_by_participants(&counterparty, chain_id)
                    .await?,
            )
        }
        "chan_getActiveTransfers" => {
            let channel = get_address(params, "channel_address")?;
            to_value(node.get_active_transfers(&channel).await?)
        }
        "chan_getTransferState" => {
            let transfer_id = get_bytes32(params, "transfer_id")?;
            to_value(node.get_transfer_state(&transfer_id).await?)
        }
        "chan_getTransfersByRoutingId" => {
            let routing_id = get_bytes32(params, "routing_id")?;
            to_value(node.get_transfers_by_routing_id(&routing_id).await?)
        }
        "chan_getQueuedUpdates" => {
            let channel = get_address(params, "channel_address")?;
            let statuses = match params.get("status").and_then(|v| v.as_str()) {
                Some(raw) => vec![parse_status(raw)?],
                None => vec![
                    QueuedUpdateStatus::Pending,
                    QueuedUpdateStatus::Processing,
                    QueuedUpdateStatus::Complete,
                    QueuedUpdateStatus::Failed,
                    QueuedUpdateStatus::Unverified,
                ],
            };
            to_value(node.get_queued_updates(&channel, &statuses).await?)
        }
        "chan_setup" => {
            let counterparty = get_identifier(params, "counterparty_identifier")?;
            let chain_id = get_u64(params, "chain_id").unwrap_or(0);
            let timeout = get_u64(params, "timeout");
            to_value(node.setup(counterparty, chain_id, timeout).await?)
        }
        "chan_requestSetup" => {
            let counterparty = get_identifier(params, "counterparty_identifier")?;
            let chain_id = get_u64(params, "chain_id").unwrap_or(0);
            let timeout = get_u64(params, "timeout");
            let channel_address = node.request_setup(counterparty, chain_id, timeout).await?;
            Ok(json!({ "channel_address": channel_address }))
        }
        "chan_deposit" => {
            let channel = get_address(params, "channel_address")?;
            let asset_id = get_address(params, "asset_id")?;
            to_value(node.deposit(channel, asset_id).await?)
        }
        "chan_createTransfer" => {
            let input = ConditionalTransferInput {
                channel_address: get_address(params, "channel_address")?,
                transfer_type: get_str(params, "transfer_type")?.to_string(),
                amount: get_amount(params, "amount")?,
                asset_id: get_address(params, "asset_id")?,
                details: get_object(params, "details"),
                recipient: get_opt_identifier(params, "recipient")?,
                recipient_chain_id: get_u64(params, "recipient_chain_id"),
                recipient_asset_id: get_opt_address(params, "recipient_asset_id")?,
                timeout: get_u64(params, "timeout"),
                meta: get_object(params, "meta"),
            };
            to_value(node.create_transfer(input).await?)
        }
        "chan_resolveTransfer" => {
            let input = ResolveConditionInput {
                channel_address: get_address(params, "channel_address")?,
                transfer_id: get_bytes32(params, "transfer_id")?,
                transfer_resolver: get_object(params, "transfer_resolver"),
                meta: get_object(params, "meta"),
            };
            to_value(node.resolve_transfer(input).await?)
        }
        "chan_withdraw" => {
            let input = WithdrawInput {
                channel_address: get_address(params, "channel_address")?,
                amount: get_amount(params, "amount")?,
                asset_id: get_address(params, "asset_id")?,
                recipient: get_address(params, "recipient")?,
                fee: get_opt_amount(params, "fee")?,
                timeout: get_u64(params, "timeout"),
            };
            to_value(node.withdraw(input).await?)
        }
        "chan_restoreState" => {
            let counterparty = get_identifier(params, "counterparty_identifier")?;
            let chain_id = get_u64(params, "chain_id").unwrap_or(0);
            to_value(node.restore_state(counterparty, chain_id).await?)
        }
        "chan_sendIsAlive" => {
            let channel = get_address(params, "channel_address")?;
            let skip = get_bool(params, "skip_check_in").unwrap_or(false);
            node.send_is_alive(channel, skip).await?;
            Ok(json!({ "sent": true }))
        }
        _ => unreachable!("schema_for covered the method set"),
    }
}

// =============================================================================
// TCP Front
// =============================================================================

/// Bind the RPC listener and serve connections until the handle is dropped.
/// Returns the bound address (useful with port 0).
pub async fn start_rpc_server(
    node: Arc<RouterNode>,
    bind: &str,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), EngineError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| EngineError::external(format!("rpc bind {}: {}", bind, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| EngineError::external(format!("rpc local addr: {}", e)))?;
    info!(addr = %local_addr, "rpc listening");

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let node = node.clone();
                    tokio::spawn(async move {
                        handle_connection(node, socket).await;
                    });
                }
                Err(err) => {
                    warn!(error = %err, "rpc accept failed");
                }
            }
        }
    });
    Ok((local_addr, handle))
}

async fn handle_connection(node: Arc<RouterNode>, mut socket: TcpStream) {
    let mut buf = vec![0u8; 65536];
    let n = match socket.read(&mut buf).await {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };

    let response = handle_request(&node, &buf[..n]).await;
    let _ = socket.write_all(response.as_bytes()).await;
}

async fn handle_request(node: &RouterNode, data: &[u8]) -> String {
    let request_str = String::from_utf8_lossy(data);

    // body begins after the HTTP headers, when there are any
    let body = match request_str.find("\r\n\r\n") {
        Some(pos) => &request_str[pos + 4..],
        None => &request_str[..],
    };

    let request: RpcRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(_) => return http_response(&RpcResponse::parse_error(json!(null))),
    };

    let id = request.id.unwrap_or(json!(null));
    let params = request.params.unwrap_or(Value::Null);
    debug!(method = %request.method, "rpc request");

    match execute_method(node, &request.method, &params).await {
        Ok(value) => http_response(&RpcResponse::success(id, value)),
        Err(err) => http_response(&RpcResponse::failure(id, error_code(&err), &err)),
    }
}

fn http_response(response: &RpcResponse) -> String {
    let body = serde_json::to_string(response).unwrap_or_else(|_| "{}".to_string());
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

// =============================================================================
// Tests
// =============================================================================
