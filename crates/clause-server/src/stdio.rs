//! Line-delimited RPC over a byte stream, for hosts that spawn the
//! service as a child process.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::handlers::{self, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};

/// Serve one request per line until `reader` hits EOF. Each request runs
/// as its own task, so responses are written in completion order; callers
/// correlate them by `id`. Returns once every in-flight request has been
/// answered.
pub async fn serve_stdio<R, W>(
    state: Arc<HandlerState>,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcResponse>();
    let mut lines = reader.lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                match line? {
                    Some(line) => accept_line(&state, line.trim(), &tx),
                    None => {
                        tracing::info!("stdio input closed");
                        input_open = false;
                    }
                }
            }
            Some(response) = rx.recv() => write_response(&mut writer, &response).await?,
            else => break,
        }
        if !input_open {
            break;
        }
    }

    // Drain whatever is still in flight once input is exhausted.
    drop(tx);
    while let Some(response) = rx.recv().await {
        write_response(&mut writer, &response).await?;
    }
    Ok(())
}

fn accept_line(state: &Arc<HandlerState>, line: &str, tx: &mpsc::UnboundedSender<RpcResponse>) {
    if line.is_empty() {
        return;
    }
    let request = match serde_json::from_str::<RpcRequest>(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable stdio request");
            let _ = tx.send(RpcResponse::parse_error());
            return;
        }
    };

    let state = Arc::clone(state);
    let tx = tx.clone();
    tokio::spawn(async move {
        let params = request.params.unwrap_or(serde_json::json!({}));
        let response = handlers::dispatch(&state, &request.method, &params, request.id).await;
        if tx.send(response).is_err() {
            tracing::debug!(method = %request.method, "stdio writer gone, response dropped");
        }
    });
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &RpcResponse,
) -> std::io::Result<()> {
    match serde_json::to_string(response) {
        Ok(mut json) => {
            json.push('\n');
            writer.write_all(json.as_bytes()).await?;
            writer.flush().await
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode rpc response");
            Ok(())
        }
    }
}
