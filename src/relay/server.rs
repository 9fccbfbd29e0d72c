use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::relay::client::RelayClient;
use crate::relay::context::RelayContext;
use crate::utils::error::Result;

/// Binds `addr` and serves relay clients on `path` until the listener fails.
pub async fn start_relay_server(addr: &str, path: &str, ctx: Arc<RelayContext>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("relay listening on ws://{}{}", listener.local_addr()?, path);
    serve(listener, path, ctx).await
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, path: &str, ctx: Arc<RelayContext>) -> Result<()> {
    let path: Arc<str> = Arc::from(path);
    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        let path = path.clone();
        spawn(async move {
            handle_connection(stream, peer, &path, ctx).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, path: &str, ctx: Arc<RelayContext>) {
    let check_path = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        if req.uri().path() == path {
            Ok(resp)
        } else {
            let mut not_found = ErrorResponse::new(Some(format!("no relay at {}", req.uri().path())));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Err(not_found)
        }
    };

    let ws_stream = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = RelayClient::new(tx);
    let client_id = client.id.clone();

    if let Err(e) = ctx.register(client).await {
        error!(%client_id, error = %e, "could not start the stream for new client");
        let _ = ws_sender.send(WsMessage::Close(None)).await;
        return;
    }

    // relay -> browser
    let writer_id = client_id.clone();
    let writer = spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                debug!(client_id = %writer_id, error = %e, "send failed");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Frames from the browser carry nothing; read only to notice the close.
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%client_id, error = %e, "read failed");
                break;
            }
        }
    }

    info!(%client_id, %peer, "client disconnected");
    if let Err(e) = ctx.unregister(&client_id).await {
        warn!(%client_id, error = %e, "stopping the stream failed");
    }
    writer.abort();
}
