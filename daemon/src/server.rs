//! TCP RPC server: accepts worker connections and feeds their calls to the
//! coordinator, one call at a time per connection.

use std::sync::Arc;

use remote::protocol::{Reply, Request};
use remote::streams::ControlConnection;
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;

pub struct RpcServer {
    addr: std::net::SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl RpcServer {
    pub async fn start(coordinator: Arc<Coordinator>) -> anyhow::Result<Self> {
        let port = coordinator.cfg().server_port;
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| anyhow::anyhow!("could not listen on port {port}: {e}"))?;
        let addr = listener.local_addr()?;
        tracing::info!("RPC server listening on {addr}");
        let stop = coordinator.server_stop_token();
        let accept_task = tokio::spawn(accept_loop(listener, coordinator, stop));
        Ok(Self { addr, accept_task })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// Wait for the accept loop and every connection task to wind down.
    /// Only returns promptly after the coordinator's server-stop token was
    /// cancelled.
    pub async fn stop(self) {
        let _ = self.accept_task.await;
    }
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    coordinator: Arc<Coordinator>,
    stop: CancellationToken,
) {
    let mut next_conn_id: u64 = 1;
    let mut connections = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let conn_id = next_conn_id;
                        next_conn_id += 1;
                        tracing::debug!("connection {conn_id:x} from {peer}");
                        stream.set_nodelay(true).ok();
                        connections.spawn(handle_connection(
                            coordinator.clone(),
                            conn_id,
                            stream,
                            stop.clone(),
                        ));
                    }
                    Err(error) => {
                        tracing::warn!("accept failed: {error}");
                    }
                }
            }
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
    tracing::debug!("RPC server stopped");
}

/// Serve one connection. Handler faults go out on the error-reply channel
/// and the loop continues; only transport failures or shutdown end it. The
/// session slot outlives the connection so the worker can reclaim it.
async fn handle_connection(
    coordinator: Arc<Coordinator>,
    conn_id: u64,
    stream: tokio::net::TcpStream,
    stop: CancellationToken,
) {
    let mut conn = ControlConnection::new(stream);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            request = conn.recv_mut().recv_object::<Request>() => {
                let request = match request {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(error) => {
                        tracing::debug!("connection {conn_id:x} transport error: {error:#}");
                        break;
                    }
                };
                let method = request.method();
                let reply = match coordinator.handle(conn_id, request).await {
                    Ok(response) => Reply::Ok(response),
                    Err(fault) => {
                        tracing::error!("{method} ({conn_id:x}): {fault}");
                        Reply::Err(fault)
                    }
                };
                if let Err(error) = conn.send_mut().send_message(&reply).await {
                    tracing::debug!("connection {conn_id:x} send failed: {error:#}");
                    break;
                }
            }
        }
    }
    coordinator.on_disconnect(conn_id);
}
