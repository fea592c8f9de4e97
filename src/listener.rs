//! UDP listener: binds the configured address and feeds datagrams to the
//! router, one spawned task per query so handlers run concurrently.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use crate::tunnel::Tunnel;
use crate::wire;

const MAX_DATAGRAM: usize = 4096;

/// Serves queries until shutdown. A bind failure is fatal and propagates.
pub async fn serve(tunnel: Arc<Tunnel>) -> Result<()> {
    let bind_addr = tunnel.config().bind_addr.clone();
    let socket = UdpSocket::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind UDP listener on {}", bind_addr))?;
    let socket = Arc::new(socket);

    log::info!(
        "listening on {} for '{}'",
        bind_addr,
        tunnel.config().apex
    );

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        if tunnel.is_shutdown() {
            return Ok(());
        }
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                log::warn!("recv failed: {}", e);
                continue;
            }
        };
        let packet = buf[..len].to_vec();
        let tunnel = tunnel.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            if let Some(response) = handle_datagram(&tunnel, &packet) {
                if let Err(e) = socket.send_to(&response, peer).await {
                    log::warn!("failed to send response to {}: {}", peer, e);
                }
            }
        });
    }
}

/// Handles one datagram. `None` means the packet was not even a parseable
/// query and gets no reply at all; parseable queries always get a response,
/// empty-answered unless they carry tunnel semantics.
pub fn handle_datagram(tunnel: &Tunnel, packet: &[u8]) -> Option<Vec<u8>> {
    let query = wire::parse_query(packet)?;
    let answers = tunnel.handle_query(&query.qname, query.qtype);
    Some(wire::build_response(query.txid, &query.question, &answers))
}
