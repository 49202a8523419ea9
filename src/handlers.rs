//! UDP listener for the DNS relay.
//!
//! Reads datagrams off one socket and resolves each in its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::{net::UdpSocket, sync::Semaphore, task};

use crate::config::{ServerConfig, MIN_PACKET_SIZE};
use crate::errors::DnsError;
use crate::resolver::DnsRelay;

/// Run the UDP listener.
///
/// # Arguments
/// * `config` - The relay configuration.
/// * `relay` - The resolution pipeline shared by all queries.
///
/// # Returns
/// Only returns on a fatal error; binding failures are configuration errors.
pub async fn run_udp_server(config: ServerConfig, relay: Arc<DnsRelay>) -> Result<(), DnsError> {
    let socket = UdpSocket::bind(config.bind_addr)
        .await
        .map_err(|e| DnsError::Config(format!("Cannot listen on {}: {}", config.bind_addr, e)))?;
    info!("UDP DNS relay listening on {}", socket.local_addr()?);
    serve_udp(
        Arc::new(socket),
        relay,
        config.max_packet_size,
        config.max_inflight,
    )
    .await
}

/// Serve queries arriving on an already bound socket.
///
/// At most `max_inflight` datagrams are resolved at once; when all permits
/// are taken the loop stops reading until one finishes.
pub async fn serve_udp(
    socket: Arc<UdpSocket>,
    relay: Arc<DnsRelay>,
    max_packet_size: usize,
    max_inflight: usize,
) -> Result<(), DnsError> {
    let permits = Arc::new(Semaphore::new(max_inflight.max(1)));
    let mut buf = vec![0u8; max_packet_size.max(MIN_PACKET_SIZE)];

    loop {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DnsError::Shutdown)?;
        match socket.recv_from(&mut buf).await {
            Ok((amt, src)) => {
                let query = buf[..amt].to_vec();
                let socket = socket.clone();
                let relay = relay.clone();
                task::spawn(async move {
                    if let Err(e) = handle_udp_query(&query, src, &socket, &relay).await {
                        warn!("Dropped query from {}: {}", src, e);
                    }
                    drop(permit);
                });
            }
            Err(e) => error!("UDP receive error: {}", e),
        }
    }
}

/// Handle a UDP DNS query.
///
/// # Arguments
/// * `query` - The raw datagram.
/// * `src` - The source address of the query.
/// * `socket` - The UDP socket to send the response on.
/// * `relay` - The resolution pipeline.
///
/// # Returns
/// An error if nothing was sent back.
pub async fn handle_udp_query(
    query: &[u8],
    src: SocketAddr,
    socket: &UdpSocket,
    relay: &DnsRelay,
) -> Result<(), DnsError> {
    debug!("Received {} bytes from {}: {}", query.len(), src, hex::encode(query));

    let outcome = relay.resolve(query, src).await?;
    debug!(
        "Sending {} response of {} bytes to {}",
        outcome.kind(),
        outcome.bytes().len(),
        src
    );
    socket.send_to(outcome.bytes(), src).await?;
    Ok(())
}
