//! linkfront/src/connection.rs
//! Per-session workflow: SOCKS5 negotiation, upstream dispatch, relay.

use crate::protocol::{self, Reply};
use crate::server::Server;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, info};

/// Runs one client session to completion. Every exit path closes the client
/// socket (dropped on return) and releases the upstream connection from its
/// link's registry.
pub(crate) async fn handle_client(server: Arc<Server>, mut client: TcpStream, peer: SocketAddr) {
    match protocol::sub_negotiation(&mut client).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(err) => {
            error!(%peer, "Socket error while trying to communicate with client: \"{err}\".");
            return;
        }
    }

    let mut buf = [0u8; protocol::MAX_PACKET];
    let n = match client.read(&mut buf).await {
        Ok(0) => return,
        Ok(n) => n,
        Err(err) => {
            error!(%peer, "Socket error while trying to communicate with client: \"{err}\".");
            let _ = protocol::send_reply(&mut client, Reply::ServerFailure).await;
            return;
        }
    };
    let request = match protocol::parse_request(&buf[..n]) {
        Ok(request) => request,
        Err(err) => {
            error!(%peer, "{err}.");
            let _ = protocol::send_reply(&mut client, err.reply()).await;
            return;
        }
    };

    let Some(link) = server.balancer.pick(&request) else {
        error!(%peer, "No Link available to handle the request.");
        let _ = protocol::send_reply(&mut client, Reply::ServerFailure).await;
        return;
    };

    let connection_id = server.next_connection_id();
    let pending = match link.open(connection_id) {
        Ok(pending) => pending,
        Err(err) => {
            error!(%peer, link = %link, "{err}.");
            let _ = protocol::send_reply(&mut client, Reply::ServerFailure).await;
            return;
        }
    };
    let mut upstream = match pending.connect(&request.domain, request.port).await {
        Ok(connection) => connection,
        Err(err) => {
            error!(
                %peer, link = %link,
                "Socket error while trying to connect to {request}: \"{err}\".",
            );
            let _ = protocol::send_reply(&mut client, Reply::NetworkUnreachable).await;
            return;
        }
    };

    if let Err(err) = protocol::send_reply(&mut client, Reply::Succeeded).await {
        error!(%peer, "Socket error while trying to communicate with client: \"{err}\".");
        return;
    }

    info!(%peer, link = %link, "Proxying {request}.");
    if let Err(err) = relay(
        &server,
        &mut client,
        &mut upstream.stream,
        link.timeout_duration(),
    )
    .await
    {
        error!(%peer, "Socket error while trying to communicate with client: \"{err}\".");
    }
}

/// Shuttles bytes between the client and the upstream until one side
/// closes, a socket fails, the session idles past `idle`, or the server is
/// asked to stop. In-order delivery per direction; 2 KiB reads.
async fn relay<C, U>(server: &Server, client: &mut C, upstream: &mut U, idle: Duration) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    U: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut client_buf = [0u8; 2048];
    let mut upstream_buf = [0u8; 2048];

    loop {
        if server.is_stopped() {
            return Ok(());
        }
        tokio::select! {
            result = client.read(&mut client_buf) => {
                let n = result?;
                if n == 0 {
                    return Ok(());
                }
                upstream.write_all(&client_buf[..n]).await?;
            }
            result = upstream.read(&mut upstream_buf) => {
                let n = result?;
                if n == 0 {
                    return Ok(());
                }
                client.write_all(&upstream_buf[..n]).await?;
            }
            _ = tokio::time::sleep(idle) => return Ok(()),
            _ = server.stopped() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::Balancer;
    use crate::link::Link;
    use crate::strategy::Strategy;

    #[tokio::test]
    async fn relay_round_trips_bytes_and_stops_on_close() {
        let server = Server::new(Balancer::new(Strategy::RoundRobin).add_link(Link::new()));
        let (mut client_side, mut client_peer) = tokio::io::duplex(256);
        let (mut upstream_side, mut upstream_peer) = tokio::io::duplex(256);

        let relay_task = tokio::spawn(async move {
            relay(
                &server,
                &mut client_peer,
                &mut upstream_peer,
                Duration::from_secs(5),
            )
            .await
        });

        client_side.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_side.write_all(b"pong").await.unwrap();
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // orderly close on one side ends the relay
        drop(client_side);
        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn relay_times_out_when_idle() {
        let server = Server::new(Balancer::new(Strategy::RoundRobin).add_link(Link::new()));
        let (_client_side, mut client_peer) = tokio::io::duplex(256);
        let (_upstream_side, mut upstream_peer) = tokio::io::duplex(256);

        relay(
            &server,
            &mut client_peer,
            &mut upstream_peer,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    }
}
