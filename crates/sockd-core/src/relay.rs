/// Byte-transparent relay between the client and server sockets.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Per-direction read size. A read of `n` bytes is always written out in
/// full before the next read is issued.
pub const MAX_FRAME: usize = 1024;

/// Bytes relayed in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTotals {
    pub client_to_server: u64,
    pub server_to_client: u64,
}

/// Pump bytes both ways until each direction has terminated.
///
/// The two directions are independent: each owns its buffer, and EOF or an
/// error on one shuts down the peer's write half so half-close propagates
/// while the other direction keeps draining.
pub async fn run(client: TcpStream, server: TcpStream) -> RelayTotals {
    let (client_read, client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();

    let (client_to_server, server_to_client) = tokio::join!(
        pump(client_read, server_write),
        pump(server_read, client_write),
    );

    RelayTotals {
        client_to_server,
        server_to_client,
    }
}

async fn pump(mut from: OwnedReadHalf, mut to: OwnedWriteHalf) -> u64 {
    let mut buf = [0u8; MAX_FRAME];
    let mut total = 0u64;
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if to.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }
    let _ = to.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn test_relay_is_byte_transparent_both_ways() {
        let (client_far, client_near) = pair().await;
        let (server_far, server_near) = pair().await;

        let relay = tokio::spawn(run(client_near, server_near));

        let (mut client, mut server) = (client_far, server_far);
        client.write_all(b"hello from client").await.unwrap();
        let mut buf = [0u8; 17];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from client");

        server.write_all(b"and hello back").await.unwrap();
        let mut buf = [0u8; 14];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"and hello back");

        drop(client);
        drop(server);
        let totals = relay.await.unwrap();
        assert_eq!(totals.client_to_server, 17);
        assert_eq!(totals.server_to_client, 14);
    }

    #[tokio::test]
    async fn test_relay_preserves_order_across_frames() {
        let (client_far, client_near) = pair().await;
        let (server_far, server_near) = pair().await;

        let relay = tokio::spawn(run(client_near, server_near));

        // More than one MAX_FRAME read's worth, in uneven chunks.
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut client = client_far;
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                for chunk in payload.chunks(777) {
                    client.write_all(chunk).await.unwrap();
                }
                client.shutdown().await.unwrap();
                client
            })
        };

        let mut server = server_far;
        let mut received = vec![0u8; payload.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        // Half-close propagated: the server side sees EOF.
        let mut rest = [0u8; 1];
        assert_eq!(server.read(&mut rest).await.unwrap(), 0);

        drop(writer.await.unwrap());
        drop(server);
        let totals = relay.await.unwrap();
        assert_eq!(totals.client_to_server, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_relay_survives_one_sided_close() {
        let (client_far, client_near) = pair().await;
        let (server_far, server_near) = pair().await;

        let relay = tokio::spawn(run(client_near, server_near));

        // Client goes away immediately; the server direction still drains.
        drop(client_far);
        let mut server = server_far;
        server.write_all(b"late").await.unwrap();
        drop(server);

        let totals = relay.await.unwrap();
        assert_eq!(totals.client_to_server, 0);
    }
}
