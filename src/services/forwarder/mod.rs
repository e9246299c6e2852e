use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::docker::discovery::{Forward, ForwardKind};

const UDP_BUF_SIZE: usize = 64 * 1024;

const BIND_ATTEMPTS: usize = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A socket bound by the reconciler ahead of the plane commit, so no bind
/// ever happens under the plane's writer lock.
#[derive(Debug)]
pub enum Bound {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// Binds the local endpoint of a stream forward. Retries briefly on
/// `AddrInUse` since a just-closed predecessor releases the address
/// asynchronously.
pub async fn bind(forward: &Forward) -> io::Result<Bound> {
    let mut last_err = io::Error::new(io::ErrorKind::AddrInUse, "bind retries exhausted");
    for attempt in 0..BIND_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(BIND_RETRY_DELAY).await;
        }
        let result = match forward.kind {
            ForwardKind::Tcp => TcpListener::bind(forward.key.as_str()).await.map(Bound::Tcp),
            ForwardKind::Udp => UdpSocket::bind(forward.key.as_str()).await.map(Bound::Udp),
            ForwardKind::Http => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "http forwards do not bind sockets",
                ))
            }
        };
        match result {
            Ok(bound) => return Ok(bound),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => last_err = err,
            Err(err) => return Err(err),
        }
    }
    Err(last_err)
}

/// Spawns the forwarder task for a pre-bound socket. The returned handle is
/// the teardown mechanism: aborting it drops the sockets.
pub fn spawn(forward: Forward, bound: Bound) -> JoinHandle<()> {
    tokio::spawn(async move {
        match bound {
            Bound::Tcp(listener) => run_tcp(forward, listener).await,
            Bound::Udp(socket) => run_udp(forward, socket).await,
        }
    })
}

/// Accept loop: every accepted connection gets its own task that dials the
/// upstream and splices the pair. A failed dial only costs that connection;
/// the loop keeps accepting.
async fn run_tcp(forward: Forward, listener: TcpListener) {
    debug!(prefix = %forward.prefix, upstream = %forward.uri, "tcp forwarder started");
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(prefix = %forward.prefix, error = %err, "accept failed, closing forwarder");
                break;
            }
        };

        let upstream_addr = forward.uri.clone();
        let prefix = forward.prefix.clone();
        tokio::spawn(async move {
            match TcpStream::connect(upstream_addr.as_str()).await {
                Ok(upstream) => splice(conn, upstream).await,
                Err(err) => {
                    warn!(prefix = %prefix, client = %peer, upstream = %upstream_addr, error = %err, "upstream dial failed");
                }
            }
        });
    }
}

/// Single-flow datagram relay: client datagrams go to the upstream, upstream
/// datagrams go back to the most recent client source address. Only one
/// concurrent client flow is supported per forward.
async fn run_udp(forward: Forward, local: UdpSocket) {
    let upstream = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(prefix = %forward.prefix, error = %err, "udp upstream socket failed");
            return;
        }
    };
    if let Err(err) = upstream.connect(forward.uri.as_str()).await {
        warn!(prefix = %forward.prefix, upstream = %forward.uri, error = %err, "udp upstream dial failed");
        return;
    }

    debug!(prefix = %forward.prefix, upstream = %forward.uri, "udp forwarder started");

    let client: Mutex<Option<SocketAddr>> = Mutex::new(None);

    let inbound = async {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            let (len, from) = match local.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(_) => break,
            };
            *client.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(from);
            if upstream.send(&buf[..len]).await.is_err() {
                break;
            }
        }
    };

    let outbound = async {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            let len = match upstream.recv(&mut buf).await {
                Ok(received) => received,
                Err(_) => break,
            };
            let target = *client.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(target) = target else { continue };
            if local.send_to(&buf[..len], target).await.is_err() {
                break;
            }
        }
    };

    // either side finishing closes both sockets
    tokio::select! {
        () = inbound => {}
        () = outbound => {}
    }
    debug!(prefix = %forward.prefix, "udp forwarder closed");
}

/// Starts two one-way copies over the pair; the first side to finish (EOF or
/// error) tears the whole pair down.
pub async fn splice(mut local: TcpStream, mut remote: TcpStream) {
    {
        let (mut local_read, mut local_write) = local.split();
        let (mut remote_read, mut remote_write) = remote.split();

        tokio::select! {
            sent = tokio::io::copy(&mut local_read, &mut remote_write) => {
                if let Ok(bytes) = sent {
                    debug!(bytes, "client side closed");
                }
            }
            received = tokio::io::copy(&mut remote_read, &mut local_write) => {
                if let Ok(bytes) = received {
                    debug!(bytes, "upstream side closed");
                }
            }
        }
    }

    let _ = local.shutdown().await;
    let _ = remote.shutdown().await;
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn forward(kind: ForwardKind, key: &str, uri: &str) -> Forward {
        Forward {
            name: "t".to_string(),
            kind,
            key: key.to_string(),
            prefix: format!("{kind}://{key}"),
            uri: uri.to_string(),
            wildcard: false,
        }
    }

    #[tokio::test]
    async fn test_splice_copies_both_ways_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let upstream = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            conn.write_all(b"pong").await.unwrap();
        });

        let client_side = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_side.local_addr().unwrap();

        let spliced = tokio::spawn(async move {
            let (conn, _) = client_side.accept().await.unwrap();
            let remote = TcpStream::connect(addr).await.unwrap();
            splice(conn, remote).await;
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        drop(client);

        upstream.await.unwrap();
        spliced.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_forwarder_end_to_end() {
        // echo upstream
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = match upstream.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 5];
                    if conn.read_exact(&mut buf).await.is_ok() {
                        let _ = conn.write_all(&buf).await;
                    }
                });
            }
        });

        let fwd = forward(ForwardKind::Tcp, "127.0.0.1:0", &upstream_addr.to_string());
        let bound = bind(&fwd).await.unwrap();
        let local_addr = match &bound {
            Bound::Tcp(listener) => listener.local_addr().unwrap(),
            Bound::Udp(_) => unreachable!(),
        };
        let task = spawn(fwd, bound);

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // closing the forwarder aborts the accept loop
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_udp_forwarder_round_trip() {
        // echo upstream
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((len, from)) = upstream.recv_from(&mut buf).await {
                let _ = upstream.send_to(&buf[..len], from).await;
            }
        });

        let fwd = forward(ForwardKind::Udp, "127.0.0.1:0", &upstream_addr.to_string());
        let bound = bind(&fwd).await.unwrap();
        let local_addr = match &bound {
            Bound::Udp(socket) => socket.local_addr().unwrap(),
            Bound::Tcp(_) => unreachable!(),
        };
        let task = spawn(fwd, bound);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"probe", local_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"probe");

        task.abort();
    }
}
