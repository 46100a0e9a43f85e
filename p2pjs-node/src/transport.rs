//! TCP transport: listener, outbound connects, and per-connection reader/writer tasks.
//!
//! Tasks never touch the node core; they report to the dispatcher through
//! `TransportEvent`s and receive encoded frames through an unbounded channel.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use p2pjs_core::{ConnectIntent, PeerAddress, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the transport tasks tell the dispatcher.
#[derive(Debug)]
pub enum TransportEvent {
    Accepted {
        stream: TcpStream,
        addr: SocketAddr,
    },
    Connected {
        stream: TcpStream,
        target: PeerAddress,
        intent: ConnectIntent,
    },
    ConnectFailed {
        target: PeerAddress,
        intent: ConnectIntent,
    },
    Data {
        peer: PeerId,
        bytes: Vec<u8>,
    },
    Closed {
        peer: PeerId,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Handle to a live connection. Dropping it closes the socket.
#[derive(Debug)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Queue an encoded frame. False when the writer has gone away.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(bytes).is_ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Bind the listening socket: dual-stack when available, IPv4 otherwise.
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
        Ok(l) => Ok(l),
        Err(e) => {
            tracing::debug!(error = %e, "IPv6 bind failed, falling back to IPv4");
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await
        }
    }
}

/// Accept connections until the dispatcher goes away.
pub fn spawn_listener(listener: TcpListener, events: EventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if events.send(TransportEvent::Accepted { stream, addr }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

/// Open an outbound connection in the background and report the outcome.
pub fn spawn_connect(target: PeerAddress, intent: ConnectIntent, events: EventSender) {
    tokio::spawn(async move {
        let addr = (target.address.as_str(), target.port);
        let res = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await;
        let event = match res {
            Ok(Ok(stream)) => TransportEvent::Connected {
                stream,
                target,
                intent,
            },
            Ok(Err(e)) => {
                tracing::debug!(addr = %target, error = %e, "connect failed");
                TransportEvent::ConnectFailed { target, intent }
            }
            Err(_) => {
                tracing::debug!(addr = %target, "connect timed out");
                TransportEvent::ConnectFailed { target, intent }
            }
        };
        let _ = events.send(event);
    });
}

/// Start reader and writer tasks for a new connection. The reader stays idle
/// until the peer's id arrives on the returned sender.
pub fn start(stream: TcpStream, events: EventSender) -> (Connection, oneshot::Sender<PeerId>) {
    let _ = stream.set_nodelay(true);
    let remote = stream.peer_addr().ok();
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (id_tx, id_rx) = oneshot::channel::<PeerId>();

    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                tracing::warn!(addr = ?remote, error = %e, "write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader = tokio::spawn(async move {
        let Ok(peer) = id_rx.await else {
            return;
        };
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let bytes = buf[..n].to_vec();
                    if events.send(TransportEvent::Data { peer, bytes }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "read failed");
                    break;
                }
            }
        }
        let _ = events.send(TransportEvent::Closed { peer });
    });

    (Connection { tx, reader }, id_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2pjs_core::PeerRegistry;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let _accept = spawn_listener(listener, events_tx.clone());

        spawn_connect(
            PeerAddress::new("127.0.0.1", port),
            ConnectIntent::default(),
            events_tx.clone(),
        );

        let mut reg: PeerRegistry<()> = PeerRegistry::new();
        let mut conns = Vec::new();
        while conns.len() < 2 {
            match events.recv().await.unwrap() {
                TransportEvent::Accepted { stream, addr } => {
                    let (conn, ready) = start(stream, events_tx.clone());
                    let id = reg.add((), addr.ip().to_string());
                    ready.send(id).unwrap();
                    conns.push((id, conn));
                }
                TransportEvent::Connected { stream, target, .. } => {
                    let (conn, ready) = start(stream, events_tx.clone());
                    let id = reg.add((), target.address);
                    ready.send(id).unwrap();
                    conns.push((id, conn));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        assert!(conns[0].1.send(b"ping".to_vec()));
        let mut got = Vec::new();
        while got.len() < 4 {
            match events.recv().await.unwrap() {
                TransportEvent::Data { peer, bytes } => {
                    assert_eq!(peer, conns[1].0);
                    got.extend(bytes);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(got, b"ping");

        // Dropping one side is seen as a close on the other.
        let (closed_side, _) = conns.remove(0);
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Closed { peer } => {
                    assert_ne!(peer, closed_side);
                    break;
                }
                TransportEvent::Data { .. } => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn refused_connect_is_reported() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = PeerAddress::new("127.0.0.1", port);
        spawn_connect(target.clone(), ConnectIntent::default(), tx);
        match rx.recv().await.unwrap() {
            TransportEvent::ConnectFailed { target: t, .. } => assert_eq!(t, target),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
