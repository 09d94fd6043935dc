//! Raft message transport over the mesh packet socket
//!
//! Two loops: inbound datagrams are decoded and handed to the driver;
//! outbound messages are encoded, addressed by translating the target node
//! ID to a mesh peer name, and sent. Anything that cannot be delivered is
//! reported unreachable so Raft backs off that peer. Raft retransmits, so
//! dropped packets are tolerated.

use crate::common::{Config, Error};
use crate::mesh::{MeshAddr, Mesh};
use protobuf::Message as _;
use raft::eraftpb::Message;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub struct Transport<M: Mesh> {
    mesh: Arc<M>,
    stop_tx: Option<oneshot::Sender<()>>,
    recv_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl<M: Mesh> Transport<M> {
    pub fn start(
        mesh: Arc<M>,
        config: &Config,
        incoming_tx: mpsc::Sender<Message>,
        outgoing_rx: mpsc::Receiver<Message>,
        unreachable_tx: mpsc::Sender<u64>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let recv_task = tokio::spawn(recv_loop(mesh.clone(), config.max_packet_bytes, incoming_tx));
        let send_task = tokio::spawn(send_loop(
            mesh.clone(),
            config.max_packet_bytes,
            outgoing_rx,
            unreachable_tx,
            stop_rx,
        ));
        Self {
            mesh,
            stop_tx: Some(stop_tx),
            recv_task,
            send_task,
        }
    }

    /// Close the packet socket and wait for both loops to finish.
    pub async fn stop(mut self) {
        self.mesh.close();
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.recv_task).await;
        let _ = (&mut self.send_task).await;
        tracing::debug!("transport: stopped");
    }
}

async fn recv_loop<M: Mesh>(mesh: Arc<M>, max_packet_bytes: usize, incoming_tx: mpsc::Sender<Message>) {
    let mut buf = vec![0u8; max_packet_bytes];
    loop {
        let (n, from) = match mesh.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                tracing::warn!("transport: recv: {} (dropped)", e);
                continue;
            }
            Err(e) => {
                tracing::debug!("transport: recv: {} (exiting)", e);
                return;
            }
        };
        let msg = match Message::parse_from_bytes(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("transport: unmarshal from {}: {} (dropped)", from, e);
                continue;
            }
        };
        if incoming_tx.send(msg).await.is_err() {
            tracing::debug!("transport: driver gone (exiting)");
            return;
        }
    }
}

async fn send_loop<M: Mesh>(
    mesh: Arc<M>,
    max_packet_bytes: usize,
    mut outgoing_rx: mpsc::Receiver<Message>,
    unreachable_tx: mpsc::Sender<u64>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        let msg = tokio::select! {
            _ = &mut stop_rx => return,
            msg = outgoing_rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };
        let to = msg.to;
        if let Err(e) = send_one(mesh.as_ref(), max_packet_bytes, &msg).await {
            tracing::debug!("transport: send to {:x}: {}", to, e);
            if !matches!(e, Error::TooLarge { .. }) {
                // Lossy; Raft learns about the peer again on the next failure.
                let _ = unreachable_tx.try_send(to);
            }
        }
    }
}

async fn send_one<M: Mesh>(mesh: &M, max_packet_bytes: usize, msg: &Message) -> crate::Result<()> {
    let buf = msg.write_to_bytes()?;
    if buf.len() > max_packet_bytes {
        tracing::warn!(
            "transport: {:?} to {:x} is {} bytes, over the {} byte packet limit (dropped)",
            msg.get_msg_type(),
            msg.to,
            buf.len(),
            max_packet_bytes
        );
        return Err(Error::TooLarge {
            size: buf.len(),
            max: max_packet_bytes,
        });
    }
    let name = mesh.translate(msg.to)?;
    let addr = MeshAddr { name, uid: msg.to };
    mesh.send_to(&buf, &addr).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{LocalMesh, PacketConn};
    use raft::eraftpb::MessageType;
    use std::time::Duration;

    fn heartbeat(from: u64, to: u64) -> Message {
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.from = from;
        msg.to = to;
        msg.term = 3;
        msg
    }

    struct Wired {
        transport: Transport<crate::mesh::LocalPeer>,
        incoming_rx: mpsc::Receiver<Message>,
        outgoing_tx: mpsc::Sender<Message>,
        unreachable_rx: mpsc::Receiver<u64>,
        uid: u64,
    }

    fn wire(mesh: &LocalMesh, name: &str) -> Wired {
        let peer = Arc::new(mesh.join(name));
        let uid = peer.uid();
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(16);
        let (unreachable_tx, unreachable_rx) = mpsc::channel(16);
        let transport = Transport::start(peer, &Config::default(), incoming_tx, outgoing_rx, unreachable_tx);
        Wired {
            transport,
            incoming_rx,
            outgoing_tx,
            unreachable_rx,
            uid,
        }
    }

    #[tokio::test]
    async fn test_messages_cross_the_mesh() {
        let mesh = LocalMesh::new();
        let a = wire(&mesh, "a");
        let mut b = wire(&mesh, "b");

        a.outgoing_tx.send(heartbeat(a.uid, b.uid)).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), b.incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.get_msg_type(), MessageType::MsgHeartbeat);
        assert_eq!(got.from, a.uid);
        assert_eq!(got.term, 3);

        a.transport.stop().await;
        b.transport.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_target_reported_unreachable() {
        let mesh = LocalMesh::new();
        let mut a = wire(&mesh, "a");

        a.outgoing_tx.send(heartbeat(a.uid, 0xdead)).await.unwrap();
        let uid = tokio::time::timeout(Duration::from_secs(2), a.unreachable_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uid, 0xdead);
        a.transport.stop().await;
    }

    #[tokio::test]
    async fn test_full_unreachable_channel_does_not_block_sends() {
        let mesh = LocalMesh::new();
        let mut b = wire(&mesh, "b");
        let a = Arc::new(mesh.join("a"));
        let a_uid = a.uid();
        let (incoming_tx, _incoming_rx) = mpsc::channel(16);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(16);
        let (unreachable_tx, mut unreachable_rx) = mpsc::channel(1);
        let transport = Transport::start(a, &Config::default(), incoming_tx, outgoing_rx, unreachable_tx);

        // Nobody drains the unreachable reports.
        for target in [0xdead, 0xbeef, 0xf00d] {
            outgoing_tx.send(heartbeat(a_uid, target)).await.unwrap();
        }
        outgoing_tx.send(heartbeat(a_uid, b.uid)).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), b.incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.from, a_uid);

        // Only the first report fit; the rest were dropped.
        assert_eq!(unreachable_rx.try_recv().unwrap(), 0xdead);
        assert!(unreachable_rx.try_recv().is_err());

        transport.stop().await;
        b.transport.stop().await;
    }

    #[tokio::test]
    async fn test_entry_at_request_limit_fits_a_packet() {
        use raft::eraftpb::{Entry, EntryType};

        let config = Config::default();
        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryNormal);
        entry.term = u64::MAX;
        entry.index = u64::MAX;
        entry.data = vec![0xab; config.max_request_bytes].into();

        let mut msg = heartbeat(u64::MAX, u64::MAX);
        msg.set_msg_type(MessageType::MsgAppend);
        msg.term = u64::MAX;
        msg.log_term = u64::MAX;
        msg.index = u64::MAX;
        msg.commit = u64::MAX;
        msg.mut_entries().push(entry);
        assert!(msg.write_to_bytes().unwrap().len() <= config.max_packet_bytes);
    }

    #[tokio::test]
    async fn test_oversized_message_dropped() {
        let mesh = LocalMesh::new();
        let a = wire(&mesh, "a");
        let mut b = wire(&mesh, "b");

        let mut big = heartbeat(a.uid, b.uid);
        big.set_msg_type(MessageType::MsgAppend);
        big.context = vec![7u8; Config::default().max_packet_bytes + 1].into();
        a.outgoing_tx.send(big).await.unwrap();
        a.outgoing_tx.send(heartbeat(a.uid, b.uid)).await.unwrap();

        // Only the heartbeat arrives.
        let got = tokio::time::timeout(Duration::from_secs(2), b.incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.get_msg_type(), MessageType::MsgHeartbeat);

        a.transport.stop().await;
        b.transport.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_the_socket() {
        let mesh = LocalMesh::new();
        let a = wire(&mesh, "a");
        let uid = a.uid;
        assert!(mesh.peers().contains(&uid));
        a.transport.stop().await;
        assert!(!mesh.peers().contains(&uid));
    }

    #[tokio::test]
    async fn test_garbage_datagram_ignored() {
        let mesh = LocalMesh::new();
        let raw = mesh.join("raw");
        let mut b = wire(&mesh, "b");
        let b_addr = MeshAddr {
            name: "b".into(),
            uid: b.uid,
        };

        raw.send_to(&[0xff, 0xff, 0xff], &b_addr).await.unwrap();
        raw.send_to(&heartbeat(raw.uid(), b.uid).write_to_bytes().unwrap(), &b_addr)
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), b.incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.from, raw.uid());
        b.transport.stop().await;
    }
}
