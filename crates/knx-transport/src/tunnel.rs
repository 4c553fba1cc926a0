use crate::frame::{decode_ldata, encode_ldata_req, Frame};
use crate::{GroupBus, GroupEvent, Inbound, Result, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, trace, warn};

/// Tunnel timing and buffering knobs.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// How long to wait for the gateway to answer a connect request.
    pub response_timeout: Duration,
    /// How long to wait for a TUNNELING_ACK before resending.
    pub ack_timeout: Duration,
    pub send_attempts: u8,
    pub heartbeat_interval: Duration,
    /// Unanswered heartbeats tolerated before the tunnel is closed.
    pub heartbeat_misses: u8,
    pub inbound_capacity: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(1),
            send_attempts: 2,
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_misses: 3,
            inbound_capacity: 1024,
        }
    }
}

struct Outbound {
    seq: u8,
    acks: mpsc::Receiver<(u8, u8)>,
}

struct Shared {
    socket: UdpSocket,
    channel: u8,
    config: TunnelConfig,
    outbound: Mutex<Outbound>,
    closed: AtomicBool,
    closing: Notify,
}

impl Shared {
    /// Mark the tunnel closed, stop the worker and release the gateway's
    /// channel. Only the first call sends the DISCONNECT_REQUEST.
    async fn disconnect(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closing.notify_one();
        let req = Frame::DisconnectRequest {
            channel: self.channel,
        };
        self.socket.send(&req.encode()).await?;
        Ok(())
    }
}

/// KNXnet/IP tunnelling connection carrying group telegrams.
pub struct GroupTunnel {
    shared: Arc<Shared>,
    inbound: Option<Inbound>,
    worker: JoinHandle<()>,
}

impl GroupTunnel {
    /// Open a tunnel to the gateway at `gateway` (usually port 3671).
    pub async fn connect(gateway: impl ToSocketAddrs, config: TunnelConfig) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(gateway).await?;
        socket.send(&Frame::ConnectRequest.encode()).await?;
        let channel = timeout(config.response_timeout, await_connect_response(&socket))
            .await
            .map_err(|_| TransportError::Timeout("connect response"))??;
        info!(
            gateway = %socket.peer_addr()?,
            channel,
            "tunnel connection established"
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (ack_tx, ack_rx) = mpsc::channel(16);
        let shared = Arc::new(Shared {
            socket,
            channel,
            config,
            outbound: Mutex::new(Outbound {
                seq: 0,
                acks: ack_rx,
            }),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        });
        let worker = tokio::spawn(run_worker(shared.clone(), inbound_tx, ack_tx));
        Ok(Self {
            shared,
            inbound: Some(inbound_rx),
            worker,
        })
    }

    pub fn channel(&self) -> u8 {
        self.shared.channel
    }
}

impl Drop for GroupTunnel {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[async_trait]
impl GroupBus for GroupTunnel {
    fn take_inbound(&mut self) -> Option<Inbound> {
        self.inbound.take()
    }

    async fn send(&self, event: &GroupEvent) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let cemi = encode_ldata_req(event)?;
        let mut out = self.shared.outbound.lock().await;
        // Acks left over from resends of earlier requests.
        while out.acks.try_recv().is_ok() {}
        let seq = out.seq;
        let datagram = Frame::TunnelRequest {
            channel: self.shared.channel,
            seq,
            cemi,
        }
        .encode();
        for attempt in 1..=self.shared.config.send_attempts.max(1) {
            self.shared.socket.send(&datagram).await?;
            match timeout(self.shared.config.ack_timeout, await_ack(&mut out.acks, seq)).await {
                Ok(Some(0)) => {
                    out.seq = seq.wrapping_add(1);
                    return Ok(());
                }
                Ok(Some(status)) => {
                    return Err(TransportError::SendFailed(format!(
                        "gateway rejected telegram to {} (status 0x{status:02X})",
                        event.destination
                    )))
                }
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => debug!(attempt, seq, "no tunnelling ack"),
            }
        }
        // The sequence counters are out of step now; the connection is unusable.
        warn!(seq, destination = %event.destination, "telegram not acknowledged, closing tunnel");
        if let Err(e) = self.shared.disconnect().await {
            debug!(error = %e, "failed to send disconnect request");
        }
        Err(TransportError::Timeout("tunnelling ack"))
    }

    async fn close(&self) -> Result<()> {
        self.shared.disconnect().await
    }
}

async fn await_connect_response(socket: &UdpSocket) -> Result<u8> {
    let mut buf = [0u8; 256];
    loop {
        let n = socket.recv(&mut buf).await?;
        if let Ok(Frame::ConnectResponse { channel, status }) = Frame::decode(&buf[..n]) {
            if status != 0 {
                return Err(TransportError::ConnectRejected(status));
            }
            return Ok(channel);
        }
    }
}

async fn await_ack(acks: &mut mpsc::Receiver<(u8, u8)>, seq: u8) -> Option<u8> {
    while let Some((acked, status)) = acks.recv().await {
        if acked == seq {
            return Some(status);
        }
        trace!(acked, expected = seq, "stale tunnelling ack");
    }
    None
}

async fn run_worker(
    shared: Arc<Shared>,
    inbound: mpsc::Sender<GroupEvent>,
    acks: mpsc::Sender<(u8, u8)>,
) {
    let channel = shared.channel;
    let period = shared.config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    let mut awaiting_heartbeat = false;
    let mut missed = 0u8;
    let mut expected_seq = 0u8;
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            res = shared.socket.recv(&mut buf) => {
                let n = match res {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "tunnel socket receive failed");
                        break;
                    }
                };
                match Frame::decode(&buf[..n]) {
                    Ok(Frame::TunnelRequest { channel: ch, seq, cemi }) if ch == channel => {
                        let duplicate = seq == expected_seq.wrapping_sub(1);
                        if !duplicate && seq != expected_seq {
                            // Left unacked so the gateway repeats it.
                            debug!(seq, expected = expected_seq, "out-of-sequence tunnelling request");
                            continue;
                        }
                        let ack = Frame::TunnelAck { channel, seq, status: 0 };
                        if let Err(e) = shared.socket.send(&ack.encode()).await {
                            warn!(error = %e, "failed to acknowledge tunnelling request");
                        }
                        if duplicate {
                            trace!(seq, "duplicate tunnelling request");
                            continue;
                        }
                        expected_seq = expected_seq.wrapping_add(1);
                        deliver(&inbound, &cemi);
                    }
                    Ok(Frame::TunnelAck { channel: ch, seq, status }) if ch == channel => {
                        let _ = acks.try_send((seq, status));
                    }
                    Ok(Frame::ConnStateResponse { status, .. }) => {
                        if status == 0 {
                            awaiting_heartbeat = false;
                            missed = 0;
                        } else {
                            warn!(status, "gateway reports connection state error");
                        }
                    }
                    Ok(Frame::DisconnectRequest { channel: ch }) if ch == channel => {
                        let resp = Frame::DisconnectResponse { channel, status: 0 };
                        let _ = shared.socket.send(&resp.encode()).await;
                        info!(channel, "gateway closed the tunnel");
                        break;
                    }
                    Ok(Frame::DisconnectResponse { .. }) => {
                        info!(channel, "tunnel disconnected");
                        break;
                    }
                    Ok(other) => trace!(?other, "ignoring frame"),
                    Err(e) => debug!(error = %e, "dropping malformed datagram"),
                }
            }
            _ = shared.closing.notified() => {
                debug!(channel, "tunnel closed locally");
                break;
            }
            _ = heartbeat.tick() => {
                if awaiting_heartbeat {
                    missed += 1;
                    if missed >= shared.config.heartbeat_misses {
                        warn!(missed, "gateway stopped answering heartbeats");
                        if let Err(e) = shared.disconnect().await {
                            debug!(error = %e, "failed to send disconnect request");
                        }
                        break;
                    }
                }
                let req = Frame::ConnStateRequest { channel };
                if let Err(e) = shared.socket.send(&req.encode()).await {
                    warn!(error = %e, "failed to send heartbeat");
                }
                awaiting_heartbeat = true;
            }
        }
    }
    shared.closed.store(true, Ordering::Release);
}

fn deliver(inbound: &mpsc::Sender<GroupEvent>, cemi: &[u8]) {
    match decode_ldata(cemi) {
        Ok(Some(mut event)) => {
            event.received_at = Some(OffsetDateTime::now_utc());
            if let Err(e) = inbound.try_send(event) {
                warn!(error = %e, "inbound queue unavailable, dropping telegram");
            }
        }
        Ok(None) => {}
        Err(e) => debug!(error = %e, "dropping malformed cemi frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GroupAddress, GroupCommand};

    async fn fake_gateway() -> (UdpSocket, std::net::SocketAddr) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    async fn accept(gw: &UdpSocket, channel: u8) -> std::net::SocketAddr {
        let mut buf = [0u8; 256];
        let (n, peer) = gw.recv_from(&mut buf).await.unwrap();
        assert_eq!(Frame::decode(&buf[..n]).unwrap(), Frame::ConnectRequest);
        let resp = Frame::ConnectResponse { channel, status: 0 };
        gw.send_to(&resp.encode(), peer).await.unwrap();
        peer
    }

    async fn next_frame(gw: &UdpSocket) -> Frame {
        let mut buf = [0u8; 256];
        let (n, _) = timeout(Duration::from_secs(2), gw.recv_from(&mut buf))
            .await
            .expect("gateway waited too long")
            .unwrap();
        Frame::decode(&buf[..n]).unwrap()
    }

    fn write_indication(data: &[u8]) -> Vec<u8> {
        let mut cemi = vec![0x29, 0x00, 0xBC, 0xE0, 0x11, 0x05, 0x0A, 0x03];
        cemi.extend_from_slice(&[1 + data.len() as u8, 0x00, 0x80]);
        cemi.extend_from_slice(data);
        cemi
    }

    #[tokio::test]
    async fn handshake_send_and_receive() {
        let (gw, addr) = fake_gateway().await;
        let server = tokio::spawn(async move {
            let peer = accept(&gw, 9).await;
            let mut buf = [0u8; 256];

            // Outbound group read must be acked.
            let (n, _) = gw.recv_from(&mut buf).await.unwrap();
            let seq = match Frame::decode(&buf[..n]).unwrap() {
                Frame::TunnelRequest { channel: 9, seq, cemi } => {
                    assert_eq!(&cemi[6..8], &[0x0A, 0x03]);
                    seq
                }
                other => panic!("unexpected frame {other:?}"),
            };
            let ack = Frame::TunnelAck { channel: 9, seq, status: 0 };
            gw.send_to(&ack.encode(), peer).await.unwrap();

            // Push a response indication.
            let cemi = vec![
                0x29, 0x00, 0xBC, 0xE0, 0x11, 0x05, 0x0A, 0x03, 0x03, 0x00, 0x40, 0x0C, 0x33,
            ];
            let req = Frame::TunnelRequest { channel: 9, seq: 0, cemi };
            gw.send_to(&req.encode(), peer).await.unwrap();
            let (n, _) = gw.recv_from(&mut buf).await.unwrap();
            assert_eq!(
                Frame::decode(&buf[..n]).unwrap(),
                Frame::TunnelAck { channel: 9, seq: 0, status: 0 }
            );
            gw
        });

        let mut tunnel = GroupTunnel::connect(addr, TunnelConfig::default())
            .await
            .unwrap();
        assert_eq!(tunnel.channel(), 9);
        let ga = GroupAddress::new(1, 2, 3).unwrap();
        tunnel.send(&GroupEvent::read(ga)).await.unwrap();

        let mut rx = tunnel.take_inbound().unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.command, GroupCommand::Response);
        assert_eq!(ev.destination, ga);
        assert_eq!(ev.data, vec![0x0C, 0x33]);
        assert!(ev.received_at.is_some());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_connect_is_reported() {
        let (gw, addr) = fake_gateway().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (_, peer) = gw.recv_from(&mut buf).await.unwrap();
            let resp = Frame::ConnectResponse { channel: 0, status: 0x24 };
            gw.send_to(&resp.encode(), peer).await.unwrap();
        });
        let res = GroupTunnel::connect(addr, TunnelConfig::default()).await;
        assert!(matches!(res, Err(TransportError::ConnectRejected(0x24))));
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let (gw, addr) = fake_gateway().await;
        let server = tokio::spawn(async move {
            accept(&gw, 1).await;
            gw
        });
        let config = TunnelConfig {
            ack_timeout: Duration::from_millis(20),
            ..TunnelConfig::default()
        };
        let tunnel = GroupTunnel::connect(addr, config).await.unwrap();
        let _gw = server.await.unwrap();
        let ga = GroupAddress::new(0, 0, 1).unwrap();
        assert!(matches!(
            tunnel.send(&GroupEvent::read(ga)).await,
            Err(TransportError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn gateway_disconnect_ends_inbound_stream() {
        let (gw, addr) = fake_gateway().await;
        let server = tokio::spawn(async move {
            let peer = accept(&gw, 3).await;
            let req = Frame::DisconnectRequest { channel: 3 };
            gw.send_to(&req.encode(), peer).await.unwrap();
            gw
        });
        let mut tunnel = GroupTunnel::connect(addr, TunnelConfig::default())
            .await
            .unwrap();
        let mut rx = tunnel.take_inbound().unwrap();
        assert!(rx.recv().await.is_none());
        let _gw = server.await.unwrap();
        let ga = GroupAddress::new(0, 0, 1).unwrap();
        assert!(matches!(
            tunnel.send(&GroupEvent::read(ga)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn late_ack_does_not_confirm_a_later_send() {
        let (gw, addr) = fake_gateway().await;
        let server = tokio::spawn(async move {
            let peer = accept(&gw, 2).await;
            let seq = match next_frame(&gw).await {
                Frame::TunnelRequest { seq, .. } => seq,
                other => panic!("unexpected frame {other:?}"),
            };
            tokio::time::sleep(Duration::from_millis(80)).await;
            let ack = Frame::TunnelAck { channel: 2, seq, status: 0 };
            gw.send_to(&ack.encode(), peer).await.unwrap();
            next_frame(&gw).await
        });
        let config = TunnelConfig {
            ack_timeout: Duration::from_millis(30),
            send_attempts: 1,
            ..TunnelConfig::default()
        };
        let tunnel = GroupTunnel::connect(addr, config).await.unwrap();
        let read = GroupEvent::read(GroupAddress::new(0, 0, 1).unwrap());

        assert!(matches!(
            tunnel.send(&read).await,
            Err(TransportError::Timeout(_))
        ));
        // Let the late ack reach the client before sending again.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            tunnel.send(&read).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(
            server.await.unwrap(),
            Frame::DisconnectRequest { channel: 2 }
        );
    }

    #[tokio::test]
    async fn out_of_sequence_request_is_neither_acked_nor_delivered() {
        let (gw, addr) = fake_gateway().await;
        let server = tokio::spawn(async move {
            let peer = accept(&gw, 4).await;
            let skipped = Frame::TunnelRequest {
                channel: 4,
                seq: 5,
                cemi: write_indication(&[0x0C, 0x33]),
            };
            gw.send_to(&skipped.encode(), peer).await.unwrap();
            let expected = Frame::TunnelRequest {
                channel: 4,
                seq: 0,
                cemi: write_indication(&[0x00, 0x64]),
            };
            gw.send_to(&expected.encode(), peer).await.unwrap();
            let reply = next_frame(&gw).await;
            (gw, reply)
        });
        let mut tunnel = GroupTunnel::connect(addr, TunnelConfig::default())
            .await
            .unwrap();
        let mut rx = tunnel.take_inbound().unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.data, vec![0x00, 0x64]);
        let (_gw, reply) = server.await.unwrap();
        assert_eq!(
            reply,
            Frame::TunnelAck {
                channel: 4,
                seq: 0,
                status: 0
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lost_heartbeats_release_the_channel() {
        let (gw, addr) = fake_gateway().await;
        let server = tokio::spawn(async move {
            accept(&gw, 6).await;
            let mut heartbeats = 0;
            loop {
                match next_frame(&gw).await {
                    Frame::ConnStateRequest { channel: 6 } => heartbeats += 1,
                    other => return (heartbeats, other),
                }
            }
        });
        let config = TunnelConfig {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_misses: 2,
            ..TunnelConfig::default()
        };
        let mut tunnel = GroupTunnel::connect(addr, config).await.unwrap();
        let mut rx = tunnel.take_inbound().unwrap();

        assert!(rx.recv().await.is_none());
        let (heartbeats, last) = server.await.unwrap();
        assert_eq!(heartbeats, 2);
        assert_eq!(last, Frame::DisconnectRequest { channel: 6 });
        let ga = GroupAddress::new(0, 0, 1).unwrap();
        assert!(matches!(
            tunnel.send(&GroupEvent::read(ga)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_sends_disconnect_once_and_ends_stream() {
        let (gw, addr) = fake_gateway().await;
        let server = tokio::spawn(async move {
            accept(&gw, 8).await;
            let first = next_frame(&gw).await;
            (gw, first)
        });
        let mut tunnel = GroupTunnel::connect(addr, TunnelConfig::default())
            .await
            .unwrap();
        let mut rx = tunnel.take_inbound().unwrap();

        tunnel.close().await.unwrap();
        tunnel.close().await.unwrap();
        assert!(rx.recv().await.is_none());
        let (gw, first) = server.await.unwrap();
        assert_eq!(first, Frame::DisconnectRequest { channel: 8 });
        let mut buf = [0u8; 64];
        assert!(timeout(Duration::from_millis(50), gw.recv_from(&mut buf))
            .await
            .is_err());
    }
}
