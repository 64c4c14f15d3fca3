//! Symmetric UDP peer runtime shared by the drone and the ground station.
//!
//! A [`LinkPeer`] owns the socket and a receive task that decodes incoming
//! datagrams and dispatches them to registered callbacks. On top of the
//! fire-and-forget sends it layers a synchronous request/reply facility with
//! a single in-flight slot: a second synchronous command while one is
//! pending gets [`SyncCmdError::Busy`] without touching the wire.

pub mod packet;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use packet::{
    CommandFrame, CommandId, DetectionBox, Packet, PacketError, SubCommand, SysTelemetry,
    MAX_CMD_SIZE,
};

/// Direct-mode data port: drone → GS traffic, GS listens here.
pub const PORT_DATA: u16 = 5610;
/// Direct-mode command port: GS → drone traffic, drone listens here.
pub const PORT_CMD: u16 = 5611;
/// Single shared port in tunnel mode.
pub const PORT_TUNNEL: u16 = 6211;
/// Tunnel-overlay addresses.
pub const TUNNEL_DRONE_IP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(10, 80, 0, 1);
pub const TUNNEL_GS_IP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(10, 80, 0, 2);

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("link peer is shut down")]
    Shutdown,
}

/// Outcome of [`LinkPeer::send_cmd_sync`] other than a matching ACK.
#[derive(Error, Debug)]
pub enum SyncCmdError {
    #[error("another synchronous command is already in flight")]
    Busy,

    #[error("no ACK/NACK within the deadline")]
    Timeout,

    #[error("remote rejected the command")]
    Nack(Bytes),

    #[error("link shut down while waiting for the reply")]
    Shutdown,

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Which end of the link this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Drone,
    GroundStation,
}

/// Endpoint selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    /// Loopback with separate data/command ports.
    #[default]
    Direct,
    /// WFB-ng style tunnel: one shared port on overlay addresses.
    Tunnel,
}

/// Concrete socket addresses for one peer.
#[derive(Debug, Clone, Copy)]
pub struct LinkEndpoints {
    pub listen: SocketAddr,
    pub remote: SocketAddr,
}

impl LinkEndpoints {
    pub fn for_role(role: LinkRole, mode: LinkMode) -> Self {
        match mode {
            LinkMode::Direct => match role {
                LinkRole::Drone => Self {
                    listen: ([0, 0, 0, 0], PORT_CMD).into(),
                    remote: ([127, 0, 0, 1], PORT_DATA).into(),
                },
                LinkRole::GroundStation => Self {
                    listen: ([0, 0, 0, 0], PORT_DATA).into(),
                    remote: ([127, 0, 0, 1], PORT_CMD).into(),
                },
            },
            LinkMode::Tunnel => {
                let peer_ip = match role {
                    LinkRole::Drone => TUNNEL_GS_IP,
                    LinkRole::GroundStation => TUNNEL_DRONE_IP,
                };
                Self {
                    listen: ([0, 0, 0, 0], PORT_TUNNEL).into(),
                    remote: (peer_ip, PORT_TUNNEL).into(),
                }
            }
        }
    }
}

/// Typed receive callbacks, installed once and invoked from the receive
/// task. Handlers must not block for long; they may send through a
/// [`LinkSender`].
#[derive(Default)]
pub struct LinkCallbacks {
    pub on_detection: Option<Box<dyn Fn(&[DetectionBox]) + Send + Sync>>,
    pub on_sys_telemetry: Option<Box<dyn Fn(&SysTelemetry) + Send + Sync>>,
    pub on_displayport: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,
    pub on_cmd: Option<Box<dyn Fn(&CommandFrame) + Send + Sync>>,
    pub on_rc: Option<Box<dyn Fn(&[u16]) + Send + Sync>>,
}

/// Reply slot for the single in-flight synchronous command.
struct PendingSync {
    subcmd: u8,
    reply_tx: oneshot::Sender<SyncReply>,
}

struct SyncReply {
    cmd: CommandId,
    data: Bytes,
}

struct Shared {
    socket: UdpSocket,
    remote: Mutex<SocketAddr>,
    callbacks: Mutex<LinkCallbacks>,
    pending_sync: Mutex<Option<PendingSync>>,
    running: AtomicBool,
    stop: Notify,
}

/// Cheap cloneable sending half, safe to use from receive callbacks.
#[derive(Clone)]
pub struct LinkSender {
    shared: Arc<Shared>,
}

impl LinkSender {
    fn send_packet(&self, packet: &Packet) -> Result<(), LinkError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(LinkError::Shutdown);
        }
        let wire = packet.encode()?;
        let remote = *self.shared.remote.lock().unwrap();
        // UDP writes are atomic at the OS level; try_send_to never blocks.
        match self.shared.socket.try_send_to(&wire, remote) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!("send buffer full, dropping {:?} packet", packet.packet_type());
                Ok(())
            }
            Err(e) => Err(LinkError::Io(e)),
        }
    }

    pub fn send_ack(&self) -> Result<(), LinkError> {
        self.send_packet(&Packet::Ack)
    }

    pub fn send_displayport(&self, data: &[u8]) -> Result<(), LinkError> {
        self.send_packet(&Packet::Displayport(Bytes::copy_from_slice(data)))
    }

    pub fn send_detection(&self, boxes: &[DetectionBox]) -> Result<(), LinkError> {
        self.send_packet(&Packet::Detection(boxes.to_vec()))
    }

    pub fn send_sys_telemetry(&self, telemetry: SysTelemetry) -> Result<(), LinkError> {
        self.send_packet(&Packet::SysTelemetry(telemetry))
    }

    pub fn send_rc(&self, channels: &[u16]) -> Result<(), LinkError> {
        self.send_packet(&Packet::Rc(channels.to_vec()))
    }

    pub fn send_cmd(
        &self,
        cmd: CommandId,
        subcmd: SubCommand,
        data: &[u8],
    ) -> Result<(), LinkError> {
        self.send_cmd_raw(cmd, subcmd as u8, data)
    }

    pub fn send_cmd_raw(&self, cmd: CommandId, subcmd: u8, data: &[u8]) -> Result<(), LinkError> {
        self.send_packet(&Packet::Cmd(CommandFrame {
            cmd,
            subcmd,
            data: Bytes::copy_from_slice(data),
        }))
    }
}

/// The link peer: owns the socket, the receive task and the sync slot.
pub struct LinkPeer {
    shared: Arc<Shared>,
    recv_task: Option<JoinHandle<()>>,
}

impl LinkPeer {
    /// Bind with the default endpoints for the given role and mode and
    /// start the receive task.
    pub async fn bind(role: LinkRole, mode: LinkMode) -> Result<Self, LinkError> {
        Self::bind_with(LinkEndpoints::for_role(role, mode)).await
    }

    /// Bind with explicit endpoints. Used by tests and by deployments with
    /// non-default ports.
    pub async fn bind_with(endpoints: LinkEndpoints) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(endpoints.listen).await?;
        info!(
            listen = %socket.local_addr()?,
            remote = %endpoints.remote,
            "link peer bound"
        );

        let shared = Arc::new(Shared {
            socket,
            remote: Mutex::new(endpoints.remote),
            callbacks: Mutex::new(LinkCallbacks::default()),
            pending_sync: Mutex::new(None),
            running: AtomicBool::new(true),
            stop: Notify::new(),
        });

        let recv_task = tokio::spawn(receive_loop(Arc::clone(&shared)));

        Ok(Self {
            shared,
            recv_task: Some(recv_task),
        })
    }

    /// Local address the peer actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Retarget outgoing traffic, e.g. after the GS address was learned.
    pub fn set_remote(&self, remote: SocketAddr) {
        *self.shared.remote.lock().unwrap() = remote;
        info!(%remote, "link remote endpoint updated");
    }

    pub fn sender(&self) -> LinkSender {
        LinkSender {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn register_detection_cb(&self, cb: impl Fn(&[DetectionBox]) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().on_detection = Some(Box::new(cb));
    }

    pub fn register_sys_telemetry_cb(&self, cb: impl Fn(&SysTelemetry) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().on_sys_telemetry = Some(Box::new(cb));
    }

    pub fn register_displayport_cb(&self, cb: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().on_displayport = Some(Box::new(cb));
    }

    pub fn register_cmd_cb(&self, cb: impl Fn(&CommandFrame) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().on_cmd = Some(Box::new(cb));
    }

    pub fn register_rc_cb(&self, cb: impl Fn(&[u16]) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().on_rc = Some(Box::new(cb));
    }

    /// Send a command and wait for the matching ACK/NACK.
    ///
    /// At most one synchronous command may be in flight; a concurrent call
    /// returns [`SyncCmdError::Busy`] without sending. The reply payload is
    /// truncated to `max_resp` bytes. A NACK carries the remote's current
    /// value; a timeout means the caller decides about retrying.
    pub async fn send_cmd_sync(
        &self,
        cmd: CommandId,
        subcmd: SubCommand,
        data: &[u8],
        max_resp: usize,
        timeout: Duration,
    ) -> Result<Bytes, SyncCmdError> {
        if data.len() > MAX_CMD_SIZE {
            return Err(SyncCmdError::Link(LinkError::Packet(
                PacketError::Oversize {
                    kind: "command",
                    got: data.len(),
                    cap: MAX_CMD_SIZE,
                },
            )));
        }

        let reply_rx = {
            let mut slot = self.shared.pending_sync.lock().unwrap();
            if slot.is_some() {
                return Err(SyncCmdError::Busy);
            }
            let (tx, rx) = oneshot::channel();
            *slot = Some(PendingSync {
                subcmd: subcmd as u8,
                reply_tx: tx,
            });
            rx
        };

        if let Err(e) = self.sender().send_cmd(cmd, subcmd, data) {
            // Roll the slot back so the next caller is not stuck on Busy.
            self.shared.pending_sync.lock().unwrap().take();
            return Err(SyncCmdError::Link(e));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                let data = if reply.data.len() > max_resp {
                    reply.data.slice(..max_resp)
                } else {
                    reply.data
                };
                match reply.cmd {
                    CommandId::Ack => Ok(data),
                    _ => Err(SyncCmdError::Nack(data)),
                }
            }
            // Sender dropped without a reply: shutdown path.
            Ok(Err(_)) => Err(SyncCmdError::Shutdown),
            Err(_) => {
                self.shared.pending_sync.lock().unwrap().take();
                Err(SyncCmdError::Timeout)
            }
        }
    }

    /// Stop the receive task, release a pending synchronous waiter with a
    /// synthetic NACK, and wait for the task to exit.
    pub async fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(pending) = self.shared.pending_sync.lock().unwrap().take() {
            let _ = pending.reply_tx.send(SyncReply {
                cmd: CommandId::Nack,
                data: Bytes::new(),
            });
        }

        // notify_one stores a permit, so the receive task sees the stop
        // request even if it is mid-dispatch rather than parked in select.
        self.shared.stop.notify_one();
        if let Some(task) = self.recv_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "link receive task join failed");
            }
        }
        info!("link peer shut down");
    }
}

impl Drop for LinkPeer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.stop.notify_one();
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

async fn receive_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; 4096];
    debug!("link receive task started");

    while shared.running.load(Ordering::Acquire) {
        let received = tokio::select! {
            _ = shared.stop.notified() => break,
            r = shared.socket.recv_from(&mut buf) => r,
        };

        let (len, _from) = match received {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "recv_from failed");
                continue;
            }
        };

        match Packet::decode(&buf[..len]) {
            Ok(packet) => dispatch(&shared, packet),
            Err(e) => warn!(error = %e, len, "dropping malformed datagram"),
        }
    }

    debug!("link receive task stopped");
}

fn dispatch(shared: &Arc<Shared>, packet: Packet) {
    match packet {
        Packet::Ack => debug!("received informational ACK"),
        Packet::Detection(boxes) => {
            let callbacks = shared.callbacks.lock().unwrap();
            if let Some(cb) = &callbacks.on_detection {
                cb(&boxes);
            } else {
                debug!(count = boxes.len(), "detection packet with no callback");
            }
        }
        Packet::SysTelemetry(telemetry) => {
            let callbacks = shared.callbacks.lock().unwrap();
            if let Some(cb) = &callbacks.on_sys_telemetry {
                cb(&telemetry);
            }
        }
        Packet::Displayport(data) => {
            let callbacks = shared.callbacks.lock().unwrap();
            if let Some(cb) = &callbacks.on_displayport {
                cb(&data);
            }
        }
        Packet::Rc(channels) => {
            let callbacks = shared.callbacks.lock().unwrap();
            if let Some(cb) = &callbacks.on_rc {
                cb(&channels);
            }
        }
        Packet::Cmd(frame) => {
            // A reply matching the pending synchronous slot resolves the
            // waiter and is suppressed from the command callback.
            if frame.cmd.is_reply() {
                let mut slot = shared.pending_sync.lock().unwrap();
                let matches = slot
                    .as_ref()
                    .map(|p| p.subcmd == frame.subcmd)
                    .unwrap_or(false);
                if matches {
                    let pending = slot.take().unwrap();
                    let _ = pending.reply_tx.send(SyncReply {
                        cmd: frame.cmd,
                        data: frame.data,
                    });
                    return;
                }
            }

            let callbacks = shared.callbacks.lock().unwrap();
            if let Some(cb) = &callbacks.on_cmd {
                cb(&frame);
            } else {
                debug!(subcmd = frame.subcmd, "command packet with no callback");
            }
        }
    }
}
