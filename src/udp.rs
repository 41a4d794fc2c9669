use crate::error;
use crate::event_loop::Context;
use crate::socket_controller::ChannelId;
use crate::socket_controller::SocketController;
use anyhow::anyhow;
use anyhow::Result;
use mio::net::UdpSocket;
use std::io;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;

pub type UdpReceiveHandler = Box<dyn FnMut(&Context, &UdpReceiver)>;

/// A bound datagram socket delivering receive-readiness callbacks.
///
/// The handler fires once per readiness; the user drains with
/// `receive_from` until it returns `(0, None)`.
#[derive(Clone)]
pub struct UdpReceiver {
    ctrl: SocketController,
    id: ChannelId,
    local: SocketAddr,
}

impl UdpReceiver {
    pub fn open<F>(ctx: &Context, local: SocketAddr, receive: F) -> Result<UdpReceiver>
    where
        F: FnMut(&Context, &UdpReceiver) + 'static,
    {
        let ctrl = ctx
            .sockets()
            .ok_or_else(|| anyhow!("this thread has no socket controller"))?
            .clone();
        let (id, local) = ctrl.open_udp(local, Box::new(receive))?;
        Ok(UdpReceiver { ctrl, id, local })
    }

    pub(crate) fn from_raw(
        ctrl: SocketController,
        id: ChannelId,
        local: SocketAddr,
    ) -> UdpReceiver {
        UdpReceiver { ctrl, id, local }
    }

    /// Receives one datagram. `(0, None)` means nothing is pending right
    /// now; a negative count is an error.
    pub fn receive_from(&self, buf: &mut [u8]) -> (i32, Option<SocketAddr>) {
        self.ctrl.udp_receive_from(self.id, buf)
    }

    /// Drains every pending datagram, concatenated, returning the sender
    /// of the last one.
    pub fn receive_all(&self, reserve: usize) -> (Vec<u8>, Option<SocketAddr>) {
        let mut out = Vec::with_capacity(reserve);
        let mut sender = None;
        let mut buf = [0_u8; 65_536];
        loop {
            let (n, from) = self.receive_from(&mut buf);
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
            sender = from;
        }
        (out, sender)
    }

    pub fn close(&self) {
        self.ctrl.close_udp(self.id);
    }

    pub fn is_closed(&self) -> bool {
        !self.ctrl.udp_open(self.id)
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.ctrl.udp_local(self.id).unwrap_or(self.local)
    }
}

/// An unregistered datagram sender. Sends are direct and non-blocking;
/// no thread affinity, no readiness callbacks.
pub struct UdpSender {
    socket: Option<UdpSocket>,
    receiver: SocketAddr,
}

impl UdpSender {
    /// Creates a socket aimed at `receiver`.
    pub fn create(receiver: SocketAddr) -> Result<UdpSender> {
        let bind_addr: SocketAddr = if receiver.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(receiver)?;
        Ok(UdpSender {
            socket: Some(socket),
            receiver,
        })
    }

    /// Sends one datagram. Returns bytes sent, `0` when the kernel would
    /// block, negative on error.
    pub fn send(&self, data: &[u8]) -> i32 {
        let Some(socket) = &self.socket else {
            return error::ERR_CLOSED;
        };
        match socket.send(data) {
            Ok(n) => n as i32,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
            Err(err) => error::from_io(&err),
        }
    }

    pub fn close(&mut self) {
        self.socket = None;
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    pub fn receiver_endpoint(&self) -> SocketAddr {
        self.receiver
    }
}
