use crate::tls::TlsStream;
use mio::net::TcpStream;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::SocketAddr;

/// A connected stream socket, plain or TLS-bracketed.
///
/// The TLS variant substitutes encrypted equivalents for every operation;
/// callers only ever see plaintext and ordinary would-block semantics.
pub(crate) enum NetSocket {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl NetSocket {
    /// Reads available bytes. `Ok(0)` means the peer closed.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetSocket::Plain(sock) => sock.read(buf),
            NetSocket::Tls(tls) => tls.read_plain(buf),
        }
    }

    /// Writes as many bytes as the socket will take without blocking.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetSocket::Plain(sock) => sock.write(buf),
            NetSocket::Tls(tls) => tls.write_plain(buf),
        }
    }

    /// Pushes any buffered ciphertext towards the kernel.
    pub fn flush_out(&mut self) -> io::Result<()> {
        match self {
            NetSocket::Plain(_) => Ok(()),
            NetSocket::Tls(tls) => tls.flush(),
        }
    }

    /// Whether the socket has bytes of its own still to write.
    pub fn wants_write(&self) -> bool {
        match self {
            NetSocket::Plain(_) => false,
            NetSocket::Tls(tls) => tls.wants_write(),
        }
    }

    /// Advances a TLS handshake; a plain socket is always established.
    pub fn handshake(&mut self) -> io::Result<bool> {
        match self {
            NetSocket::Plain(_) => Ok(true),
            NetSocket::Tls(tls) => tls.handshake(),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            NetSocket::Plain(_) => false,
            NetSocket::Tls(tls) => tls.is_handshaking(),
        }
    }

    pub fn shutdown_write(&mut self) {
        match self {
            NetSocket::Plain(sock) => {
                let _ = sock.shutdown(Shutdown::Write);
            }
            NetSocket::Tls(tls) => tls.shutdown_write(),
        }
    }

    /// The underlying handle to register with a selector.
    pub fn source(&mut self) -> &mut TcpStream {
        match self {
            NetSocket::Plain(sock) => sock,
            NetSocket::Tls(tls) => tls.sock_mut(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            NetSocket::Plain(sock) => sock.local_addr(),
            NetSocket::Tls(tls) => tls.sock().local_addr(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            NetSocket::Plain(sock) => sock.peer_addr(),
            NetSocket::Tls(tls) => tls.sock().peer_addr(),
        }
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            NetSocket::Plain(sock) => sock.take_error(),
            NetSocket::Tls(tls) => tls.sock().take_error(),
        }
    }
}

/// Options recorded before a socket exists and replayed once it does.
///
/// Connect and accept paths create sockets inside the controller, so user
/// code sets options up front and the controller applies them post-create.
#[derive(Clone, Copy, Default)]
pub struct SocketOption {
    nodelay: Option<bool>,
    ttl: Option<u32>,
}

impl SocketOption {
    pub fn new() -> SocketOption {
        SocketOption::default()
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> &mut Self {
        self.nodelay = Some(nodelay);
        self
    }

    pub fn set_ttl(&mut self, ttl: u32) -> &mut Self {
        self.ttl = Some(ttl);
        self
    }

    pub(crate) fn apply(&self, sock: &TcpStream) {
        if let Some(nodelay) = self.nodelay {
            let _ = sock.set_nodelay(nodelay);
        }
        if let Some(ttl) = self.ttl {
            let _ = sock.set_ttl(ttl);
        }
    }
}
