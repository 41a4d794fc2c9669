use anyhow::anyhow;
use anyhow::Context as _;
use anyhow::Result;
use mio::net::TcpStream;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::danger::ServerCertVerified;
use rustls::client::danger::ServerCertVerifier;
use rustls::ClientConfig;
use rustls::ClientConnection;
use rustls::Connection;
use rustls::DigitallySignedStruct;
use rustls::RootCertStore;
use rustls::ServerConfig;
use rustls::ServerConnection;
use rustls::SignatureScheme;
use rustls_pki_types::CertificateDer;
use rustls_pki_types::PrivateKeyDer;
use rustls_pki_types::ServerName;
use rustls_pki_types::UnixTime;
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::path::Path;
use std::sync::Arc;

/// Client-side TLS material. Cheap to clone; one context can back any
/// number of connections.
#[derive(Clone)]
pub struct TlsClientContext {
    config: Arc<ClientConfig>,
}

impl TlsClientContext {
    /// Verifies peers against the platform trust store.
    pub fn new() -> Result<TlsClientContext> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            // Unusable platform certificates are skipped, not fatal.
            let _ = roots.add(cert);
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsClientContext {
            config: Arc::new(config),
        })
    }

    /// Disables peer verification. For test rigs and private deployments.
    pub fn insecure() -> TlsClientContext {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();
        TlsClientContext {
            config: Arc::new(config),
        }
    }

    pub fn from_config(config: Arc<ClientConfig>) -> TlsClientContext {
        TlsClientContext { config }
    }

    pub(crate) fn config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }
}

/// Server-side TLS material (certificate chain and private key).
#[derive(Clone)]
pub struct TlsServerContext {
    config: Arc<ServerConfig>,
}

impl TlsServerContext {
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<TlsServerContext> {
        let mut cert_reader = BufReader::new(
            File::open(cert_path)
                .with_context(|| format!("failed to open {}", cert_path.display()))?,
        );
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to parse certificate chain")?;

        let mut key_reader = BufReader::new(
            File::open(key_path)
                .with_context(|| format!("failed to open {}", key_path.display()))?,
        );
        let key = rustls_pemfile::private_key(&mut key_reader)?
            .ok_or_else(|| anyhow!("no private key in {}", key_path.display()))?;

        TlsServerContext::from_single_cert(certs, key)
    }

    pub fn from_single_cert(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<TlsServerContext> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("invalid certificate or key")?;
        Ok(TlsServerContext {
            config: Arc::new(config),
        })
    }

    pub fn from_config(config: Arc<ServerConfig>) -> TlsServerContext {
        TlsServerContext { config }
    }

    pub(crate) fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

/// A TCP stream bracketed by a TLS session.
///
/// All operations are non-blocking; `WouldBlock` surfaces exactly like it
/// does on a plain socket, so the controller can treat handshake progress
/// as ordinary read/write readiness.
pub(crate) struct TlsStream {
    sock: TcpStream,
    conn: Connection,
}

impl TlsStream {
    pub fn client(
        sock: TcpStream,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<TlsStream> {
        let conn = ClientConnection::new(config, server_name)
            .context("failed to start TLS client session")?;
        Ok(TlsStream {
            sock,
            conn: Connection::Client(conn),
        })
    }

    pub fn server(sock: TcpStream, config: Arc<ServerConfig>) -> Result<TlsStream> {
        let conn =
            ServerConnection::new(config).context("failed to start TLS server session")?;
        Ok(TlsStream {
            sock,
            conn: Connection::Server(conn),
        })
    }

    /// Advances the handshake as far as the socket allows.
    ///
    /// Returns `Ok(true)` once the session is established, `Ok(false)` when
    /// it wants more readiness.
    pub fn handshake(&mut self) -> io::Result<bool> {
        while self.conn.is_handshaking() {
            match self.conn.complete_io(&mut self.sock) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        self.flush()?;
        Ok(true)
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Reads decrypted bytes. `Ok(0)` means the peer closed.
    pub fn read_plain(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // No plaintext buffered; pull more ciphertext.
                    match self.conn.read_tls(&mut self.sock) {
                        Ok(0) => return Ok(0),
                        Ok(_) => {
                            self.conn
                                .process_new_packets()
                                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Encrypts and queues bytes, pushing as much ciphertext to the kernel
    /// as it will take.
    pub fn write_plain(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        self.flush()?;
        Ok(n)
    }

    /// Drains buffered ciphertext towards the kernel.
    pub fn flush(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    pub fn shutdown_write(&mut self) {
        self.conn.send_close_notify();
        let _ = self.flush();
        let _ = self.sock.shutdown(Shutdown::Write);
    }

    pub fn sock(&self) -> &TcpStream {
        &self.sock
    }

    pub fn sock_mut(&mut self) -> &mut TcpStream {
        &mut self.sock
    }
}

/// Accepts any certificate. Only reachable through
/// `TlsClientContext::insecure`.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
