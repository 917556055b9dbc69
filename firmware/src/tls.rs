//! mbedTLS PSK client for the cloud session
//!
//! `connect` opens the TCP socket with the bridge's own connect helper, so the
//! session really is `Connected` before any TLS work starts. `handshake` then
//! runs an mbedTLS client over that socket with the PSK cipher suite and no
//! certificate checks.

use std::ffi::{c_int, c_uchar, c_void, CString};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use esp_idf_svc::sys;
use log::{debug, warn};
use modbus_cloud_bridge::clock::SystemClock;
use modbus_cloud_bridge::error::TransportError;
use modbus_cloud_bridge::psk::TlsPskParams;
use modbus_cloud_bridge::transport::{self, CloudConnector, CloudStream};

/// IANA id of TLS_PSK_WITH_AES_128_CBC_SHA256, zero terminated for mbedTLS
static CIPHERSUITES: [c_int; 2] = [0x00AE, 0];

// mbedTLS return codes
const SSL_WANT_READ: c_int = -0x6900;
const SSL_WANT_WRITE: c_int = -0x6880;
const SSL_TIMEOUT: c_int = -0x6800;
const SSL_PEER_CLOSE_NOTIFY: c_int = -0x7880;
const NET_RECV_FAILED: c_int = -0x004C;
const NET_SEND_FAILED: c_int = -0x004E;

const SSL_IS_CLIENT: c_int = 0;
const SSL_TRANSPORT_STREAM: c_int = 0;
const SSL_PRESET_DEFAULT: c_int = 0;
const SSL_VERIFY_NONE: c_int = 0;

fn would_block(ret: c_int) -> bool {
    matches!(ret, SSL_WANT_READ | SSL_WANT_WRITE | SSL_TIMEOUT)
}

fn tls_error(call: &str, ret: c_int) -> io::Error {
    io::Error::other(format!("{} failed: -0x{:04X}", call, -ret))
}

/// Map a TLS "try again" onto `WouldBlock` so the shared retry helpers apply.
fn check(call: &str, ret: c_int) -> io::Result<usize> {
    match ret {
        n if n >= 0 => Ok(n as usize),
        n if would_block(n) => Err(io::ErrorKind::WouldBlock.into()),
        n => Err(tls_error(call, n)),
    }
}

// ---------------------------------------------------------------------------
// Socket callbacks
// ---------------------------------------------------------------------------

unsafe extern "C" fn bio_send(ctx: *mut c_void, buf: *const c_uchar, len: usize) -> c_int {
    let sock = &*(ctx as *const TcpStream);
    let data = std::slice::from_raw_parts(buf, len);
    match (&*sock).write(data) {
        Ok(n) => n as c_int,
        Err(e) if transport::is_idle(&e) => SSL_WANT_WRITE,
        Err(_) => NET_SEND_FAILED,
    }
}

unsafe extern "C" fn bio_recv(ctx: *mut c_void, buf: *mut c_uchar, len: usize) -> c_int {
    let sock = &*(ctx as *const TcpStream);
    let data = std::slice::from_raw_parts_mut(buf, len);
    match (&*sock).read(data) {
        Ok(n) => n as c_int,
        Err(e) if transport::is_idle(&e) => SSL_WANT_READ,
        Err(_) => NET_RECV_FAILED,
    }
}

unsafe extern "C" fn fill_random(_ctx: *mut c_void, buf: *mut c_uchar, len: usize) -> c_int {
    sys::esp_fill_random(buf as *mut c_void, len);
    0
}

// ---------------------------------------------------------------------------
// TLS state
// ---------------------------------------------------------------------------

/// mbedTLS context, its config and the socket underneath.
///
/// Always boxed: mbedTLS keeps pointers to `conf` and `sock`.
struct TlsSession {
    ssl: sys::mbedtls_ssl_context,
    conf: sys::mbedtls_ssl_config,
    sock: TcpStream,
    established: bool,
}

// Only the session worker and the sender (under the stream mutex) touch it
unsafe impl Send for TlsSession {}

impl TlsSession {
    fn new(sock: TcpStream, host: &str, params: &TlsPskParams) -> Result<Box<Self>, TransportError> {
        let handshake_err = |call: &str, ret: c_int| TransportError::Handshake(tls_error(call, ret).to_string());
        let identity = params.identity.as_bytes();
        let key = params.key.as_bytes();
        let hostname =
            CString::new(host).map_err(|_| TransportError::Handshake("host name contains NUL".into()))?;

        let mut session = Box::new(Self {
            ssl: unsafe { std::mem::zeroed() },
            conf: unsafe { std::mem::zeroed() },
            sock,
            established: false,
        });

        unsafe {
            sys::mbedtls_ssl_init(&mut session.ssl);
            sys::mbedtls_ssl_config_init(&mut session.conf);

            let ret = sys::mbedtls_ssl_config_defaults(
                &mut session.conf,
                SSL_IS_CLIENT,
                SSL_TRANSPORT_STREAM,
                SSL_PRESET_DEFAULT,
            );
            if ret != 0 {
                return Err(handshake_err("mbedtls_ssl_config_defaults", ret));
            }

            if !params.verify_peer {
                sys::mbedtls_ssl_conf_authmode(&mut session.conf, SSL_VERIFY_NONE);
            }
            sys::mbedtls_ssl_conf_rng(&mut session.conf, Some(fill_random), std::ptr::null_mut());
            sys::mbedtls_ssl_conf_ciphersuites(&mut session.conf, CIPHERSUITES.as_ptr());

            let ret = sys::mbedtls_ssl_conf_psk(
                &mut session.conf,
                key.as_ptr(),
                key.len(),
                identity.as_ptr(),
                identity.len(),
            );
            if ret != 0 {
                return Err(handshake_err("mbedtls_ssl_conf_psk", ret));
            }

            let ret = sys::mbedtls_ssl_setup(&mut session.ssl, &session.conf);
            if ret != 0 {
                return Err(handshake_err("mbedtls_ssl_setup", ret));
            }

            let ret = sys::mbedtls_ssl_set_hostname(&mut session.ssl, hostname.as_ptr());
            if ret != 0 {
                return Err(handshake_err("mbedtls_ssl_set_hostname", ret));
            }

            let sock = &session.sock as *const TcpStream as *mut c_void;
            sys::mbedtls_ssl_set_bio(&mut session.ssl, sock, Some(bio_send), Some(bio_recv), None);
        }

        Ok(session)
    }

    fn handshake(&mut self, timeout: Duration) -> Result<(), TransportError> {
        transport::retry_within(&SystemClock, timeout, || {
            check("mbedtls_ssl_handshake", unsafe { sys::mbedtls_ssl_handshake(&mut self.ssl) })
        })
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

        self.established = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let ret = unsafe { sys::mbedtls_ssl_read(&mut self.ssl, buf.as_mut_ptr(), buf.len()) };
        if ret == SSL_PEER_CLOSE_NOTIFY {
            return Ok(0);
        }
        check("mbedtls_ssl_read", ret)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        check("mbedtls_ssl_write", unsafe { sys::mbedtls_ssl_write(&mut self.ssl, buf.as_ptr(), buf.len()) })
    }
}

impl Drop for TlsSession {
    fn drop(&mut self) {
        unsafe {
            if self.established {
                sys::mbedtls_ssl_close_notify(&mut self.ssl);
            }
            sys::mbedtls_ssl_free(&mut self.ssl);
            sys::mbedtls_ssl_config_free(&mut self.conf);
        }
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// [`CloudConnector`] backed by a std TCP socket and mbedTLS.
pub struct PskTlsConnector {
    read_timeout: Duration,
}

impl PskTlsConnector {
    /// `read_timeout` bounds each socket read, during the handshake and once
    /// the session is up.
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl CloudConnector for PskTlsConnector {
    type Tcp = TcpStream;
    type Stream = PskTlsStream;

    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
        let sock = transport::connect_tcp(host, port, timeout, self.read_timeout)?;
        debug!("TCP connected to {}", sock.peer_addr()?);
        Ok(sock)
    }

    fn handshake(&mut self, tcp: TcpStream, host: &str, params: &TlsPskParams) -> Result<PskTlsStream, TransportError> {
        let timeout = Duration::from_millis(params.timeout_ms as u64);
        let mut session = TlsSession::new(tcp, host, params)?;
        session.handshake(timeout)?;

        Ok(PskTlsStream { session: Some(session), write_timeout: timeout })
    }
}

/// Established TLS session.
pub struct PskTlsStream {
    session: Option<Box<TlsSession>>,
    /// Bound on one `write_all`, so a peer that stops reading fails the
    /// sender instead of blocking it.
    write_timeout: Duration,
}

impl PskTlsStream {
    fn session(&mut self) -> io::Result<&mut TlsSession> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "TLS session closed"))
    }
}

impl CloudStream for PskTlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.session()?.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let timeout = self.write_timeout;
        let session = self.session()?;
        transport::write_all_within(&SystemClock, buf, timeout, |rest| session.write(rest)).map_err(|e| {
            warn!("TLS write failed: {}", e);
            e
        })
    }

    fn shutdown(&mut self) {
        // Dropping the session sends close_notify and closes the socket
        self.session = None;
    }
}
