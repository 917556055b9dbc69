//! Network seams of the cloud session.
//!
//! The session state machine only knows how to ask for a TCP connection, turn
//! it into a secured stream, and read/write that stream. Platform code (mbedTLS
//! on the device, mocks in tests) provides the implementations; the helpers
//! here are what those implementations share.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, trace};

use crate::clock::Clock;
use crate::error::TransportError;
use crate::psk::TlsPskParams;

/// An established, secured byte stream to the cloud.
pub trait CloudStream: Send {
    /// Reads whatever is available. `Ok(0)` means the peer closed the
    /// connection; `WouldBlock`/`TimedOut` mean nothing arrived in time.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Releases the TLS context and closes the socket.
    fn shutdown(&mut self);
}

/// Opens TCP connections and runs the PSK handshake over them.
pub trait CloudConnector: Send {
    type Tcp: Send;
    type Stream: CloudStream + 'static;

    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<Self::Tcp, TransportError>;

    fn handshake(
        &mut self,
        tcp: Self::Tcp,
        host: &str,
        params: &TlsPskParams,
    ) -> Result<Self::Stream, TransportError>;
}

/// Resolves `host:port`, preferring IPv4 addresses.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
    let unresolved = || TransportError::Resolve { host: host.to_string(), port };

    let mut addrs: Vec<SocketAddr> = (host, port).to_socket_addrs().map_err(|_| unresolved())?.collect();
    addrs.sort_by_key(|a| !a.is_ipv4());
    if addrs.is_empty() {
        return Err(unresolved());
    }
    Ok(addrs)
}

/// Connects a blocking TCP socket with bounded connect and read times.
pub fn connect_tcp(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let mut last_err = None;

    for addr in resolve(host, port)? {
        debug!("Connecting to {} ({}:{})", addr, host, port);
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(read_timeout))?;
                stream.set_write_timeout(Some(connect_timeout))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                trace!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(TransportError::Connect(
        last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address")),
    ))
}

/// Whether a read error only means "no data yet".
pub fn is_idle(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Repeats `attempt` while it reports `WouldBlock`, failing with `TimedOut`
/// once `timeout` has passed.
pub fn retry_within<T, F>(clock: &dyn Clock, timeout: Duration, mut attempt: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let deadline = clock.now() + timeout;
    loop {
        match attempt() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if clock.now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no progress within {} ms", timeout.as_millis()),
                    ));
                }
            }
            other => return other,
        }
    }
}

/// Writes all of `buf` through `write_some`, which may accept part of it or
/// report `WouldBlock`. The whole write must finish within `timeout`.
pub fn write_all_within<F>(clock: &dyn Clock, buf: &[u8], timeout: Duration, mut write_some: F) -> io::Result<()>
where
    F: FnMut(&[u8]) -> io::Result<usize>,
{
    let deadline = clock.now() + timeout;
    let mut written = 0;

    while written < buf.len() {
        match write_some(&buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        if written < buf.len() && clock.now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write stalled after {} of {} bytes", written, buf.len()),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn test_resolve_localhost() {
        let addrs = resolve("127.0.0.1", 4348).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:4348".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_connect_tcp_and_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut stream = connect_tcp("127.0.0.1", port, Duration::from_secs(1), Duration::from_millis(20)).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        let mut buf = [0u8; 8];
        let err = Read::read(&mut stream, &mut buf).unwrap_err();
        assert!(is_idle(&err));
    }

    #[test]
    fn test_connect_tcp_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_tcp("127.0.0.1", port, Duration::from_millis(200), Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    fn would_block() -> io::Error {
        io::ErrorKind::WouldBlock.into()
    }

    #[test]
    fn test_write_all_within_joins_partial_writes() {
        let clock = ManualClock::new();
        let mut sent = Vec::new();
        let mut stalls = 2;

        write_all_within(&clock, &[1, 2, 3, 4, 5], Duration::from_secs(1), |rest| {
            if stalls > 0 {
                stalls -= 1;
                return Err(would_block());
            }
            let n = rest.len().min(2);
            sent.extend_from_slice(&rest[..n]);
            Ok(n)
        })
        .unwrap();

        assert_eq!(sent, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_write_all_within_gives_up_on_stalled_peer() {
        let clock = ManualClock::new();
        let mut attempts = 0;

        let err = write_all_within(&clock, &[0xA1, 0x1A], Duration::from_secs(10), |_| {
            attempts += 1;
            clock.advance(Duration::from_secs(1));
            Err(would_block())
        })
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(attempts, 10);
    }

    #[test]
    fn test_write_all_within_passes_hard_errors() {
        let clock = ManualClock::new();
        let err = write_all_within(&clock, &[0x00], Duration::from_secs(1), |_| {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "reset"))
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let err = write_all_within(&clock, &[0x00], Duration::from_secs(1), |_| Ok(0)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_retry_within_deadline() {
        let clock = ManualClock::new();
        let mut left = 3;
        let done = retry_within(&clock, Duration::from_secs(5), || {
            clock.advance(Duration::from_secs(1));
            if left == 0 {
                return Ok("ready");
            }
            left -= 1;
            Err(would_block())
        });
        assert_eq!(done.unwrap(), "ready");

        let err = retry_within(&clock, Duration::from_secs(5), || -> io::Result<()> {
            clock.advance(Duration::from_secs(1));
            Err(would_block())
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
