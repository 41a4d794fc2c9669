use std::io;

/// Error codes surfaced to callbacks as a signed 32-bit value.
///
/// Zero means success; everything below zero is a failure. Constructor-style
/// APIs (`open`, `connect`, `bind`) report immediate failures through
/// `anyhow::Result` instead, so these codes only ever show up asynchronously.
pub const OK: i32 = 0;

/// The channel is closed or was never opened.
pub const ERR_CLOSED: i32 = -1;

/// A local, non-retriable I/O failure (bad descriptor, kernel resources).
pub const ERR_IO: i32 = -2;

/// A connect attempt ran out of time.
pub const ERR_TIMEOUT: i32 = -3;

/// The peer refused or reset the connection.
pub const ERR_REFUSED: i32 = -4;

/// The remote endpoint could not be resolved.
pub const ERR_RESOLVE: i32 = -5;

/// The byte stream violated the protocol (HTTP parse error, bad frame).
pub const ERR_PROTOCOL: i32 = -6;

/// The redirect history contains a cycle.
pub const ERR_REDIRECT_LOOP: i32 = -7;

/// The redirect chain exceeded the configured hop limit.
pub const ERR_TOO_MANY_REDIRECTS: i32 = -8;

/// The TLS handshake failed.
pub const ERR_TLS: i32 = -9;

/// The response ended before the message was complete.
pub const ERR_INCOMPLETE: i32 = -10;

/// Maps an I/O error to the closest callback code.
pub fn from_io(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => ERR_REFUSED,
        io::ErrorKind::TimedOut => ERR_TIMEOUT,
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => ERR_CLOSED,
        _ => ERR_IO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(from_io(&refused), ERR_REFUSED);

        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(from_io(&timeout), ERR_TIMEOUT);

        let other = io::Error::from(io::ErrorKind::InvalidData);
        assert_eq!(from_io(&other), ERR_IO);
    }
}
