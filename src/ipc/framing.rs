//! Length-prefixed message framing for hazkey-server over Unix sockets.
//!
//! # Wire Format
//!
//! ```text
//! +----------------------+---------------------------+
//! | length: u32 (BE)     | body: `length` bytes      |
//! +----------------------+---------------------------+
//! ```
//!
//! The body is one protobuf-encoded envelope. There are no request IDs: every
//! request frame is answered by exactly one response frame on the same
//! connection, in order.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::time::Duration;

use prost::Message;

use crate::ipc::client::IpcError;
use crate::ipc::io::{read_exact_bounded, write_all_bounded};

/// Size of the big-endian length prefix.
pub const HEADER_LEN: usize = 4;

/// Maximum accepted inbound body size (2 MiB).
pub const MAX_FRAME_SIZE: u32 = 2 * 1024 * 1024;

/// Prefix `body` with its big-endian length.
///
/// # Errors
///
/// Returns `IpcError::FrameTooLarge` if the body length does not fit in
/// the 32-bit prefix.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, IpcError> {
    let len = u32::try_from(body.len()).map_err(|_| IpcError::FrameTooLarge {
        len: body.len() as u64,
        max: u64::from(u32::MAX),
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Encode `message` and frame it.
pub fn encode<M: Message>(message: &M) -> Result<Vec<u8>, IpcError> {
    encode_frame(&message.encode_to_vec())
}

/// Decode a frame body.
pub fn decode_body<M: Message + Default>(body: &[u8]) -> Result<M, IpcError> {
    M::decode(body).map_err(IpcError::Decode)
}

/// Write one frame carrying `body`.
pub fn write_frame<S>(stream: &mut S, body: &[u8], timeout: Duration) -> Result<(), IpcError>
where
    S: Write + AsFd,
{
    let frame = encode_frame(body)?;
    write_all_bounded(stream, &frame, timeout)
}

/// Read one frame and return its body.
///
/// # Protocol
///
/// 1. Read exactly 4 bytes and interpret them as a big-endian `u32`
/// 2. Reject lengths above `max_size` without reading any further
/// 3. Read exactly that many bytes for the body
///
/// # Errors
///
/// Returns an error if:
/// - The peer closes before a full frame arrives (`PeerClosed`)
/// - Readiness does not arrive within `timeout` (`Timeout`)
/// - The declared length exceeds `max_size` (`FrameTooLarge`)
pub fn read_frame<S>(
    stream: &mut S,
    max_size: u32,
    timeout: Duration,
) -> Result<Vec<u8>, IpcError>
where
    S: Read + AsFd,
{
    let mut header = [0u8; HEADER_LEN];
    read_exact_bounded(stream, &mut header, timeout)?;

    let len = u32::from_be_bytes(header);
    if len > max_size {
        return Err(IpcError::FrameTooLarge {
            len: u64::from(len),
            max: u64::from(max_size),
        });
    }

    let mut body = vec![0u8; len as usize];
    read_exact_bounded(stream, &mut body, timeout)?;
    Ok(body)
}

/// Read one frame and decode its body.
pub fn decode<M, S>(stream: &mut S, max_size: u32, timeout: Duration) -> Result<M, IpcError>
where
    M: Message + Default,
    S: Read + AsFd,
{
    let body = read_frame(stream, max_size, timeout)?;
    decode_body(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CurrentConfig, Profile, RequestEnvelope};
    use pretty_assertions::assert_eq;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a connected pair of Unix sockets; the first end is non-blocking.
    fn socket_pair() -> (UnixStream, UnixStream) {
        let (client, server) = UnixStream::pair().expect("Failed to create socket pair");
        client.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn test_encode_frame_prefix() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(frame, vec![0, 0, 0, 3, b'a', b'b', b'c']);

        let empty = encode_frame(b"").unwrap();
        assert_eq!(empty, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_request_roundtrip_over_socket() {
        let (mut client, mut server) = socket_pair();

        let config = CurrentConfig {
            profiles: vec![Profile {
                profile_id: "p-1".into(),
                profile_name: "Work".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let requests = vec![
            RequestEnvelope::get_config(),
            RequestEnvelope::set_config(&config),
            RequestEnvelope::clear_all_history("p-1"),
            RequestEnvelope::reload_zenzai_model(),
        ];

        for request in &requests {
            server.write_all(&encode(request).unwrap()).unwrap();
        }
        for request in &requests {
            let decoded: RequestEnvelope =
                decode(&mut client, MAX_FRAME_SIZE, TEST_TIMEOUT).unwrap();
            assert_eq!(&decoded, request);
        }
    }

    #[test]
    fn test_write_frame_is_readable_by_peer() {
        let (mut client, mut server) = socket_pair();

        write_frame(&mut client, b"payload", TEST_TIMEOUT).unwrap();

        let mut header = [0u8; HEADER_LEN];
        server.read_exact(&mut header).unwrap();
        assert_eq!(u32::from_be_bytes(header), 7);
        let mut body = [0u8; 7];
        server.read_exact(&mut body).unwrap();
        assert_eq!(&body, b"payload");
    }

    #[test]
    fn test_read_rejects_oversized_frame_without_waiting_for_body() {
        let (mut client, mut server) = socket_pair();

        // Claim a body one byte over the limit and send nothing else.
        server.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).unwrap();

        let start = Instant::now();
        let err = read_frame(&mut client, MAX_FRAME_SIZE, TEST_TIMEOUT).unwrap_err();
        let over_limit = u64::from(MAX_FRAME_SIZE) + 1;
        assert!(
            matches!(err, IpcError::FrameTooLarge { len, .. } if len == over_limit),
            "Expected FrameTooLarge, got: {:?}",
            err
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_read_accepts_frame_at_limit() {
        let (mut client, server) = socket_pair();
        let body = vec![7u8; MAX_FRAME_SIZE as usize];

        let writer = std::thread::spawn(move || {
            let mut server = server;
            server.write_all(&encode_frame(&body).unwrap()).unwrap();
        });

        let received = read_frame(&mut client, MAX_FRAME_SIZE, TEST_TIMEOUT).unwrap();
        assert_eq!(received.len(), MAX_FRAME_SIZE as usize);
        writer.join().unwrap();
    }

    #[test]
    fn test_short_body_is_error() {
        let (mut client, mut server) = socket_pair();

        server.write_all(&[0, 0, 0, 10, b'x', b'y']).unwrap();
        drop(server);

        let err = read_frame(&mut client, MAX_FRAME_SIZE, TEST_TIMEOUT).unwrap_err();
        assert!(
            matches!(err, IpcError::PeerClosed { received: 2, expected: 10 }),
            "Expected PeerClosed, got: {:?}",
            err
        );
    }

    #[test]
    fn test_connection_closed_returns_error() {
        let (mut client, server) = socket_pair();
        drop(server);

        let err = read_frame(&mut client, MAX_FRAME_SIZE, TEST_TIMEOUT).unwrap_err();
        assert!(matches!(err, IpcError::PeerClosed { received: 0, expected: 4 }));
    }

    #[test]
    fn test_garbled_body_is_decode_error() {
        let (mut client, mut server) = socket_pair();
        // Field key with the invalid wire type 7.
        server.write_all(&encode_frame(b"\xff\x00garbage").unwrap()).unwrap();

        let err =
            decode::<RequestEnvelope, _>(&mut client, MAX_FRAME_SIZE, TEST_TIMEOUT).unwrap_err();
        assert!(matches!(err, IpcError::Decode(_)), "got {:?}", err);
    }
}
