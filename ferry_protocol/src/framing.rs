// Length-delimited packet framing over TCP.
//
// Every packet on the wire is a 4-byte big-endian length prefix followed by
// the JSON encoding of a `Packet` (see `message.rs`). `read_frame` /
// `write_frame` move raw frame bodies; `read_packet` / `write_packet` add the
// JSON step on top. Both sides of every session (relay ↔ client and
// relay ↔ server) use the same functions.
//
// `MAX_FRAME_SIZE` bounds the allocation made for an incoming length prefix.
// Start-game world state is the largest packet we expect. Byte payloads are
// base64 inside the JSON body, so a single payload can be up to about 12 MiB.

use std::io::{self, Read, Write};

use crate::message::Packet;

/// Largest frame body accepted in either direction (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Write one frame: length prefix, body, flush.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame too large: {} bytes (max {MAX_FRAME_SIZE})", body.len()),
            )
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()
}

/// Read one frame body.
///
/// A stream that ends before or inside a frame yields `UnexpectedEof`; a
/// length prefix above `MAX_FRAME_SIZE` yields `InvalidData` without reading
/// the body.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// Encode `packet` as JSON and write it as one frame.
pub fn write_packet<W: Write>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    let body = serde_json::to_vec(packet).map_err(io::Error::from)?;
    write_frame(writer, &body)
}

/// Read one frame and decode it as a `Packet`. Undecodable bodies surface as
/// `InvalidData`.
pub fn read_packet<R: Read>(reader: &mut R) -> io::Result<Packet> {
    let body = read_frame(reader)?;
    serde_json::from_slice(&body).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn empty_frame_is_valid() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"").unwrap();
        assert_eq!(wire, vec![0, 0, 0, 0]);

        let mut cursor = Cursor::new(&wire);
        assert!(read_frame(&mut cursor).unwrap().is_empty());
    }

    #[test]
    fn rejects_oversized_write() {
        let big = vec![0u8; MAX_FRAME_SIZE as usize + 1];
        let mut wire = Vec::new();
        let err = write_frame(&mut wire, &big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(wire.is_empty(), "nothing should be written for a rejected frame");
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let prefix = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(prefix.to_vec());
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_body_is_unexpected_eof() {
        // Prefix promises 10 bytes, only 3 follow.
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(wire);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn packets_keep_their_order() {
        let packets = vec![
            Packet::Game { payload: vec![1] },
            Packet::Game { payload: vec![2, 2] },
            Packet::Disconnect {
                reason: "bye".into(),
            },
        ];
        let mut wire = Vec::new();
        for packet in &packets {
            write_packet(&mut wire, packet).unwrap();
        }

        let mut cursor = Cursor::new(&wire);
        for expected in &packets {
            assert_eq!(&read_packet(&mut cursor).unwrap(), expected);
        }
    }

    #[test]
    fn payload_bytes_are_base64_on_the_wire() {
        let body = serde_json::to_string(&Packet::Game {
            payload: b"hi".to_vec(),
        })
        .unwrap();
        assert_eq!(body, r#"{"Game":{"payload":"aGk="}}"#);
    }

    #[test]
    fn multi_megabyte_payload_fits_one_frame() {
        // As a JSON number array this would need about 32 MiB.
        let payload = vec![0xFFu8; 8 * 1024 * 1024];
        let packet = Packet::Game {
            payload: payload.clone(),
        };
        let mut wire = Vec::new();
        write_packet(&mut wire, &packet).unwrap();
        assert!(wire.len() < payload.len() / 3 * 4 + 64, "{} bytes", wire.len());

        let mut cursor = Cursor::new(&wire);
        assert_eq!(read_packet(&mut cursor).unwrap(), packet);
    }

    #[test]
    fn payload_that_is_not_base64_is_invalid_data() {
        let mut wire = Vec::new();
        write_frame(&mut wire, br#"{"Game":{"payload":"not base64!"}}"#).unwrap();
        let mut cursor = Cursor::new(&wire);
        let err = read_packet(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn garbage_body_is_invalid_data() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"not json").unwrap();
        let mut cursor = Cursor::new(&wire);
        let err = read_packet(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
