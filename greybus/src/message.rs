//! Operation message header codec and length-framed stream reads.
//!
//! Every Greybus message starts with an 8-byte little-endian header:
//!
//! ```text
//! 0        2        4      5       6        8
//! +--------+--------+------+-------+--------+
//! |  size  | op id  | type | result|  pad   |
//! +--------+--------+------+-------+--------+
//! ```
//!
//! `size` counts the header itself. Responses carry the request type with
//! the top bit set and a `result` byte; requests leave `result` zero.
//! Multiplexed stream transports reuse `pad` to carry the module-side
//! CPort id; transports with one socket per CPort leave it alone.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian};

use crate::{Error, Result};

/// Wire size of the operation message header.
pub const MSG_HEADER_SIZE: usize = 8;

/// Largest message the bridge carries, header included.
pub const MTU: usize = 2048;

/// Set in the `type` field of response messages.
pub const OP_RESPONSE: u8 = 0x80;

/// Decoded operation message header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgHeader {
    pub size: u16,
    pub operation_id: u16,
    pub op_type: u8,
    pub result: u8,
    pub pad: [u8; 2],
}

impl MsgHeader {
    /// Decode the header at the front of `msg`.
    ///
    /// Fails with `Protocol` when `size` is smaller than the header and
    /// with `Overflow` when it exceeds the MTU.
    pub fn decode(msg: &[u8]) -> Result<MsgHeader> {
        if msg.len() < MSG_HEADER_SIZE {
            return Err(Error::Short);
        }
        let size = LittleEndian::read_u16(&msg[0..2]);
        if (size as usize) < MSG_HEADER_SIZE {
            return Err(Error::Protocol);
        }
        if size as usize > MTU {
            return Err(Error::Overflow);
        }
        Ok(MsgHeader {
            size,
            operation_id: LittleEndian::read_u16(&msg[2..4]),
            op_type: msg[4],
            result: msg[5],
            pad: [msg[6], msg[7]],
        })
    }

    /// Encode into the first 8 bytes of `msg`.
    pub fn encode(&self, msg: &mut [u8]) {
        LittleEndian::write_u16(&mut msg[0..2], self.size);
        LittleEndian::write_u16(&mut msg[2..4], self.operation_id);
        msg[4] = self.op_type;
        msg[5] = self.result;
        msg[6] = self.pad[0];
        msg[7] = self.pad[1];
    }

    pub fn is_response(&self) -> bool {
        self.op_type & OP_RESPONSE != 0
    }
}

/// Total message size recorded in a raw message's header.
pub fn msg_size(msg: &[u8]) -> usize {
    debug_assert!(msg.len() >= 2);
    LittleEndian::read_u16(&msg[0..2]) as usize
}

/// Stash the module-side CPort id in the header's pad bytes.
pub fn cport_pack(msg: &mut [u8], cport_id: u16) {
    LittleEndian::write_u16(&mut msg[6..8], cport_id);
}

/// Recover the module-side CPort id from the header's pad bytes.
pub fn cport_unpack(msg: &[u8]) -> u16 {
    LittleEndian::read_u16(&msg[6..8])
}

/// Zero the pad bytes before handing a message to the host.
pub fn cport_clear(msg: &mut [u8]) {
    msg[6] = 0;
    msg[7] = 0;
}

fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8], mut idle: bool) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match reader.read(&mut buf[done..]) {
            Ok(0) => return Err(Error::Short),
            Ok(n) => {
                done += n;
                idle = false;
            }
            Err(e) => match e.kind() {
                io::ErrorKind::Interrupted => continue,
                // A timeout while no byte of the message has arrived yet is
                // reported so callers can poll their shutdown flag. Once
                // framing has started the read must run to completion.
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock if idle => {
                    return Err(Error::Timeout)
                }
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => continue,
                _ => return Err(Error::Io(e)),
            },
        }
    }
    Ok(())
}

/// Read one length-framed Greybus message from `reader` into `buf`,
/// returning its total length.
///
/// The 8 header bytes are read first; the header's `size` then tells how
/// much payload follows. An oversized message is drained off the stream
/// before the error is returned so the reader stays framed.
pub fn read_msg<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    if buf.len() < MSG_HEADER_SIZE {
        return Err(Error::Invalid);
    }
    fill(reader, &mut buf[..MSG_HEADER_SIZE], true)?;

    let size = msg_size(buf);
    if size < MSG_HEADER_SIZE {
        return Err(Error::Protocol);
    }
    if size > buf.len() {
        drain(reader, size - MSG_HEADER_SIZE)?;
        return Err(Error::Overflow);
    }

    fill(reader, &mut buf[MSG_HEADER_SIZE..size], false)?;
    Ok(size)
}

fn drain<R: Read + ?Sized>(reader: &mut R, mut left: usize) -> Result<()> {
    let mut scratch = [0u8; 256];
    while left > 0 {
        let chunk = left.min(scratch.len());
        fill(reader, &mut scratch[..chunk], false)?;
        left -= chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut op_id: u16 = 0xace1;
        for size in (MSG_HEADER_SIZE as u16..=MTU as u16).step_by(37) {
            for op_type in [0x00u8, 0x01, 0x13, 0x7d, 0x7f, 0xfd, 0xff] {
                // xorshift over the id space so every run covers a spread
                // of operation ids without enumerating all 65536.
                op_id ^= op_id << 7;
                op_id ^= op_id >> 9;
                op_id ^= op_id << 8;
                let hdr = MsgHeader {
                    size,
                    operation_id: op_id,
                    op_type,
                    result: op_type.wrapping_mul(3),
                    pad: [0, 0],
                };
                let mut buf = [0u8; MSG_HEADER_SIZE];
                hdr.encode(&mut buf);
                assert_eq!(MsgHeader::decode(&buf).unwrap(), hdr);
            }
        }
    }

    #[test]
    fn header_rejects_bad_sizes() {
        let mut buf = [0u8; MSG_HEADER_SIZE];
        MsgHeader {
            size: 7,
            ..Default::default()
        }
        .encode(&mut buf);
        assert!(matches!(MsgHeader::decode(&buf), Err(Error::Protocol)));

        MsgHeader {
            size: MTU as u16 + 1,
            ..Default::default()
        }
        .encode(&mut buf);
        assert!(matches!(MsgHeader::decode(&buf), Err(Error::Overflow)));

        assert!(matches!(MsgHeader::decode(&buf[..5]), Err(Error::Short)));
    }

    #[test]
    fn cport_survives_pack_unpack() {
        let mut msg = [0u8; MSG_HEADER_SIZE];
        MsgHeader {
            size: 8,
            operation_id: 5,
            op_type: 0x02,
            result: 0,
            pad: [0, 0],
        }
        .encode(&mut msg);

        for cport in [0u16, 1, 2, 0x7f, 0x80, 0xff, 0x100, 0x1234, 0xfffe, 0xffff] {
            cport_pack(&mut msg, cport);
            assert_eq!(cport_unpack(&msg), cport);
            // The rest of the header is untouched.
            let hdr = MsgHeader::decode(&msg).unwrap();
            assert_eq!(hdr.size, 8);
            assert_eq!(hdr.operation_id, 5);
            assert_eq!(hdr.op_type, 0x02);
        }

        cport_clear(&mut msg);
        assert_eq!(cport_unpack(&msg), 0);
    }

    #[test]
    fn read_msg_frames_a_stream() {
        // Two back-to-back messages on one stream.
        let mut stream: Vec<u8> = vec![
            0x0a, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0xaa, 0xbb,
        ];
        stream.extend_from_slice(&[0x08, 0x00, 0x02, 0x00, 0x03, 0x00, 0x07, 0x00]);

        let mut cursor = &stream[..];
        let mut buf = [0u8; 64];

        let len = read_msg(&mut cursor, &mut buf).unwrap();
        assert_eq!(len, 10);
        assert_eq!(&buf[8..10], &[0xaa, 0xbb]);

        let len = read_msg(&mut cursor, &mut buf).unwrap();
        assert_eq!(len, 8);
        assert_eq!(cport_unpack(&buf[..len]), 7);
    }

    #[test]
    fn read_msg_short_stream() {
        let stream = [0x0a, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0xaa];
        let mut cursor = &stream[..];
        let mut buf = [0u8; 64];
        assert!(matches!(read_msg(&mut cursor, &mut buf), Err(Error::Short)));
    }

    #[test]
    fn read_msg_oversize_keeps_framing() {
        // First message announces 24 bytes but the caller's buffer only
        // holds 16; the follow-up message must still parse.
        let mut stream: Vec<u8> = vec![0x18, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00];
        stream.extend_from_slice(&[0u8; 16]);
        stream.extend_from_slice(&[0x08, 0x00, 0x02, 0x00, 0x02, 0x00, 0x00, 0x00]);

        let mut cursor = &stream[..];
        let mut buf = [0u8; 16];
        assert!(matches!(
            read_msg(&mut cursor, &mut buf),
            Err(Error::Overflow)
        ));
        let len = read_msg(&mut cursor, &mut buf).unwrap();
        assert_eq!(len, 8);
        assert_eq!(MsgHeader::decode(&buf[..len]).unwrap().operation_id, 2);
    }
}
