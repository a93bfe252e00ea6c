//! Loopback protocol driver: the echo service used to exercise a
//! connection end to end.

use std::sync::Arc;

use greybus::protocol::{loopback, payload_as, CPORT_SHUTDOWN};
use greybus::{Error, Result};

use crate::bridge::Core;
use crate::driver::{request, request_empty, Driver};
use crate::engine::Operation;

static LOOPBACK_DRIVER: Driver = Driver {
    name: "loopback",
    operations: &[
        request_empty(CPORT_SHUTDOWN),
        request_empty(loopback::PING),
        request(loopback::TRANSFER, transfer_request),
        request_empty(loopback::SINK),
    ],
};

pub fn register_driver(core: &Arc<Core>, intf_id: u8, cport_id: u16) -> Result<()> {
    core.register_driver(intf_id, cport_id, &LOOPBACK_DRIVER)
}

pub fn unregister_driver(core: &Arc<Core>, intf_id: u8, cport_id: u16) {
    core.unregister_driver(intf_id, cport_id);
}

const TRANSFER_HEADER_SIZE: usize = 12;

fn transfer_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    let payload = op.request_payload();
    let header: &loopback::TransferHeader = payload_as(payload)?;
    let (len, reserved0, reserved1) = (
        u32::from_le(header.len),
        header.reserved0,
        header.reserved1,
    );

    let data = &payload[TRANSFER_HEADER_SIZE..];
    if len as usize > data.len() {
        log::error!(
            "loopback transfer claims {} bytes but carries {}",
            len,
            data.len()
        );
        return Err(Error::Protocol);
    }
    let data = data[..len as usize].to_vec();

    let echoed = loopback::TransferHeader {
        len: len.to_le(),
        reserved0,
        reserved1,
    };
    let resp = op.alloc_response(TRANSFER_HEADER_SIZE + data.len())?;
    resp[..TRANSFER_HEADER_SIZE].copy_from_slice(unsafe { plain::as_bytes(&echoed) });
    resp[TRANSFER_HEADER_SIZE..].copy_from_slice(&data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::recording_core;
    use crate::engine::handle_message;
    use greybus::message::{MsgHeader, MSG_HEADER_SIZE};

    fn transfer_bytes(op_id: u16, len: u32, r0: u32, r1: u32, data: &[u8]) -> Vec<u8> {
        let mut msg = vec![0u8; MSG_HEADER_SIZE + TRANSFER_HEADER_SIZE + data.len()];
        MsgHeader {
            size: msg.len() as u16,
            operation_id: op_id,
            op_type: loopback::TRANSFER,
            result: 0,
            pad: [0, 0],
        }
        .encode(&mut msg);
        msg[MSG_HEADER_SIZE..MSG_HEADER_SIZE + 4].copy_from_slice(&len.to_le_bytes());
        msg[MSG_HEADER_SIZE + 4..MSG_HEADER_SIZE + 8].copy_from_slice(&r0.to_le_bytes());
        msg[MSG_HEADER_SIZE + 8..MSG_HEADER_SIZE + 12].copy_from_slice(&r1.to_le_bytes());
        msg[MSG_HEADER_SIZE + 12..].copy_from_slice(data);
        msg
    }

    #[test]
    fn transfer_echoes_payload() {
        let (core, host) = recording_core();
        register_driver(&core, 0, 4).unwrap();

        let msg = transfer_bytes(5, 4, 0x11, 0x22, &[0xde, 0xad, 0xbe, 0xef]);
        handle_message(&core, 0, 4, &msg).unwrap();

        let sent = host.sent();
        let (_, resp) = sent.last().unwrap();
        assert_eq!(resp[4], loopback::TRANSFER | 0x80);
        assert_eq!(resp[5], 0);
        assert_eq!(&resp[MSG_HEADER_SIZE..], &msg[MSG_HEADER_SIZE..]);
    }

    #[test]
    fn transfer_with_bad_length_is_rejected() {
        let (core, host) = recording_core();
        register_driver(&core, 0, 6).unwrap();

        let msg = transfer_bytes(6, 64, 0, 0, &[1, 2, 3]);
        assert!(handle_message(&core, 0, 6, &msg).is_err());
        let sent = host.sent();
        let (_, resp) = sent.last().unwrap();
        assert_eq!(resp[5], greybus::protocol::GB_OP_PROTOCOL_BAD);
    }

    #[test]
    fn ping_and_sink_are_acked() {
        let (core, host) = recording_core();
        register_driver(&core, 0, 8).unwrap();

        for (id, op_type) in [(7u16, loopback::PING), (8, loopback::SINK)] {
            let mut msg = vec![0u8; MSG_HEADER_SIZE];
            MsgHeader {
                size: 8,
                operation_id: id,
                op_type,
                result: 0,
                pad: [0, 0],
            }
            .encode(&mut msg);
            handle_message(&core, 0, 8, &msg).unwrap();
            let sent = host.sent();
            let (_, resp) = sent.last().unwrap();
            assert_eq!(resp.len(), MSG_HEADER_SIZE);
            assert_eq!(resp[4], op_type | 0x80);
            assert_eq!(resp[5], 0);
        }
    }
}
