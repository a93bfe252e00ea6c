//! The operation engine: in-flight request tracking, inbound dispatch and
//! outbound request submission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use greybus::message::{MsgHeader, MSG_HEADER_SIZE, MTU};
use greybus::protocol::GB_OP_SUCCESS;
use greybus::{Error, Result};

use crate::bridge::Core;
use crate::driver::{Callback, Driver};
use crate::logging::hexdump;

/// One Greybus operation: the request bytes, the response bytes once they
/// exist, and the (interface, CPort) the operation belongs to.
pub struct Operation {
    req: Vec<u8>,
    resp: Option<Vec<u8>>,
    pub intf_id: u8,
    pub cport_id: u16,
}

impl Operation {
    fn from_request(msg: &[u8], intf_id: u8, cport_id: u16) -> Operation {
        Operation {
            req: msg.to_vec(),
            resp: None,
            intf_id,
            cport_id,
        }
    }

    pub fn request(&self) -> &[u8] {
        &self.req
    }

    pub fn request_header(&self) -> MsgHeader {
        MsgHeader::decode(&self.req).expect("operation request header already validated")
    }

    /// Request bytes past the header.
    pub fn request_payload(&self) -> &[u8] {
        &self.req[MSG_HEADER_SIZE..]
    }

    pub fn response(&self) -> Option<&[u8]> {
        self.resp.as_deref()
    }

    /// Response bytes past the header, once a response is attached.
    pub fn response_payload(&self) -> Option<&[u8]> {
        self.resp.as_deref().map(|r| &r[MSG_HEADER_SIZE..])
    }

    /// Lay down a response header for this operation and hand back the
    /// zeroed payload area to fill in.
    pub fn alloc_response(&mut self, payload_len: usize) -> Result<&mut [u8]> {
        let size = MSG_HEADER_SIZE + payload_len;
        if size > MTU {
            return Err(Error::Overflow);
        }

        let req = self.request_header();
        let mut resp = vec![0u8; size];
        MsgHeader {
            size: size as u16,
            operation_id: req.operation_id,
            op_type: req.op_type | greybus::message::OP_RESPONSE,
            result: GB_OP_SUCCESS,
            pad: [0, 0],
        }
        .encode(&mut resp);

        self.resp = Some(resp);
        Ok(&mut self.resp.as_mut().unwrap()[MSG_HEADER_SIZE..])
    }

    /// Fill in the response from a packed wire structure.
    pub fn respond<T: plain::Plain>(&mut self, value: &T) -> Result<()> {
        let bytes = unsafe { plain::as_bytes(value) };
        self.alloc_response(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

/// The set of requests whose responses are outstanding, addressed by
/// (CPort id, operation id).
pub struct OperationTable {
    ops: Mutex<HashMap<(u16, u16), Operation>>,
    next_id: AtomicU16,
}

impl OperationTable {
    pub fn new() -> OperationTable {
        OperationTable {
            ops: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(0),
        }
    }

    /// Allocate the next operation id. Ids increase monotonically per
    /// process and wrap around the reserved id 0.
    pub fn alloc_id(&self) -> u16 {
        loop {
            let id = self
                .next_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    fn insert(&self, op: Operation) {
        let id = op.request_header().operation_id;
        self.ops.lock().unwrap().insert((op.cport_id, id), op);
    }

    /// Remove and return the pending operation matching a response.
    /// Correlation is by (cport, operation id) only; the response type is
    /// not consulted.
    fn take(&self, cport_id: u16, operation_id: u16) -> Option<Operation> {
        self.ops.lock().unwrap().remove(&(cport_id, operation_id))
    }

    pub fn len(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OperationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a request operation with a freshly allocated id.
pub fn alloc_operation(core: &Core, op_type: u8, payload: &[u8]) -> Result<Operation> {
    let size = MSG_HEADER_SIZE + payload.len();
    if size > MTU {
        return Err(Error::Overflow);
    }

    let mut req = vec![0u8; size];
    MsgHeader {
        size: size as u16,
        operation_id: core.ops.alloc_id(),
        op_type,
        result: 0,
        pad: [0, 0],
    }
    .encode(&mut req);
    req[MSG_HEADER_SIZE..].copy_from_slice(payload);

    Ok(Operation {
        req,
        resp: None,
        intf_id: 0,
        cport_id: 0,
    })
}

/// Send a request towards the host and keep the operation linked until
/// its response arrives. A failed transmit unlinks it again.
pub fn send_request(core: &Arc<Core>, intf_id: u8, cport_id: u16, mut op: Operation) -> Result<()> {
    op.intf_id = intf_id;
    op.cport_id = cport_id;

    let msg = op.req.clone();
    let operation_id = op.request_header().operation_id;
    hexdump("send request", &msg);

    core.ops.insert(op);
    if let Err(e) = core.send_to_host(intf_id, cport_id, &msg) {
        core.ops.take(cport_id, operation_id);
        return Err(e);
    }
    Ok(())
}

fn dispatch(core: &Arc<Core>, driver: &'static Driver, op: &mut Operation) -> Result<()> {
    let id = match op.resp {
        Some(ref resp) => MsgHeader::decode(resp)?.op_type,
        None => op.request_header().op_type,
    };

    match driver.handler(id) {
        None => {
            log::error!(
                "no handler registered for operation type {:#04x} in {} driver",
                id,
                driver.name
            );
            Err(Error::Protocol)
        }
        Some(handler) => match handler.callback {
            Callback::Handler(f) => f(core, op),
            Callback::Empty => Ok(()),
            Callback::Unsupported => {
                log::error!(
                    "unsupported operation type {:#04x} in {} driver",
                    id,
                    driver.name
                );
                Err(Error::Protocol)
            }
        },
    }
}

/// Feed one inbound message through the engine.
///
/// Responses are correlated with their pending request and delivered to
/// the originating driver; requests are dispatched and answered, with an
/// empty response synthesized when the handler leaves none.
pub fn handle_message(core: &Arc<Core>, intf_id: u8, cport_id: u16, msg: &[u8]) -> Result<()> {
    let hdr = MsgHeader::decode(msg)?;
    let size = hdr.size as usize;
    if msg.len() < size {
        return Err(Error::Short);
    }
    let msg = &msg[..size];
    hexdump("recv", msg);

    let driver = match core.driver(intf_id, cport_id) {
        Some(driver) => driver,
        None => {
            log::error!(
                "no driver registered for interface {} cport {}",
                intf_id,
                cport_id
            );
            return Err(Error::Invalid);
        }
    };

    if hdr.is_response() {
        let mut op = match core.ops.take(cport_id, hdr.operation_id) {
            Some(op) => op,
            None => {
                log::error!(
                    "invalid response id {} on cport {}",
                    hdr.operation_id,
                    cport_id
                );
                return Err(Error::Invalid);
            }
        };
        op.resp = Some(msg.to_vec());
        dispatch(core, driver, &mut op)
    } else {
        let mut op = Operation::from_request(msg, intf_id, cport_id);
        let ret = dispatch(core, driver, &mut op);
        if op.resp.is_none() {
            op.alloc_response(0)?;
        }

        let resp = op.resp.as_mut().unwrap();
        resp[5] = match &ret {
            Ok(()) => GB_OP_SUCCESS,
            Err(e) => e.wire_result(),
        };

        hexdump("send response", resp);
        core.send_to_host(intf_id, cport_id, resp)?;
        ret
    }
}
