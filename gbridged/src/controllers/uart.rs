//! Serial controller: one module on the far end of a serial line, all of
//! its CPorts multiplexed over the single byte stream with the CPort id
//! carried in the header pad.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use greybus::message::{cport_pack, cport_unpack, read_msg};
use greybus::{Error, Result};

use crate::bridge::Core;
use crate::controller::{
    interface_create, interface_destroy, interface_hotplug, Connection, Controller,
    ControllerHandle, Interface,
};

const READ_TIMEOUT: Duration = Duration::from_millis(500);

pub struct UartController {
    device: String,
    baudrate: u32,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
}

impl UartController {
    pub fn new(device: &str, baudrate: u32) -> UartController {
        UartController {
            device: device.to_string(),
            baudrate,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }
}

impl Controller for UartController {
    fn name(&self) -> &'static str {
        "uart"
    }

    fn init(&self, _core: &Arc<Core>) -> Result<()> {
        // 8N1, no flow control.
        let port = serialport::new(self.device.as_str(), self.baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| {
                log::error!("failed to open {}: {}", self.device, e);
                Error::Absent
            })?;
        let writer = port.try_clone().map_err(|e| {
            log::error!("failed to clone {}: {}", self.device, e);
            Error::Absent
        })?;

        *self.reader.lock().unwrap() = Some(port);
        *self.writer.lock().unwrap() = Some(writer);
        Ok(())
    }

    fn exit(&self) {
        self.reader.lock().unwrap().take();
        self.writer.lock().unwrap().take();
    }

    fn event_loop(&self, core: &Arc<Core>, ctrl: &Arc<ControllerHandle>) -> Result<()> {
        // The module is whatever sits on the configured line; hotplug it
        // once and let the reader thread do the rest.
        let intf = interface_create(core, ctrl, 1, 1, 0x1234)?;
        if let Err(e) = interface_hotplug(core, &intf) {
            log::error!("failed to hotplug the uart module: {}", e);
            interface_destroy(core, &intf);
            return Err(e);
        }
        Ok(())
    }

    fn write(&self, _core: &Arc<Core>, conn: &Connection, msg: &mut [u8]) -> Result<()> {
        cport_pack(msg, conn.cport2_id);
        let mut guard = self.writer.lock().unwrap();
        let port = guard.as_mut().ok_or(Error::Absent)?;
        port.write_all(msg)?;
        Ok(())
    }

    fn intf_read(&self, _intf: &Interface, buf: &mut [u8]) -> Result<(u16, usize)> {
        let mut guard = self.reader.lock().unwrap();
        let port = guard.as_mut().ok_or(Error::Absent)?;
        let len = read_msg(port, buf)?;
        Ok((cport_unpack(&buf[..len]), len))
    }

    fn is_stream(&self) -> bool {
        true
    }
}
