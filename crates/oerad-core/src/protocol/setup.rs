//! UART bridge setup sequence issued by `Radar::initialize`.

use byteorder::{LittleEndian, WriteBytesExt};

use super::constants::*;
use crate::transport::ControlRequest;

/// One step of the setup sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub name: &'static str,
    pub request: ControlRequest,
}

/// Build the setup sequence in the order the bridge expects it.
pub fn setup_sequence() -> Vec<SetupStep> {
    vec![
        step("enable UART", REQ_IFC_ENABLE, UART_ENABLE, Vec::new()),
        step("set modem handshaking", REQ_SET_MHS, MHS_DTR_RTS, Vec::new()),
        step("set baud rate divisor", REQ_SET_BAUDDIV, BAUD_DIVISOR, Vec::new()),
        step("set baud rate", REQ_SET_BAUDRATE, 0, baud_payload(BAUD_RATE)),
        step("set line control", REQ_SET_LINE_CTL, LINE_CTL_8N1, Vec::new()),
    ]
}

fn step(name: &'static str, request: u8, value: u16, data: Vec<u8>) -> SetupStep {
    SetupStep {
        name,
        request: ControlRequest {
            request_type: SETUP_REQUEST_TYPE,
            request,
            value,
            index: INTERFACE_NUMBER as u16,
            data,
        },
    }
}

fn baud_payload(rate: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    // Writing into a Vec cannot fail.
    let _ = buf.write_u32::<LittleEndian>(rate);
    buf
}
