//! Wire constants for the host-kernel BLE management channel.
//!
//! Every multi-byte field on the wire is little endian. A frame is a
//! 6-byte header `{event_code: u16, controller_idx: u16, param_len: u16}`
//! followed by `param_len` payload bytes.

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 6;

/// Upper bound on `param_len`; anything larger is a framing error.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Management events.
pub const MGMT_EV_CMD_COMPLETE: u16 = 0x0001;
pub const MGMT_EV_CMD_STATUS: u16 = 0x0002;
pub const DEVICE_FOUND: u16 = 0x0012;
pub const ADV_MONITOR_DEVICE_FOUND: u16 = 0x002F;

/// Management commands.
pub const MGMT_OP_GET_CONNECTIONS: u16 = 0x0015;
pub const MGMT_OP_LOAD_CONN_PARAM: u16 = 0x0035;

/// RSSI byte value meaning "not available".
pub const RSSI_NOT_AVAILABLE: i8 = 127;

/// Render a 6-byte little-endian wire address as "XX:XX:XX:XX:XX:XX".
pub fn format_wire_address(raw: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        raw[5], raw[4], raw[3], raw[2], raw[1], raw[0]
    )
}

/// Parse "XX:XX:XX:XX:XX:XX" back into the 6-byte little-endian wire form.
pub fn parse_wire_address(mac: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = mac.split(':');
    for slot in (0..6).rev() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        out[slot] = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}
