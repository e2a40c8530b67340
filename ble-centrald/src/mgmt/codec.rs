//! Framed decoder for the management channel byte stream.
//!
//! Two layers: [`MgmtCodec`] turns an arbitrary chunking of bytes into
//! whole [`MgmtFrame`]s, and [`MgmtEvent::from_frame`] interprets the
//! frames the core cares about. Partial frames stay buffered; a declared
//! length beyond [`MAX_FRAME_SIZE`] poisons the codec and clears the
//! buffer.

use shared::protocol::{
    format_wire_address, parse_wire_address, ADV_MONITOR_DEVICE_FOUND, DEVICE_FOUND,
    HEADER_SIZE, MAX_FRAME_SIZE, MGMT_EV_CMD_COMPLETE, MGMT_EV_CMD_STATUS,
    MGMT_OP_GET_CONNECTIONS, MGMT_OP_LOAD_CONN_PARAM, RSSI_NOT_AVAILABLE,
};

use crate::error::BleError;

/// One whole frame off the wire: header fields plus raw parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtFrame {
    pub event_code: u16,
    pub controller_idx: u16,
    pub params: Vec<u8>,
}

impl MgmtFrame {
    pub fn new(event_code: u16, controller_idx: u16, params: Vec<u8>) -> Self {
        Self {
            event_code,
            controller_idx,
            params,
        }
    }

    /// Serialise as header + params, everything little endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.params.len());
        out.extend_from_slice(&self.event_code.to_le_bytes());
        out.extend_from_slice(&self.controller_idx.to_le_bytes());
        out.extend_from_slice(&(self.params.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.params);
        out
    }

    /// Build a DEVICE_FOUND event frame (used by tests and loopbacks).
    pub fn device_found(
        controller_idx: u16,
        address: &str,
        address_type: u8,
        rssi: i8,
        flags: u32,
        ad_data: &[u8],
    ) -> Option<Self> {
        let wire_addr = parse_wire_address(address)?;
        let mut params = Vec::with_capacity(14 + ad_data.len());
        params.extend_from_slice(&wire_addr);
        params.push(address_type);
        params.push(rssi as u8);
        params.extend_from_slice(&flags.to_le_bytes());
        params.extend_from_slice(&(ad_data.len() as u16).to_le_bytes());
        params.extend_from_slice(ad_data);
        Some(Self::new(DEVICE_FOUND, controller_idx, params))
    }

    /// Build a GET_CONNECTIONS command frame.
    pub fn get_connections(controller_idx: u16) -> Self {
        Self::new(MGMT_OP_GET_CONNECTIONS, controller_idx, Vec::new())
    }

    /// Build a LOAD_CONN_PARAM command frame for one device.
    pub fn load_conn_param(
        controller_idx: u16,
        address: &str,
        address_type: u8,
        min_interval: u16,
        max_interval: u16,
        latency: u16,
        timeout: u16,
    ) -> Option<Self> {
        let wire_addr = parse_wire_address(address)?;
        let mut params = Vec::with_capacity(2 + 7 + 8);
        params.extend_from_slice(&1u16.to_le_bytes()); // param_count
        params.extend_from_slice(&wire_addr);
        params.push(address_type);
        params.extend_from_slice(&min_interval.to_le_bytes());
        params.extend_from_slice(&max_interval.to_le_bytes());
        params.extend_from_slice(&latency.to_le_bytes());
        params.extend_from_slice(&timeout.to_le_bytes());
        Some(Self::new(MGMT_OP_LOAD_CONN_PARAM, controller_idx, params))
    }
}

/// The frames the core reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtEvent {
    DeviceFound {
        controller_idx: u16,
        address: String,
        /// Opaque; preserved for the device details, never interpreted.
        address_type: u8,
        /// `None` when the controller reported 127 (not available).
        rssi: Option<i8>,
        flags: u32,
        ad_data: Vec<u8>,
    },
    CommandComplete {
        controller_idx: u16,
        opcode: u16,
        status: u8,
        data: Vec<u8>,
    },
    CommandStatus {
        controller_idx: u16,
        opcode: u16,
        status: u8,
    },
}

impl MgmtEvent {
    /// Interpret a frame; `None` for event codes the core ignores or
    /// payloads too short to carry their advertised event.
    pub fn from_frame(frame: &MgmtFrame) -> Option<Self> {
        match frame.event_code {
            DEVICE_FOUND => Self::parse_device_found(frame, 0),
            // ADV_MONITOR_DEVICE_FOUND prefixes the same payload with a
            // 2-byte monitor handle.
            ADV_MONITOR_DEVICE_FOUND => Self::parse_device_found(frame, 2),
            MGMT_EV_CMD_COMPLETE | MGMT_EV_CMD_STATUS => {
                let params = &frame.params;
                if params.len() < 3 {
                    return None;
                }
                let opcode = u16::from_le_bytes([params[0], params[1]]);
                let status = params[2];
                if frame.event_code == MGMT_EV_CMD_COMPLETE {
                    Some(Self::CommandComplete {
                        controller_idx: frame.controller_idx,
                        opcode,
                        status,
                        data: params[3..].to_vec(),
                    })
                } else {
                    Some(Self::CommandStatus {
                        controller_idx: frame.controller_idx,
                        opcode,
                        status,
                    })
                }
            }
            _ => None,
        }
    }

    fn parse_device_found(frame: &MgmtFrame, offset: usize) -> Option<Self> {
        let params = frame.params.get(offset..)?;
        if params.len() < 14 {
            return None;
        }
        let mut wire_addr = [0u8; 6];
        wire_addr.copy_from_slice(&params[..6]);
        let address_type = params[6];
        let rssi = params[7] as i8;
        let flags = u32::from_le_bytes([params[8], params[9], params[10], params[11]]);
        // The declared ad-data length is advisory; the frame length is
        // authoritative, matching what the kernel actually sent.
        let ad_data = params[14..].to_vec();
        Some(Self::DeviceFound {
            controller_idx: frame.controller_idx,
            address: format_wire_address(&wire_addr),
            address_type,
            rssi: (rssi != RSSI_NOT_AVAILABLE).then_some(rssi),
            flags,
            ad_data,
        })
    }
}

/// Incremental frame extractor.
#[derive(Debug, Default)]
pub struct MgmtCodec {
    buffer: Vec<u8>,
    lost: bool,
}

impl MgmtCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a framing error has poisoned this codec.
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Feed bytes, returning every frame completed so far.
    ///
    /// Never blocks; incomplete frames stay buffered for the next feed. A
    /// frame declaring more than [`MAX_FRAME_SIZE`] parameter bytes is a
    /// framing error: the buffer is cleared and the codec stays lost.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<MgmtFrame>, BleError> {
        if self.lost {
            return Err(BleError::ManagementProtocolFraming(
                "codec already lost".into(),
            ));
        }
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while self.buffer.len() >= HEADER_SIZE {
            let event_code = u16::from_le_bytes([self.buffer[0], self.buffer[1]]);
            let controller_idx = u16::from_le_bytes([self.buffer[2], self.buffer[3]]);
            let param_len = u16::from_le_bytes([self.buffer[4], self.buffer[5]]) as usize;
            if param_len > MAX_FRAME_SIZE {
                self.lost = true;
                self.buffer.clear();
                return Err(BleError::ManagementProtocolFraming(format!(
                    "declared parameter length {param_len} exceeds {MAX_FRAME_SIZE}"
                )));
            }
            if self.buffer.len() < HEADER_SIZE + param_len {
                break;
            }
            let params = self.buffer[HEADER_SIZE..HEADER_SIZE + param_len].to_vec();
            self.buffer.drain(..HEADER_SIZE + param_len);
            frames.push(MgmtFrame::new(event_code, controller_idx, params));
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    #[test]
    fn decode_is_left_inverse_of_encode() {
        let frames = vec![
            MgmtFrame::device_found(0, ADDR, 0x01, -60, 0, &[0x02, 0x01, 0x06]).unwrap(),
            MgmtFrame::new(MGMT_EV_CMD_COMPLETE, 1, vec![0x15, 0x00, 0x00, 0x02, 0x00]),
            MgmtFrame::new(0x0042, 2, vec![]),
        ];
        let mut wire = Vec::new();
        for frame in &frames {
            wire.extend(frame.encode());
        }
        let mut codec = MgmtCodec::new();
        assert_eq!(codec.feed(&wire).unwrap(), frames);
    }

    #[test]
    fn device_found_survives_arbitrary_chunking() {
        let ad_data = [0x03, 0x03, 0x12, 0x18, 0x02, 0x0A, 0xF4];
        let frame = MgmtFrame::device_found(3, ADDR, 0x02, -72, 0x0004, &ad_data).unwrap();
        let wire = frame.encode();

        let mut codec = MgmtCodec::new();
        let mut frames = Vec::new();
        // Three uneven chunks, one splitting the header itself.
        for chunk in [&wire[..4], &wire[4..9], &wire[9..]] {
            frames.extend(codec.feed(chunk).unwrap());
        }
        assert_eq!(frames.len(), 1);

        let event = MgmtEvent::from_frame(&frames[0]).unwrap();
        match event {
            MgmtEvent::DeviceFound {
                controller_idx,
                address,
                address_type,
                rssi,
                flags,
                ad_data: data,
            } => {
                assert_eq!(controller_idx, 3);
                assert_eq!(address, ADDR);
                assert_eq!(address_type, 0x02);
                assert_eq!(rssi, Some(-72));
                assert_eq!(flags, 0x0004);
                assert_eq!(data, ad_data);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn adv_monitor_variant_skips_the_handle() {
        let base = MgmtFrame::device_found(0, ADDR, 0x01, -60, 0, &[0xAA]).unwrap();
        let mut params = vec![0x07, 0x00]; // monitor handle
        params.extend(base.params);
        let frame = MgmtFrame::new(ADV_MONITOR_DEVICE_FOUND, 0, params);
        match MgmtEvent::from_frame(&frame).unwrap() {
            MgmtEvent::DeviceFound { address, ad_data, .. } => {
                assert_eq!(address, ADDR);
                assert_eq!(ad_data, vec![0xAA]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn rssi_127_reads_as_not_available() {
        let frame = MgmtFrame::device_found(0, ADDR, 0x01, 127, 0, &[]).unwrap();
        match MgmtEvent::from_frame(&frame).unwrap() {
            MgmtEvent::DeviceFound { rssi, .. } => assert_eq!(rssi, None),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn command_complete_carries_opcode_status_and_data() {
        let frame = MgmtFrame::new(
            MGMT_EV_CMD_COMPLETE,
            1,
            vec![0x15, 0x00, 0x00, 0x02, 0x00],
        );
        match MgmtEvent::from_frame(&frame).unwrap() {
            MgmtEvent::CommandComplete {
                controller_idx,
                opcode,
                status,
                data,
            } => {
                assert_eq!(controller_idx, 1);
                assert_eq!(opcode, MGMT_OP_GET_CONNECTIONS);
                assert_eq!(status, 0);
                assert_eq!(data, vec![0x02, 0x00]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn oversize_length_poisons_the_codec() {
        let mut header = Vec::new();
        header.extend_from_slice(&DEVICE_FOUND.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&5000u16.to_le_bytes());

        let mut codec = MgmtCodec::new();
        assert!(codec.feed(&header).is_err());
        assert!(codec.is_lost());
        // The buffer was cleared and the codec stays unusable.
        assert!(codec.feed(&[0x00]).is_err());
    }

    #[test]
    fn unknown_events_decode_but_do_not_interpret() {
        let frame = MgmtFrame::new(0x0042, 0, vec![1, 2, 3]);
        assert_eq!(MgmtEvent::from_frame(&frame), None);
    }

    #[test]
    fn short_device_found_payload_is_ignored() {
        let frame = MgmtFrame::new(DEVICE_FOUND, 0, vec![0xAA; 5]);
        assert_eq!(MgmtEvent::from_frame(&frame), None);
    }
}
