//! BLE AD-structure parser for raw advertisement payloads.
//!
//! An advertisement payload is a sequence of TLV records: one length byte
//! covering the type byte plus the value, then the type, then the value.
//! Zero-length or truncated records terminate the walk; whatever parsed
//! before them is kept.

use std::collections::HashMap;

use uuid::Uuid;

const AD_SHORTENED_LOCAL_NAME: u8 = 0x08;
const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0A;
const AD_UUID16_INCOMPLETE: u8 = 0x02;
const AD_UUID16_COMPLETE: u8 = 0x03;
const AD_UUID32_INCOMPLETE: u8 = 0x04;
const AD_UUID32_COMPLETE: u8 = 0x05;
const AD_UUID128_INCOMPLETE: u8 = 0x06;
const AD_UUID128_COMPLETE: u8 = 0x07;
const AD_SOLICIT_UUID16: u8 = 0x14;
const AD_SOLICIT_UUID128: u8 = 0x15;
const AD_SOLICIT_UUID32: u8 = 0x1F;
const AD_SERVICE_DATA_UUID16: u8 = 0x16;
const AD_SERVICE_DATA_UUID32: u8 = 0x20;
const AD_SERVICE_DATA_UUID128: u8 = 0x21;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// Fields recovered from one raw advertisement payload.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedAdvertisement {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub tx_power: Option<i8>,
}

/// Expand a 16-bit assigned number to a full UUID on the Bluetooth base.
pub fn uuid_from_u16(value: u16) -> Uuid {
    uuid_from_u32(value as u32)
}

/// Expand a 32-bit assigned number to a full UUID on the Bluetooth base.
pub fn uuid_from_u32(value: u32) -> Uuid {
    Uuid::from_fields(
        value,
        0x0000,
        0x1000,
        &[0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB],
    )
}

/// 128-bit UUIDs arrive little endian on the wire.
fn uuid_from_le_bytes(bytes: &[u8]) -> Uuid {
    let mut be = [0u8; 16];
    for (slot, byte) in be.iter_mut().zip(bytes.iter().rev()) {
        *slot = *byte;
    }
    Uuid::from_bytes(be)
}

fn push_unique(uuids: &mut Vec<Uuid>, uuid: Uuid) {
    if !uuids.contains(&uuid) {
        uuids.push(uuid);
    }
}

pub fn parse_advertisement_bytes(data: &[u8]) -> ParsedAdvertisement {
    let mut parsed = ParsedAdvertisement::default();

    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + len >= data.len() {
            break;
        }
        let ad_type = data[i + 1];
        let value = &data[i + 2..i + 1 + len];
        match ad_type {
            AD_COMPLETE_LOCAL_NAME => {
                parsed.local_name = Some(String::from_utf8_lossy(value).into_owned());
            }
            AD_SHORTENED_LOCAL_NAME => {
                // A complete name elsewhere in the payload wins.
                if parsed.local_name.is_none() {
                    parsed.local_name = Some(String::from_utf8_lossy(value).into_owned());
                }
            }
            AD_TX_POWER => {
                if let Some(&level) = value.first() {
                    parsed.tx_power = Some(level as i8);
                }
            }
            AD_UUID16_INCOMPLETE | AD_UUID16_COMPLETE | AD_SOLICIT_UUID16 => {
                for chunk in value.chunks_exact(2) {
                    let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                    push_unique(&mut parsed.service_uuids, uuid_from_u16(short));
                }
            }
            AD_UUID32_INCOMPLETE | AD_UUID32_COMPLETE | AD_SOLICIT_UUID32 => {
                for chunk in value.chunks_exact(4) {
                    let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    push_unique(&mut parsed.service_uuids, uuid_from_u32(word));
                }
            }
            AD_UUID128_INCOMPLETE | AD_UUID128_COMPLETE | AD_SOLICIT_UUID128 => {
                for chunk in value.chunks_exact(16) {
                    push_unique(&mut parsed.service_uuids, uuid_from_le_bytes(chunk));
                }
            }
            AD_SERVICE_DATA_UUID16 => {
                if value.len() >= 2 {
                    let short = u16::from_le_bytes([value[0], value[1]]);
                    parsed
                        .service_data
                        .insert(uuid_from_u16(short), value[2..].to_vec());
                }
            }
            AD_SERVICE_DATA_UUID32 => {
                if value.len() >= 4 {
                    let word = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
                    parsed
                        .service_data
                        .insert(uuid_from_u32(word), value[4..].to_vec());
                }
            }
            AD_SERVICE_DATA_UUID128 => {
                if value.len() >= 16 {
                    parsed
                        .service_data
                        .insert(uuid_from_le_bytes(&value[..16]), value[16..].to_vec());
                }
            }
            AD_MANUFACTURER_DATA => {
                if value.len() >= 2 {
                    let company = u16::from_le_bytes([value[0], value[1]]);
                    parsed
                        .manufacturer_data
                        .insert(company, value[2..].to_vec());
                }
            }
            _ => {}
        }
        i += len + 1;
    }

    parsed
}
