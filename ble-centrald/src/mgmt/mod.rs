//! Host-kernel BLE management channel: frame codec and async transport.

pub mod channel;
pub mod codec;
