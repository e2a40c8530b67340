//! Async transport over the management socket.
//!
//! Owns the reader task that feeds the codec, resolves pending command
//! replies keyed by `(opcode, controller_idx)`, and forwards device-found
//! events to the manager. Works over any byte stream so tests can drive it
//! with an in-memory duplex.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use shared::protocol::format_wire_address;

use crate::error::{BleError, Result};

use super::codec::{MgmtCodec, MgmtEvent, MgmtFrame};

/// How long to wait for the kernel to answer a command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

type PendingKey = (u16, u16);
type PendingMap = Arc<Mutex<HashMap<PendingKey, oneshot::Sender<(u8, Vec<u8>)>>>>;

/// Handle for issuing management commands on a spawned channel.
#[derive(Clone)]
pub struct MgmtHandle {
    writer: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: PendingMap,
}

/// Spawn the reader task for a management connection.
///
/// Device-found events flow out through `event_tx`; `on_connection_lost`
/// fires exactly once, whether the stream closes, errors, or the codec
/// hits a framing error.
pub fn spawn<S>(
    stream: S,
    event_tx: mpsc::Sender<MgmtEvent>,
    on_connection_lost: impl FnOnce() + Send + 'static,
) -> MgmtHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(stream);
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let handle = MgmtHandle {
        writer: Arc::new(tokio::sync::Mutex::new(Box::new(write_half))),
        pending: Arc::clone(&pending),
    };

    tokio::spawn(async move {
        let mut codec = MgmtCodec::new();
        let mut buf = [0u8; 2048];
        loop {
            let frames = match read_half.read(&mut buf).await {
                Ok(0) => {
                    tracing::info!("management socket closed");
                    break;
                }
                Ok(n) => match codec.feed(&buf[..n]) {
                    Ok(frames) => frames,
                    Err(err) => {
                        tracing::warn!(error = %err, "management framing error, dropping connection");
                        break;
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "management socket read failed");
                    break;
                }
            };
            for frame in frames {
                let Some(event) = MgmtEvent::from_frame(&frame) else {
                    continue;
                };
                match event {
                    MgmtEvent::CommandComplete {
                        controller_idx,
                        opcode,
                        status,
                        ref data,
                    } => {
                        if resolve_pending(&pending, opcode, controller_idx, status, data.clone()) {
                            continue;
                        }
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    MgmtEvent::CommandStatus {
                        controller_idx,
                        opcode,
                        status,
                    } => {
                        if resolve_pending(&pending, opcode, controller_idx, status, Vec::new()) {
                            continue;
                        }
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    MgmtEvent::DeviceFound { .. } => {
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        // Fail anything still waiting for a reply, then report the loss.
        pending.lock().expect("pending map poisoned").clear();
        on_connection_lost();
    });

    handle
}

fn resolve_pending(
    pending: &PendingMap,
    opcode: u16,
    controller_idx: u16,
    status: u8,
    data: Vec<u8>,
) -> bool {
    if let Some(tx) = pending
        .lock()
        .expect("pending map poisoned")
        .remove(&(opcode, controller_idx))
    {
        let _ = tx.send((status, data));
        return true;
    }
    false
}

impl MgmtHandle {
    /// Issue a command and await its completion or status reply.
    async fn command(&self, frame: MgmtFrame) -> Result<(u8, Vec<u8>)> {
        let key = (frame.event_code, frame.controller_idx);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(key, tx);

        let wire = frame.encode();
        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.write_all(&wire).await {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&key);
                return Err(err.into());
            }
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BleError::ManagementProtocolFraming(
                "connection lost before command reply".into(),
            )),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&key);
                Err(BleError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "management command timed out",
                )))
            }
        }
    }

    /// Ask the kernel which devices hold connections on a controller.
    pub async fn get_connections(&self, controller_idx: u16) -> Result<Vec<String>> {
        let (status, data) = self.command(MgmtFrame::get_connections(controller_idx)).await?;
        if status != 0 {
            return Err(BleError::ManagementCommandFailed { status });
        }
        if data.len() < 2 {
            return Err(BleError::ManagementProtocolFraming(
                "GET_CONNECTIONS reply too short".into(),
            ));
        }
        let count = u16::from_le_bytes([data[0], data[1]]) as usize;
        let mut addresses = Vec::with_capacity(count);
        // Each entry is a 7-byte addr_info: 6-byte address + type.
        for entry in data[2..].chunks_exact(7).take(count) {
            let mut wire_addr = [0u8; 6];
            wire_addr.copy_from_slice(&entry[..6]);
            addresses.push(format_wire_address(&wire_addr));
        }
        Ok(addresses)
    }

    /// Load preferred connection parameters for one device.
    #[allow(clippy::too_many_arguments)]
    pub async fn load_conn_param(
        &self,
        controller_idx: u16,
        address: &str,
        address_type: u8,
        min_interval: u16,
        max_interval: u16,
        latency: u16,
        timeout: u16,
    ) -> Result<()> {
        let frame = MgmtFrame::load_conn_param(
            controller_idx,
            address,
            address_type,
            min_interval,
            max_interval,
            latency,
            timeout,
        )
        .ok_or_else(|| {
            BleError::ManagementProtocolFraming(format!("invalid address {address}"))
        })?;
        let (status, _) = self.command(frame).await?;
        if status != 0 {
            return Err(BleError::ManagementCommandFailed { status });
        }
        Ok(())
    }
}
