//! Link transport abstraction.
//!
//! The protocol engine only needs byte-level open / close / read / write.
//! `SerialPortTransport` backs it with the `serialport` crate, moving the
//! blocking calls onto the blocking thread pool; `SimulatedTransport` keeps
//! everything in memory for tests and offline runs.

use crate::link::error::TransportError;
use crate::link::types::PortSummary;
use hotfire_core::SerialSettings;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Byte-level link to the stand controller.
///
/// Implementations must be `Send + Sync` so they can be shared between the
/// engine task and its reader task.
#[async_trait::async_trait]
pub trait LinkTransport: Send + Sync {
    async fn open(&self, settings: &SerialSettings) -> Result<(), String>;

    async fn close(&self) -> Result<(), String>;

    /// Read up to `buf.len()` bytes.  `Ok(0)` means no data arrived within
    /// the transport's read timeout; an `Err` means the link is gone.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, String>;

    async fn write(&self, buf: &[u8]) -> Result<usize, String>;

    async fn flush(&self) -> Result<(), String>;

    fn is_open(&self) -> bool;

    fn port_name(&self) -> String;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  serialport back-end
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type PortSlot = Arc<std::sync::Mutex<Option<Box<dyn serialport::SerialPort>>>>;

/// OS serial port via `serialport`.
///
/// The reader and writer are separate handles (`try_clone`) so a blocking
/// read never holds up a write.
pub struct SerialPortTransport {
    name: std::sync::Mutex<String>,
    reader: PortSlot,
    writer: PortSlot,
    open: AtomicBool,
}

impl SerialPortTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            name: std::sync::Mutex::new(String::new()),
            reader: Arc::new(std::sync::Mutex::new(None)),
            writer: Arc::new(std::sync::Mutex::new(None)),
            open: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl LinkTransport for SerialPortTransport {
    async fn open(&self, settings: &SerialSettings) -> Result<(), String> {
        if self.open.load(Ordering::SeqCst) {
            return Err(format!("Port {} already open", settings.port_name));
        }
        let port_name = settings.port_name.clone();
        let baud = settings.baud_rate;
        let read_timeout = Duration::from_millis(settings.read_timeout_ms.max(1));
        let write_timeout = Duration::from_millis(settings.write_timeout_ms.max(1));

        let (reader, writer) = tokio::task::spawn_blocking(move || {
            let reader = serialport::new(&port_name, baud)
                .timeout(read_timeout)
                .open()
                .map_err(|e| e.to_string())?;
            let mut writer = reader.try_clone().map_err(|e| e.to_string())?;
            writer
                .set_timeout(write_timeout)
                .map_err(|e| e.to_string())?;
            Ok::<_, String>((reader, writer))
        })
        .await
        .map_err(|e| e.to_string())??;

        *self.reader.lock().map_err(|_| "reader lock poisoned".to_string())? = Some(reader);
        *self.writer.lock().map_err(|_| "writer lock poisoned".to_string())? = Some(writer);
        if let Ok(mut name) = self.name.lock() {
            *name = settings.port_name.clone();
        }
        self.open.store(true, Ordering::SeqCst);
        log::info!("[link:{}] opened at {} baud", settings.port_name, baud);
        Ok(())
    }

    async fn close(&self) -> Result<(), String> {
        self.open.store(false, Ordering::SeqCst);
        let reader = self.reader.clone();
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            if let Ok(mut w) = writer.lock() {
                w.take();
            }
            if let Ok(mut r) = reader.lock() {
                r.take();
            }
        })
        .await
        .map_err(|e| e.to_string())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("Port not open".to_string());
        }
        let reader = self.reader.clone();
        let len = buf.len();
        let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, String> {
            let mut guard = reader
                .lock()
                .map_err(|_| "reader lock poisoned".to_string())?;
            let port = guard.as_mut().ok_or_else(|| "Port not open".to_string())?;
            let mut tmp = vec![0u8; len];
            match port.read(&mut tmp) {
                Ok(n) => {
                    tmp.truncate(n);
                    Ok(tmp)
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await
        .map_err(|e| e.to_string())??;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("Port not open".to_string());
        }
        let writer = self.writer.clone();
        let data = buf.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer
                .lock()
                .map_err(|_| "writer lock poisoned".to_string())?;
            let port = guard.as_mut().ok_or_else(|| "Port not open".to_string())?;
            port.write_all(&data).map_err(|e| e.to_string())?;
            Ok::<_, String>(data.len())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn flush(&self) -> Result<(), String> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || -> Result<(), String> {
            let mut guard = writer
                .lock()
                .map_err(|_| "writer lock poisoned".to_string())?;
            match guard.as_mut() {
                Some(port) => port.flush().map_err(|e| e.to_string()),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| e.to_string())?
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> String {
        self.name.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

/// Serial ports visible to the OS.
pub fn available_ports() -> Result<Vec<PortSummary>, TransportError> {
    let ports =
        serialport::available_ports().map_err(|e| TransportError::Enumerate(e.to_string()))?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let kind = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => format!(
                    "usb {:04x}:{:04x}{}",
                    info.vid,
                    info.pid,
                    info.product.map(|s| format!(" {}", s)).unwrap_or_default()
                ),
                serialport::SerialPortType::PciPort => "pci".to_string(),
                serialport::SerialPortType::BluetoothPort => "bluetooth".to_string(),
                serialport::SerialPortType::Unknown => "unknown".to_string(),
            };
            PortSummary {
                name: p.port_name,
                kind,
            }
        })
        .collect())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & offline use)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully in-memory transport.
pub struct SimulatedTransport {
    name: String,
    open: AtomicBool,
    fail_open: AtomicBool,
    rx_buf: Mutex<VecDeque<u8>>,
    tx_buf: Mutex<VecDeque<u8>>,
    rx_notify: Notify,
    loopback: AtomicBool,
    opens: std::sync::atomic::AtomicU32,
}

impl SimulatedTransport {
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            tx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            rx_notify: Notify::new(),
            loopback: AtomicBool::new(false),
            opens: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Enable loopback mode (TX data is immediately available in RX).
    pub fn set_loopback(&self, enabled: bool) {
        self.loopback.store(enabled, Ordering::SeqCst);
    }

    /// Make subsequent `open` calls fail (device absent).
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Simulate the cable being pulled: the port closes underneath the
    /// engine and the next read fails.
    pub fn unplug(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Inject bytes into the receive buffer (simulate incoming data).
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.extend(data);
        self.rx_notify.notify_waiters();
    }

    /// Inject one line, terminated with `\n`.
    pub async fn inject_line(&self, line: &str) {
        self.inject_rx(format!("{}\n", line).as_bytes()).await;
    }

    /// Drain all bytes from the transmit buffer (for test assertions).
    pub async fn drain_tx(&self) -> Vec<u8> {
        let mut buf = self.tx_buf.lock().await;
        buf.drain(..).collect()
    }

    /// Drain the transmit buffer as lines.
    pub async fn drain_tx_lines(&self) -> Vec<String> {
        let bytes = self.drain_tx().await;
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Peek at the transmit buffer contents without draining.
    pub async fn peek_tx(&self) -> Vec<u8> {
        let buf = self.tx_buf.lock().await;
        buf.iter().copied().collect()
    }
}

#[async_trait::async_trait]
impl LinkTransport for SimulatedTransport {
    async fn open(&self, _settings: &SerialSettings) -> Result<(), String> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(format!("Port {} not found", self.name));
        }
        if self.open.load(Ordering::SeqCst) {
            return Err(format!("Port {} already open", self.name));
        }
        self.open.store(true, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), String> {
        self.open.store(false, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("Port not open".to_string());
        }
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() {
            drop(rx);
            // Wait for data with a short timeout
            tokio::select! {
                _ = self.rx_notify.notified() => {},
                _ = tokio::time::sleep(Duration::from_millis(50)) => {},
            }
            if !self.open.load(Ordering::SeqCst) {
                return Err("Port not open".to_string());
            }
            rx = self.rx_buf.lock().await;
        }
        let count = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("Port not open".to_string());
        }
        let mut tx = self.tx_buf.lock().await;
        tx.extend(buf);
        drop(tx);

        if self.loopback.load(Ordering::SeqCst) {
            self.inject_rx(buf).await;
        }
        Ok(buf.len())
    }

    async fn flush(&self) -> Result<(), String> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> String {
        self.name.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Line splitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Splits an inbound byte stream into lines.
///
/// CR, LF and CRLF all terminate a line; empty lines are dropped and bytes
/// beyond `max_line_length` are discarded until the next terminator.
pub struct LineSplitter {
    buffer: Vec<u8>,
    max_line_length: usize,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LineSplitter {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            max_line_length,
        }
    }

    /// Feed received bytes, returning every line they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            match byte {
                b'\r' | b'\n' => {
                    if !self.buffer.is_empty() {
                        let line = std::mem::take(&mut self.buffer);
                        lines.push(String::from_utf8_lossy(&line).into_owned());
                    }
                }
                _ => {
                    if self.buffer.len() < self.max_line_length {
                        self.buffer.push(byte);
                    }
                }
            }
        }
        lines
    }

    /// Bytes of the line currently being assembled.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
