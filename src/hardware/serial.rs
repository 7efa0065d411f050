//! Serial Port Abstractions
//!
//! Shared types for the async serial link to the motion controller.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`PortOpener`]: Opens a transport by port name and baud rate. Implemented by
//!   [`SerialPortOpener`] for real hardware and by
//!   [`MockGrbl`](crate::hardware::mock::MockGrbl) for simulation.
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking
//! - [`available_ports`]: List serial ports known to the OS

use crate::error::{AppResult, GantryError};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing and simulation)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens a transport to the motion controller.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open `port` at `baud_rate`.
    ///
    /// # Errors
    /// Returns [`GantryError::Connection`] when the transport cannot be opened.
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<DynSerial>;
}

/// Opens real serial ports through `tokio-serial`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

#[async_trait]
impl PortOpener for SerialPortOpener {
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<DynSerial> {
        #[cfg(feature = "tokio_serial")]
        {
            let stream = open_serial_async(port, baud_rate).await?;
            Ok(Box::new(stream))
        }

        #[cfg(not(feature = "tokio_serial"))]
        {
            let _ = (port, baud_rate);
            Err(GantryError::FeatureNotEnabled("tokio_serial".into()))
        }
    }
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns [`GantryError::Connection`] if the port cannot be opened or the
/// blocking task fails.
#[cfg(feature = "tokio_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                GantryError::Connection(format!(
                    "Failed to open serial port {} at {} baud: {}",
                    port_path_owned, baud_rate, e
                ))
            })
    })
    .await
    .map_err(|e| GantryError::Connection(format!("spawn_blocking for serial port opening failed: {}", e)))?
}

/// List serial port names available on this host.
///
/// # Errors
/// Returns [`GantryError::Connection`] if enumeration fails, or
/// [`GantryError::FeatureNotEnabled`] without the `tokio_serial` feature.
pub fn available_ports() -> AppResult<Vec<String>> {
    #[cfg(feature = "tokio_serial")]
    {
        let ports = tokio_serial::available_ports()
            .map_err(|e| GantryError::Connection(format!("Port enumeration failed: {}", e)))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    #[cfg(not(feature = "tokio_serial"))]
    {
        Err(GantryError::FeatureNotEnabled("tokio_serial".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_duplex_is_a_serial_port() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut port: DynSerial = Box::new(device);

        host.write_all(b"ok\r\n").await.unwrap();

        let mut buf = [0u8; 4];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok\r\n");
    }

    #[tokio::test]
    async fn test_missing_port_is_connection_error() {
        let result = SerialPortOpener
            .open("/dev/definitely-not-a-gantry", 115_200)
            .await;
        match result {
            Err(GantryError::Connection(msg)) => assert!(msg.contains("definitely-not-a-gantry")),
            Err(GantryError::FeatureNotEnabled(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("opening a missing port should fail"),
        }
    }
}
