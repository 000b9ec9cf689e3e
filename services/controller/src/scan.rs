//! Serial port discovery.
//!
//! Enumeration is behind a trait so the supervisor can be exercised without
//! hardware. The real implementation matches enumerated USB ports against
//! hardware-id filter strings of the form `VID:PID=16C0:0483`.

use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("port enumeration failed: {0}")]
    Enumeration(String),
}

/// Enumerates candidate device ports.
pub trait PortScanner: Send + Sync {
    /// Names of ports whose hardware id matches any of `hwids`.
    fn ports_matching(&self, hwids: &[String]) -> Result<Vec<String>, ScanError>;
}

/// `serialport`-backed scanner.
pub struct SerialPortScanner;

impl PortScanner for SerialPortScanner {
    fn ports_matching(&self, hwids: &[String]) -> Result<Vec<String>, ScanError> {
        let ports = serialport::available_ports()
            .map_err(|e| ScanError::Enumeration(e.to_string()))?;

        let mut matches = Vec::new();
        for port in ports {
            let serialport::SerialPortType::UsbPort(usb) = &port.port_type else {
                continue;
            };
            let hwid = format!("VID:PID={:04X}:{:04X}", usb.vid, usb.pid);
            if hwids.iter().any(|filter| hwid.contains(filter.as_str())) {
                debug!(port = %port.port_name, %hwid, "matched device port");
                matches.push(port.port_name);
            }
        }
        Ok(matches)
    }
}
