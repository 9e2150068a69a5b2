//! Serial port handling
//!
//! Opens physical ports through the `serialport` crate and enumerates the
//! ports present on the system.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::{
    is_transient, DataBits, FlowControl, Parity, PortSettings, StopBits, Transport,
    TransportError, TransportProvider,
};

/// Read timeout handed to the driver when the connection has none.
/// The I/O loop only reads what is already buffered, so this is never waited out.
const UNBOUNDED_READ_TIMEOUT: Duration = Duration::from_secs(3600);

/// Timeout handed to the driver, capped so long waits stay representable
fn driver_timeout(timeout: Option<Duration>) -> Duration {
    timeout.map_or(UNBOUNDED_READ_TIMEOUT, |t| t.min(UNBOUNDED_READ_TIMEOUT))
}

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port known only by name
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            serial_number: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let description = match (&usb.manufacturer, &usb.product) {
                    (Some(m), Some(p)) => format!("{} {}", m, p),
                    (None, Some(p)) => p.clone(),
                    (Some(m), None) => m.clone(),
                    (None, None) => format!("USB device {:04x}:{:04x}", usb.vid, usb.pid),
                };
                Self {
                    name: info.port_name,
                    description,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    serial_number: usb.serial_number,
                }
            }
            SerialPortType::BluetoothPort => Self {
                description: "Bluetooth serial port".to_string(),
                ..Self::named(info.port_name)
            },
            SerialPortType::PciPort => Self {
                description: "PCI serial port".to_string(),
                ..Self::named(info.port_name)
            },
            SerialPortType::Unknown => Self::named(info.port_name),
        }
    }
}

/// Sort key so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for info in ports {
                let p = PortInfo::from(info);
                map.entry(p.name.clone()).or_insert(p);
            }
        }
        Err(e) => tracing::debug!(error = %e, "serial port enumeration failed"),
    }

    // Linux: USB CDC/serial adapters the enumeration API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::named(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Opens physical serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialProvider;

impl TransportProvider for SerialProvider {
    fn open(&self, port: &str, settings: &PortSettings) -> Result<Box<dyn Transport>, TransportError> {
        let open_err = |e: serialport::Error| TransportError::Open {
            port: port.to_string(),
            reason: e.to_string(),
        };

        let mut handle = serialport::new(port, settings.baud_rate)
            .timeout(driver_timeout(settings.timeout))
            .data_bits(match settings.data_bits {
                DataBits::Five => serialport::DataBits::Five,
                DataBits::Six => serialport::DataBits::Six,
                DataBits::Seven => serialport::DataBits::Seven,
                DataBits::Eight => serialport::DataBits::Eight,
            })
            .parity(match settings.parity {
                Parity::None => serialport::Parity::None,
                Parity::Odd => serialport::Parity::Odd,
                Parity::Even => serialport::Parity::Even,
            })
            .stop_bits(match settings.stop_bits {
                StopBits::One => serialport::StopBits::One,
                StopBits::Two => serialport::StopBits::Two,
            })
            .flow_control(match settings.flow_control {
                FlowControl::None => serialport::FlowControl::None,
                FlowControl::Software => serialport::FlowControl::Software,
                FlowControl::Hardware => serialport::FlowControl::Hardware,
            })
            .open()
            .map_err(open_err)?;

        // Start from a clean line
        handle
            .clear(serialport::ClearBuffer::All)
            .map_err(open_err)?;

        tracing::debug!(port, baud = settings.baud_rate, "serial port opened");

        Ok(Box::new(SerialTransport {
            name: port.to_string(),
            baud_rate: settings.baud_rate,
            timeout: settings.timeout,
            port: Some(handle),
        }))
    }

    fn available_ports(&self) -> Vec<PortInfo> {
        list_ports()
    }
}

/// An open serial port
pub struct SerialTransport {
    name: String,
    baud_rate: u32,
    timeout: Option<Duration>,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

/// Write all of `data`.
///
/// A timeout before the first byte is passed through, since nothing reached
/// the wire. Once part of the payload is out a retry would repeat that part,
/// so a stall then is reported as a broken connection.
fn write_payload<W: Write + ?Sized>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match writer.write(&data[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "serial port accepted no data",
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if written > 0 && is_transient(&e) => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("write stalled after {written} of {} bytes: {e}", data.len()),
                ))
            }
            Err(e) => return Err(e),
        }
    }

    match writer.flush() {
        // Every byte is already with the driver
        Err(e) if is_transient(&e) => {
            tracing::trace!(error = %e, "serial flush did not complete");
            Ok(())
        }
        other => other,
    }
}

fn to_io(e: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        write_payload(self.port()?, data)
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let port = self.port()?;
        let available = port.bytes_to_read().map_err(to_io)? as usize;
        if available == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; available];
        let mut filled = 0;
        while filled < available {
            match port.read(&mut buffer[filled..]) {
                // A device that reports data but returns none has gone away
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port returned no data",
                    ))
                }
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e),
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            tracing::debug!(port = %self.name, "serial port closed");
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.port()?
            .set_timeout(driver_timeout(timeout))
            .map_err(to_io)?;
        self.timeout = timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_list_ports() {
        // Only checks enumeration does not panic on this host
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} - {}", port.name, port.description);
        }
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut ports: Vec<PortInfo> = names.into_iter().map(PortInfo::named).collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    /// Accepts `accept` bytes, then times out on every write
    struct StallingWriter {
        accept: usize,
        out: Vec<u8>,
    }

    impl Write for StallingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.accept - self.out.len();
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "tx buffer full"));
            }
            let n = room.min(buf.len()).min(3);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_payload_in_chunks() {
        let mut w = StallingWriter { accept: 64, out: Vec::new() };
        write_payload(&mut w, b"HELLO WORLD\r\n").unwrap();
        assert_eq!(w.out, b"HELLO WORLD\r\n".to_vec());
    }

    #[test]
    fn test_timeout_before_any_byte_is_transient() {
        let mut w = StallingWriter { accept: 0, out: Vec::new() };
        let err = write_payload(&mut w, b"PING").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(is_transient(&err));
    }

    #[test]
    fn test_stall_after_partial_write_is_fatal() {
        let mut w = StallingWriter { accept: 5, out: Vec::new() };
        let err = write_payload(&mut w, b"0123456789").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(!is_transient(&err));
        assert_eq!(w.out, b"01234".to_vec());
    }

    #[test]
    fn test_driver_timeout_is_capped() {
        assert_eq!(driver_timeout(None), UNBOUNDED_READ_TIMEOUT);
        assert_eq!(driver_timeout(Some(Duration::MAX)), UNBOUNDED_READ_TIMEOUT);
        assert_eq!(
            driver_timeout(Some(Duration::from_millis(250))),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_open_missing_port_fails() {
        let err = SerialProvider
            .open("/dev/comserve-does-not-exist", &PortSettings::default())
            .err()
            .expect("opening a missing device must fail");
        assert!(matches!(err, TransportError::Open { .. }));
    }
}
