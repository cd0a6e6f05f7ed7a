use std::fmt;
use std::io;

use tracing::{debug, trace};

/// Address of the target device on the bus. Fixed for the lifetime of a
/// transport unless explicitly changed through [`BusTransport::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusAddress(pub u16);

impl BusAddress {
    /// BME680 with SDO pulled low
    pub const PRIMARY: Self = Self(0x76);
    /// BME680 with SDO pulled high
    pub const SECONDARY: Self = Self(0x77);
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Write,
    Read,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Write => f.write_str("write"),
            Phase::Read => f.write_str("read"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error(
        "Bus {phase} for register {register:#04x} transferred \
        {transferred} out of {expected} bytes"
    )]
    TransferIncomplete {
        register: u8,
        phase: Phase,
        expected: usize,
        transferred: usize,
        #[source]
        source: Option<io::Error>,
    },
    #[error("Could not claim the bus for device {address}: {reason}")]
    DeviceUnavailable { address: BusAddress, reason: String },
}

/// Addressed register access to one device. Every call is exactly one
/// physical transaction sequence, nothing is buffered across calls.
pub trait BusTransport {
    fn address(&self) -> BusAddress;
    /// Point all following transactions at another device without
    /// reopening the bus.
    fn select(&mut self, address: BusAddress) -> Result<(), BusError>;
    /// Writes `[register] ++ payload` as a single transaction.
    fn write(&mut self, register: u8, payload: &[u8]) -> Result<(), BusError>;
    /// Writes `[register]` then reads `len` bytes.
    fn read(&mut self, register: u8, len: usize) -> Result<Vec<u8>, BusError>;
}

impl<T: BusTransport + ?Sized> BusTransport for &mut T {
    fn address(&self) -> BusAddress {
        (**self).address()
    }
    fn select(&mut self, address: BusAddress) -> Result<(), BusError> {
        (**self).select(address)
    }
    fn write(&mut self, register: u8, payload: &[u8]) -> Result<(), BusError> {
        (**self).write(register, payload)
    }
    fn read(&mut self, register: u8, len: usize) -> Result<Vec<u8>, BusError> {
        (**self).read(register, len)
    }
}

/// A byte oriented device file that reports how many bytes each transfer
/// moved. `/dev/i2c-N` behaves like this once a slave address is set.
pub trait ByteDevice: io::Read + io::Write {
    type AddressError: fmt::Display;

    fn set_address(&mut self, address: BusAddress) -> Result<(), Self::AddressError>;
}

/// Frames register transactions on top of a [`ByteDevice`].
#[derive(Debug)]
pub struct FramedBus<D> {
    device: D,
    address: BusAddress,
}

impl<D: ByteDevice> FramedBus<D> {
    /// `device` must already be bound to `address`.
    pub fn new(device: D, address: BusAddress) -> Self {
        Self { device, address }
    }

    fn transfer_out(&mut self, register: u8, frame: &[u8]) -> Result<(), BusError> {
        match self.device.write(frame) {
            Ok(n) if n == frame.len() => Ok(()),
            Ok(transferred) => Err(BusError::TransferIncomplete {
                register,
                phase: Phase::Write,
                expected: frame.len(),
                transferred,
                source: None,
            }),
            Err(source) => Err(BusError::TransferIncomplete {
                register,
                phase: Phase::Write,
                expected: frame.len(),
                transferred: 0,
                source: Some(source),
            }),
        }
    }
}

impl<D: ByteDevice> BusTransport for FramedBus<D> {
    fn address(&self) -> BusAddress {
        self.address
    }

    fn select(&mut self, address: BusAddress) -> Result<(), BusError> {
        self.device
            .set_address(address)
            .map_err(|e| BusError::DeviceUnavailable {
                address,
                reason: e.to_string(),
            })?;
        debug!("bus now addressing device {address}");
        self.address = address;
        Ok(())
    }

    fn write(&mut self, register: u8, payload: &[u8]) -> Result<(), BusError> {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(register);
        frame.extend_from_slice(payload);
        trace!("write {register:#04x}: {payload:02x?}");
        self.transfer_out(register, &frame)
    }

    fn read(&mut self, register: u8, len: usize) -> Result<Vec<u8>, BusError> {
        self.transfer_out(register, &[register])?;

        let mut buf = vec![0u8; len];
        match self.device.read(&mut buf) {
            Ok(n) if n == len => {
                trace!("read {register:#04x}: {buf:02x?}");
                Ok(buf)
            }
            Ok(transferred) => Err(BusError::TransferIncomplete {
                register,
                phase: Phase::Read,
                expected: len,
                transferred,
                source: None,
            }),
            Err(source) => Err(BusError::TransferIncomplete {
                register,
                phase: Phase::Read,
                expected: len,
                transferred: 0,
                source: Some(source),
            }),
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::{I2cBus, I2cDevice};

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::path::Path;

    use i2cdev::core::I2CDevice;
    use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};
    use tracing::info;

    use super::{BusAddress, BusError, ByteDevice, FramedBus};

    pub type I2cBus = FramedBus<I2cDevice>;

    /// An open `/dev/i2c-N` bound to one slave address. The kernel either
    /// moves the whole message or fails it, so a successful transfer
    /// always reports the full length.
    #[derive(Debug)]
    pub struct I2cDevice(LinuxI2CDevice);

    impl io::Write for I2cDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            I2CDevice::write(&mut self.0, buf).map_err(io::Error::from)?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl io::Read for I2cDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            I2CDevice::read(&mut self.0, buf).map_err(io::Error::from)?;
            Ok(buf.len())
        }
    }

    impl ByteDevice for I2cDevice {
        type AddressError = LinuxI2CError;

        fn set_address(&mut self, address: BusAddress) -> Result<(), Self::AddressError> {
            self.0.set_slave_address(address.0)
        }
    }

    impl FramedBus<I2cDevice> {
        /// Opens the i2c character device (for example `/dev/i2c-1`)
        /// and binds it to `address`. Dropping the bus closes it.
        pub fn open(path: impl AsRef<Path>, address: BusAddress) -> Result<Self, BusError> {
            let path = path.as_ref();
            let device = LinuxI2CDevice::new(path, address.0).map_err(|e| {
                BusError::DeviceUnavailable {
                    address,
                    reason: format!("could not open {}: {e}", path.display()),
                }
            })?;
            info!("opened {} for device {address}", path.display());
            Ok(Self::new(I2cDevice(device), address))
        }
    }

}
