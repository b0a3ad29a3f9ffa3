//! USB bulk/control transport adapter.
//!
//! Wraps `rusb` behind the narrow surface the rest of the crate needs:
//! claim an interface, push bytes out a bulk endpoint, pull bytes in from
//! one, and issue the single control transfer used to detach a
//! non-ST-Link probe out of application mode. Every transfer uses the
//! fixed 5-second timeout the adapter's bootloader expects.

use std::time::Duration;

use log::{debug, trace};
use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::error::Error;

/// Timeout applied to every bulk and control transfer.
pub const USB_TIMEOUT: Duration = Duration::from_millis(5000);

/// An open handle to a candidate adapter, with its bulk endpoints and
/// claimed interface.
pub struct Transport {
    handle: DeviceHandle<Context>,
    interface: u8,
    ep_in: u8,
    ep_out: u8,
}

impl Transport {
    /// Opens `device`, claims `interface`, and records the bulk endpoint
    /// pair the caller already determined from the product ID (see
    /// [`crate::probe`]).
    pub fn open(device: &Device<Context>, interface: u8, ep_in: u8, ep_out: u8) -> Result<Self, Error> {
        let mut handle = device.open()?;

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(interface).unwrap_or(false) {
                let _ = handle.detach_kernel_driver(interface);
            }
        }

        handle.claim_interface(interface)?;

        Ok(Self {
            handle,
            interface,
            ep_in,
            ep_out,
        })
    }

    /// Writes `data` to the bulk OUT endpoint.
    pub fn bulk_out(&self, data: &[u8]) -> Result<usize, Error> {
        trace!("bulk_out({} bytes) -> ep 0x{:02x}", data.len(), self.ep_out);
        Ok(self.handle.write_bulk(self.ep_out, data, USB_TIMEOUT)?)
    }

    /// Reads up to `len` bytes from the bulk IN endpoint.
    pub fn bulk_in(&self, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        let n = self.handle.read_bulk(self.ep_in, &mut buf, USB_TIMEOUT)?;
        buf.truncate(n);
        trace!("bulk_in({} requested) <- {} bytes", len, n);
        Ok(buf)
    }

    /// Issues a class-specific control transfer on `interface`, used only
    /// for the `DFU_DETACH` hop against a non-ST-Link probe (see
    /// [`crate::probe`]).
    pub fn control_out(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize, Error> {
        const USB_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;
        debug!(
            "control_out(request=0x{:02x}, value=0x{:04x}, index=0x{:04x})",
            request, value, index
        );
        Ok(self
            .handle
            .write_control(USB_TYPE_CLASS_INTERFACE_OUT, request, value, index, data, USB_TIMEOUT)?)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface);
    }
}

/// Opens a fresh `rusb` context. Callers hold this for the lifetime of the
/// process; it owns no devices itself.
pub fn context() -> Result<Context, Error> {
    Ok(Context::new()?)
}

/// A bare descriptor of an enumerated device, before it has been opened.
pub struct Candidate {
    pub device: Device<Context>,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Lists every USB device visible to `ctx`, skipping any whose descriptor
/// can't be read.
pub fn enumerate(ctx: &Context) -> Result<Vec<Candidate>, Error> {
    let mut out = Vec::new();
    for device in ctx.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        out.push(Candidate {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            device,
        });
    }
    Ok(out)
}
