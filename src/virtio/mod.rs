//! The virtio layer: guest memory, split virtqueues, and the transport
//! contract between the driver and a device implementation.

mod ram;
mod ring;


pub use ram::{GuestRam, PhysAddr, PAGE};
pub use ring::{service_interrupt, Virtqueue, MAX_RING};

use tracing::debug;

/// The "version 1 spec" feature bit. Initialisation fails without it.
pub const FEATURE_VERSION_1: u32 = 32;

/// virtio-9p: the device config area carries a mount tag.
pub const FEATURE_MOUNT_TAG: u32 = 0;

/// What the driver needs from the hardware-facing side of a virtio
/// device: feature negotiation, queue configuration, the doorbell, and
/// interrupt rearming. Implemented by the in-process loopback device
/// here, and by whatever owns the real registers elsewhere.
pub trait Transport: Send {
    /// Does the device offer this feature bit?
    fn get_device_feature(&mut self, bit: u32) -> bool;

    /// Accept or decline a feature bit.
    fn set_driver_feature(&mut self, bit: u32, on: bool);

    /// Commit the negotiated feature set. False means the device
    /// rejected the combination.
    fn features_ok(&mut self) -> bool;

    /// Declare the driver ready; queues may be touched after this.
    fn driver_ok(&mut self);

    /// Write the "device failed" status. The device is dead to us.
    fn fail(&mut self);

    /// Re-enable interrupt delivery after an interrupt was serviced.
    fn rearm(&mut self);

    /// Largest ring the device supports for queue `q` (0 = no queue).
    fn queue_max_size(&mut self, q: u16) -> u16;

    /// Tell the device where queue `q`'s three rings live.
    fn queue_set(&mut self, q: u16, size: u16, desc: PhysAddr, avail: PhysAddr, used: PhysAddr);

    /// The doorbell: new buffers are available on queue `q`.
    fn notify(&mut self, q: u16);

    /// A copy of the device-specific config area.
    fn config(&mut self) -> Vec<u8>;
}

/// Transport bring-up failure; the device refused initialisation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceFailed;

/// Run the init handshake: check the mandatory VERSION_1 bit, request
/// the mount tag if offered, and commit. On any refusal the failed
/// status is written and the driver must not go further.
pub fn negotiate(transport: &mut dyn Transport) -> Result<(), DeviceFailed> {
    if !transport.get_device_feature(FEATURE_VERSION_1) {
        debug!("device does not speak the version 1 spec");
        transport.fail();
        return Err(DeviceFailed);
    }
    transport.set_driver_feature(FEATURE_VERSION_1, true);

    if transport.get_device_feature(FEATURE_MOUNT_TAG) {
        transport.set_driver_feature(FEATURE_MOUNT_TAG, true);
    }

    if !transport.features_ok() {
        debug!("feature negotiation failure");
        transport.fail();
        return Err(DeviceFailed);
    }

    transport.driver_ok();
    Ok(())
}
