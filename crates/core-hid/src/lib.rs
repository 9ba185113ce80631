//! HID report interpreter: digests a report descriptor into a field table,
//! then decodes each incoming input report into high-level events.
//!
//! The transport hands over two things per device: the raw report descriptor
//! (once, at connect) and raw report bytes (per interrupt transfer). This
//! crate turns the former into a [`Device`] and the latter into key, mouse
//! and joystick events pushed into the caller-supplied sink.
//!
//! Only INPUT items are interpreted; output and feature reports are ignored.
//! The device table is immutable after construction, and `parse_report` is
//! called from a single thread per device.

mod device;
mod fields;
mod items;
#[cfg(test)]
mod testdesc;
pub mod usages;

pub use device::Device;
pub use fields::FieldKind;
pub use items::{DescriptorError, ItemFlags};
