//! Kernel protocol: connection descriptor, wire format, channel attachment,
//! and the synchronous execution driver.

pub mod channels;
pub mod descriptor;
pub mod driver;
pub mod wire;

pub use channels::KernelChannels;
pub use descriptor::ConnectionDescriptor;
