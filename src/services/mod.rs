//! The five fixed auxiliary services exposed to a stage's sandbox as host
//! bridge RPC endpoints: store, remoteloop, input, device, mount.

pub mod device;
pub mod input;
pub mod loopback;
pub mod mount;
pub mod store_service;

pub use device::{DeviceService, DeviceSpec, OpenDevice};
pub use input::InputService;
pub use loopback::LoopbackService;
pub use mount::{MountService, MountSpec};
pub use store_service::StoreService;
