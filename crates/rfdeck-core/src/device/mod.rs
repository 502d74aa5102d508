mod registry;
mod resource;

pub use registry::DeviceRegistry;
pub use resource::{ResourceEvent, ResourceManager};
