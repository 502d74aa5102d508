#![deny(unsafe_op_in_unsafe_fn)]

pub mod device;
pub mod error;
pub mod supervisor;
pub mod sweep;
pub mod tool;

pub use device::{DeviceRegistry, ResourceEvent, ResourceManager};
pub use error::{CoreError, Result};
pub use supervisor::{run_to_completion, ProcessSpec, ProcessSupervisor, SupervisorError};
pub use sweep::{SweepManager, SweepSettings};
pub use tool::{load_definitions, SupervisedTool, ToolDefinition, ToolManager, ToolRegistry};
