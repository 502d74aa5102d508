pub mod config;
pub mod hub;
pub mod manager;
pub mod parser;
pub mod probe;

pub use config::{validate, SweepPlan, SweepSettings};
pub use hub::{SubscriberHub, Subscription, SweepEvent};
pub use manager::SweepManager;
pub use parser::{parse_line, ParsedLine};
pub use probe::probe_hackrf;
