pub mod netns;
pub mod net_device;

pub mod host;
pub mod netns_monitor;
pub mod shutdown;
pub mod supervisor;
