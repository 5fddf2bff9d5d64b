pub mod config;
pub mod dataplane;
pub mod memory;
pub mod proto;
pub mod session;
pub mod stats;
pub mod test_util;
pub mod tsc;
