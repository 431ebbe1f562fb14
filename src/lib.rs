pub mod config;
pub mod contract;
pub mod coordinator;
pub mod errors;
pub mod guard;
pub mod integrations;
pub mod logging;
pub mod pool;
pub mod remediation;
pub mod store;
pub mod util;
pub mod worker;
pub mod workspace;
