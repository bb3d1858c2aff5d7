pub mod bluetooth;
pub mod logging;
pub mod ranging;
pub mod simulator;
