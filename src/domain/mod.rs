pub mod errors;
pub mod models;
pub mod positioning;
pub mod registry;
pub mod retry;
pub mod session;
pub mod settings;
