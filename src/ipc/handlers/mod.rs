pub mod attendance;
pub mod auth;
pub mod backup;
pub mod core;
pub mod maintenance;
pub mod students;
