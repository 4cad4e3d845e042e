pub mod auth;
pub mod config;
pub mod console;
pub mod instance;
pub mod path_detector;
pub mod supervisor;
pub mod utils;

pub use supervisor::{CommandReply, Supervisor, SupervisorError};
