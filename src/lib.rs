pub mod config;
pub mod errors;
pub mod exec;
pub mod history;
pub mod process;
pub mod repo;
pub mod tools;
pub mod util;
