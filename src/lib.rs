pub mod client_config;
pub mod commands;
pub mod config;
pub mod doctor;
pub mod engine;
pub mod error;
pub mod fs_utils;
pub mod hint;
pub mod identities;
pub mod linkstore;
pub mod logging;
pub mod paths;
pub mod process;
pub mod registry;
pub mod roots;
pub mod state;
pub mod ui;

#[cfg(test)]
pub mod test_utils;
