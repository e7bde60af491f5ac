pub mod app_state;
pub mod config;
pub mod scan_tracker;
pub mod startup;
