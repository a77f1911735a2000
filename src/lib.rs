pub mod api;
pub mod classify;
pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod events;
pub mod job;
pub mod listing;
pub mod merge;
pub mod page;
pub mod planner;
pub mod progress;
pub mod proxy;
pub mod robots;
pub mod worker;
