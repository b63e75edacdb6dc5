pub mod auth;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod retry;
pub mod worker;
