pub mod config;
pub mod dispatch;
pub mod error;
pub mod fragment;
pub mod gateway;
pub mod messages;
pub mod prompt;
pub mod ratelimit;
pub mod response;
pub mod server;
pub mod session;
pub mod templates;
