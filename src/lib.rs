pub mod clock;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod model;
pub mod paraphrase;
pub mod progress;
pub mod scheduler;
pub mod sender;
pub mod store;
pub mod variation;
