pub mod config;
pub mod db;
pub mod dispatch;
pub mod lock;
pub mod model;
pub mod pool;
pub mod sending;
pub mod transport;
