pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod gateway;
pub mod queue;
pub mod resilience;
