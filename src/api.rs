pub mod auth;
pub mod deliveries;
pub mod sync;
pub mod triggers;
pub mod webhooks;
