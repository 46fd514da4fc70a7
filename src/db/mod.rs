pub mod delivery;
pub mod message;
pub mod webhook;
