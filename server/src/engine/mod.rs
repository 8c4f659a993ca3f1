pub mod bandwidth;
pub mod chat_hub;
pub mod connection;
pub mod events;
pub mod ids;
pub mod message;
pub mod permissions;
pub mod rate_limiter;
pub mod room;
pub mod similarity;
pub mod tasks;
pub mod user;
pub mod validation;
