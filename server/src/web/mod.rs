pub mod app_state;
pub mod chat_socket;
pub mod rate_limit;
pub mod router;
