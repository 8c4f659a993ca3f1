pub mod listener;
pub mod token;
