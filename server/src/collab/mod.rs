//! Contracts for the collaborators the chat core consumes but doesn't own.

pub mod localization;
pub mod modules;
pub mod profile;
