use std::sync::Arc;

use crate::engine::chat_hub::ChatHub;

/// Shared state handed to every route.
pub struct AppState {
    pub hub: Arc<ChatHub>,
}
