//! Shared handler state

use outpost_core::Mailer;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub mailer: Arc<Mailer>,
}
