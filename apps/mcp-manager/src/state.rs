use std::sync::Arc;

use crate::manager::Manager;
use crate::session::Sessions;

#[derive(Clone)]
pub struct AppState {
    manager: Arc<Manager>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn sessions(&self) -> Arc<Sessions> {
        Arc::clone(self.manager.sessions())
    }
}
