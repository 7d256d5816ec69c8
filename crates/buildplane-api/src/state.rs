//! Application state.

use buildplane_builds::BuildService;
use buildplane_db::Store;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub builds: BuildService,
}

impl AppState {
    pub fn new(builds: BuildService) -> Self {
        Self { builds }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.builds.store()
    }
}
