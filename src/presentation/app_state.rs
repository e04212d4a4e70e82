// Application state for HTTP handlers
use crate::application::data_source_manager::DataSourceManager;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DataSourceManager>,
}
