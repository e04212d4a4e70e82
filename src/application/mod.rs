// Application layer - Data sources, their manager and the host platform seam
pub mod data_source;
pub mod data_source_manager;
pub mod host_platform;
pub mod listeners;
