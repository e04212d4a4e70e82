// Infrastructure layer - External dependencies and adapters
pub mod chunked_json;
pub mod config;
pub mod home_assistant;
pub mod http_response;
#[cfg(test)]
pub mod in_memory_platform;
