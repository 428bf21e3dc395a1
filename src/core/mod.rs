pub mod config;
pub mod confirm;
pub mod events;
pub mod graph;
pub mod llm;
pub mod pipeline;
pub mod store;
pub mod terminal;
