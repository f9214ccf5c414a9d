pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod range;
pub mod routes;
pub mod scheduler;
pub mod task_queue;
pub mod worker_node;
