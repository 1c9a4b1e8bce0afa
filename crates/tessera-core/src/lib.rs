pub mod client;
pub mod context;
pub mod definition;
pub mod errors;
pub mod events;
pub mod executor;
pub mod ids;
pub mod messages;
pub mod node;
pub mod result;
pub mod workspace;
