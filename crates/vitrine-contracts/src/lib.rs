pub mod chat;
pub mod data_uri;
pub mod error;
pub mod events;
pub mod model;
pub mod models;
pub mod prompt;
pub mod response;
pub mod session;
