pub mod identifier;
pub mod models;
pub mod settings;
