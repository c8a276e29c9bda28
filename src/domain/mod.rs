pub mod models;
pub mod pins;
pub mod settings;
