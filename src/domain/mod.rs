pub mod address;
pub mod models;
pub mod registry;
pub mod settings;
pub mod vendor;
