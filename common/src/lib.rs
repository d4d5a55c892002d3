pub mod constants;
pub mod models;
