pub mod config;
pub mod ids;
pub mod models;

pub use ids::new_id;
