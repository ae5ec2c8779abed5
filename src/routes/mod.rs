pub mod companies;
pub mod company;
pub mod health;
pub mod metrics;
pub mod sync_errors;
