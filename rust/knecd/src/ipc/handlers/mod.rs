pub mod audit;
pub mod config;
pub mod core;
pub mod marks;
pub mod payments;
pub mod registry;
pub mod reports;
pub mod results;
pub mod schemes;
pub mod staff;
