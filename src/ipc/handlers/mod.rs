pub mod core;
pub mod counters;
pub mod marks;
pub mod reports;
pub mod setup;
pub mod students;
