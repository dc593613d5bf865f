pub mod fire;
pub mod lifecycle;
pub mod model;
pub mod scheduler;
pub mod time_set;
