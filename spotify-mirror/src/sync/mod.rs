pub mod backoff;
pub mod detector;
pub mod engine;
pub mod model;
pub mod remote;
pub mod store;
