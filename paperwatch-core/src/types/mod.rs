pub mod ids;

pub use ids::{ContentHash, JobId};
