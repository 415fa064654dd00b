pub mod list;
pub mod model;
pub mod persistence;
pub mod running;
pub mod schedule;
pub mod store;

pub use list::JobList;
pub use model::{Job, StartRequest};
pub use running::{JobState, RunningInfo};
pub use schedule::Schedule;
