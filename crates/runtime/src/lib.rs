mod router;
mod task_tools;

pub use router::{Router, RouterError};
