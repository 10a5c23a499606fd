pub mod executor;
pub mod router;

pub use executor::{ExecutorConfig, TaskExecutor, TaskStatusReport};
pub use router::{error_chain, TaskError, TaskRouter};
