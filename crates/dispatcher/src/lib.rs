pub mod dispatcher;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod test_utils;

pub use dispatcher::Dispatcher;
pub use queue::RunQueue;
pub use retry::{Admission, RetryQueue, RetryTicket};
pub use scheduler::Scheduler;
