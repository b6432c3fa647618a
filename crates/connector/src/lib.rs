pub mod health;
pub mod pool;
pub mod protocol;
pub mod session;
mod tls;

pub use health::{HealthChecker, TcpProbe};
pub use pool::ConnectionPool;
pub use session::{ApiSession, ApiSessionFactory};
