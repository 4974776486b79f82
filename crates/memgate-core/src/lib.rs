pub mod balance;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod schema;

pub use balance::RoundRobin;
pub use breaker::{ceil_secs, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use error::{ConfigError, HandlerError};
pub use handler::*;
pub use schema::InputSchema;
