pub mod config;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod expression;
pub mod filter;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod runner;
pub mod scheduler;
pub mod series;
pub mod state;
pub mod storage;
pub mod util;

pub use error::{AlarmError, AlarmResult};
pub use model::{Alarm, AlarmEvent, AlarmHistory, NewAlarm, Output, OutputChannel};
pub use runner::{AlarmRunner, RunOutcome, RunSummary};
pub use scheduler::AlarmScheduler;
