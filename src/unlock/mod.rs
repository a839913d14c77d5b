pub mod dispatcher;
pub mod monitor;
pub mod request;
pub mod scheduler;

pub use dispatcher::{Delivery, MonitorDispatcher};
pub use monitor::{MonitorAction, MonitorHandler};
pub use request::{confirm_unlock, ConfirmedUnlock, MAX_UNLOCK_MINUTES};
pub use scheduler::{SchedulerEvent, SchedulerTimings, UnlockPath, UnlockScheduler, UnlockTicket};
