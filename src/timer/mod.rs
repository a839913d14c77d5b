pub mod controller;
pub mod state;

pub use controller::{CountdownController, CountdownEvent, CountdownSnapshot, NOTIFICATION_ID};
pub use state::{format_remaining, CountdownState, CountdownStatus, RelockMode};
