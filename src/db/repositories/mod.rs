pub mod defaults;
pub mod registrations;
pub mod shield;
pub mod unlock_windows;

pub use unlock_windows::unlock_end_key;
