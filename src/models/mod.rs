pub mod registration;
pub mod restriction;
pub mod window;

pub use registration::{MonitorEvent, MonitorRegistration};
pub use restriction::{
    enforcement_state, ApplicationToken, CategoryToken, EnforcementState, RestrictionSet,
    SelectionState,
};
pub use window::{
    remaining_secs, ActivityName, DeviceActivitySchedule, RelockMode, ResolvedInterval, TimeOfDay,
    UnlockWindow, DEFAULT_WARNING_LEAD, UNLOCK_ACTIVITY,
};
