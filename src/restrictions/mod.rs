pub mod enforcer;
pub mod selection;
pub mod store;

pub use enforcer::Enforcer;
pub use selection::{SelectionFlow, SelectionOutcome};
pub use store::{RestrictionStore, RESTRICTION_SET_KEY};
