use std::time::Duration;

use crate::error::UnlockRequestError;
use crate::models::RestrictionSet;
use crate::platform::{AuthorizationCenter, AuthorizationStatus};
use crate::restrictions::RestrictionStore;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Schedule components wrap at midnight, so a window must end within a day.
pub const MAX_UNLOCK_MINUTES: u32 = 24 * 60 - 1;

/// A request that passed every gate and may be handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedUnlock {
    pub duration: Duration,
    pub restrictions: RestrictionSet,
}

/// Gate an unlock request: screen-time authorization first, then a non-empty
/// selection. Nothing is scheduled when this fails.
pub async fn confirm_unlock(
    authorization: &dyn AuthorizationCenter,
    store: &RestrictionStore,
    duration_minutes: u32,
) -> Result<ConfirmedUnlock, UnlockRequestError> {
    if duration_minutes == 0 || duration_minutes > MAX_UNLOCK_MINUTES {
        return Err(UnlockRequestError::InvalidDuration);
    }

    if authorization.status() != AuthorizationStatus::Approved {
        if let Err(err) = authorization.request() {
            log_warn!("Screen time authorization refused: {err:#}");
            return Err(UnlockRequestError::AuthorizationDenied);
        }
    }

    let restrictions = store.load().await;
    if restrictions.is_empty() {
        log_warn!("Unlock requested with nothing selected");
        return Err(UnlockRequestError::NoSelection);
    }

    log_info!(
        "Unlock of {duration_minutes} min confirmed over {} apps, {} categories",
        restrictions.applications.len(),
        restrictions.categories.len()
    );
    Ok(ConfirmedUnlock {
        duration: Duration::from_secs(u64::from(duration_minutes) * 60),
        restrictions,
    })
}
