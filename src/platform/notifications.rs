use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use log::{info, warn};
use tokio::task::JoinHandle;

use super::{NotificationAuthorization, NotificationRequest, Notifier};

/// Delivers notifications as log lines from a tokio task once they are due.
///
/// Terminal hosts have no notification center; the line is what the user sees.
#[derive(Clone, Default)]
pub struct TokioNotifier {
    pending: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TokioNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_pending(&self, id: &str) -> Option<JoinHandle<()>> {
        match self.pending.lock() {
            Ok(mut guard) => guard.remove(id),
            Err(poisoned) => poisoned.into_inner().remove(id),
        }
    }
}

impl Notifier for TokioNotifier {
    fn authorization(&self) -> NotificationAuthorization {
        NotificationAuthorization::Authorized
    }

    fn request_authorization(&self) -> bool {
        true
    }

    fn schedule(&self, request: NotificationRequest) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| anyhow!("notifications need a tokio runtime: {err}"))?;

        if let Some(previous) = self.take_pending(&request.id) {
            previous.abort();
        }

        let pending = self.pending.clone();
        let id = request.id.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(request.fire_after).await;
            info!("Notification {}: {} ({})", request.id, request.title, request.body);
            if let Ok(mut guard) = pending.lock() {
                guard.remove(&request.id);
            }
        });

        match self.pending.lock() {
            Ok(mut guard) => {
                guard.insert(id, handle);
            }
            Err(_) => warn!("Notification registry poisoned; {id} cannot be cancelled"),
        }
        Ok(())
    }

    fn cancel(&self, id: &str) {
        if let Some(handle) = self.take_pending(id) {
            handle.abort();
            info!("Cancelled pending notification {id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(after: Duration) -> NotificationRequest {
        NotificationRequest {
            id: "unlockTimer".into(),
            title: "Time's up!".into(),
            body: "Get off the toilet".into(),
            fire_after: after,
        }
    }

    #[tokio::test]
    async fn cancel_removes_pending_request() {
        let notifier = TokioNotifier::new();
        notifier.schedule(request(Duration::from_secs(60))).unwrap();
        assert!(notifier.pending.lock().unwrap().contains_key("unlockTimer"));

        notifier.cancel("unlockTimer");
        assert!(!notifier.pending.lock().unwrap().contains_key("unlockTimer"));
    }

    #[tokio::test]
    async fn delivered_request_clears_itself() {
        let notifier = TokioNotifier::new();
        notifier.schedule(request(Duration::from_millis(10))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(notifier.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn scheduling_outside_a_runtime_fails() {
        assert!(TokioNotifier::new().schedule(request(Duration::ZERO)).is_err());
    }
}
