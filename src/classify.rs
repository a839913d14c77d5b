//! The capture gate in front of an unlock: a photo has to show a toilet.
//!
//! The vision model itself sits behind [`VisionClassifier`]; the core only
//! consumes the yes/no verdict.

use std::{future::Future, time::Duration};

use crate::error::ClassificationError;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const TOILET_PROMPT: &str = "Does this image show a toilet? Respond with just yes or no.";

/// A model that answers a text prompt about an image.
pub trait VisionClassifier: Send + Sync {
    fn classify(
        &self,
        image: &[u8],
        prompt: &str,
    ) -> impl Future<Output = anyhow::Result<String>> + Send;
}

/// Loose reading of the model's answer. Models pad, capitalise and explain,
/// so any mention of "yes" or "toilet" counts.
pub fn parse_verdict(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    lower.contains("yes") || lower.contains("toilet")
}

pub struct ClassificationGate<C> {
    classifier: C,
    timeout: Duration,
}

impl<C: VisionClassifier> ClassificationGate<C> {
    pub fn new(classifier: C, timeout: Duration) -> Self {
        Self {
            classifier,
            timeout,
        }
    }

    /// `Ok(false)` means the model saw no toilet. A slow or failed request is
    /// an error so the caller can offer a retry instead of waiting forever.
    pub async fn confirm(&self, image: &[u8]) -> Result<bool, ClassificationError> {
        let answer = tokio::time::timeout(self.timeout, self.classifier.classify(image, TOILET_PROMPT))
            .await
            .map_err(|_| {
                log_warn!("Classification timed out after {:?}", self.timeout);
                ClassificationError::TimedOut(self.timeout)
            })?
            .map_err(ClassificationError::Failed)?;

        let confirmed = parse_verdict(&answer);
        log_info!("Classifier answered {:?}; confirmed={confirmed}", answer.trim());
        Ok(confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    enum Fake {
        Answer(&'static str),
        Slow,
        Broken,
    }

    impl VisionClassifier for Fake {
        async fn classify(&self, _image: &[u8], prompt: &str) -> anyhow::Result<String> {
            assert_eq!(prompt, TOILET_PROMPT);
            match self {
                Fake::Answer(text) => Ok(text.to_string()),
                Fake::Slow => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok("yes".into())
                }
                Fake::Broken => Err(anyhow!("connection reset")),
            }
        }
    }

    #[test]
    fn verdict_is_lenient() {
        assert!(parse_verdict("Yes."));
        assert!(parse_verdict("That is a toilet"));
        assert!(!parse_verdict("No"));
        assert!(!parse_verdict("It's a sink"));
    }

    #[tokio::test]
    async fn answers_map_to_a_boolean() {
        let gate = ClassificationGate::new(Fake::Answer("YES"), Duration::from_secs(1));
        assert!(gate.confirm(b"jpeg").await.unwrap());

        let gate = ClassificationGate::new(Fake::Answer("no"), Duration::from_secs(1));
        assert!(!gate.confirm(b"jpeg").await.unwrap());
    }

    #[tokio::test]
    async fn slow_classifier_times_out() {
        let gate = ClassificationGate::new(Fake::Slow, Duration::from_millis(50));
        let err = gate.confirm(b"jpeg").await.unwrap_err();
        assert!(matches!(err, ClassificationError::TimedOut(d) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn request_failure_is_reported() {
        let gate = ClassificationGate::new(Fake::Broken, Duration::from_secs(1));
        assert!(matches!(
            gate.confirm(b"jpeg").await.unwrap_err(),
            ClassificationError::Failed(_)
        ));
    }
}
