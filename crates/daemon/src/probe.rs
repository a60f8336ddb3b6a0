//! Liveness probing for a single channel.
//!
//! Transport outcomes are mapped onto [`LivenessResult`] by [`classify`], which is
//! total: every response or transport failure lands in exactly one variant.

use crate::token::{Credential, TokenManager};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Classification of one liveness query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessResult {
    /// Channel is streaming
    Online { title: String },
    /// Channel exists but is not streaming
    Offline,
    /// Channel name is unknown to the API
    NotFound,
    /// Credential was rejected
    Unauthorized,
    /// Anything else; retried on the next cycle
    TransientError(String),
}

impl LivenessResult {
    pub fn as_str(&self) -> &str {
        match self {
            LivenessResult::Online { .. } => "online",
            LivenessResult::Offline => "offline",
            LivenessResult::NotFound => "not_found",
            LivenessResult::Unauthorized => "unauthorized",
            LivenessResult::TransientError(_) => "transient_error",
        }
    }
}

/// What came back from the wire, before interpretation
#[derive(Debug, Clone, PartialEq)]
pub enum HttpOutcome {
    Response { status: u16, body: String },
    ConnectionFailed(String),
}

mod helix_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct StreamsResponse {
        pub data: Vec<Stream>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        #[serde(default)]
        pub title: Option<String>,
    }
}

/// Map a transport outcome onto a liveness result.
pub fn classify(outcome: &HttpOutcome) -> LivenessResult {
    match outcome {
        HttpOutcome::ConnectionFailed(reason) => LivenessResult::TransientError(reason.clone()),
        HttpOutcome::Response { status: 401, .. } => LivenessResult::Unauthorized,
        HttpOutcome::Response { status: 404, .. } => LivenessResult::NotFound,
        HttpOutcome::Response { status, body } if (200..300).contains(status) => {
            match serde_json::from_str::<helix_json::StreamsResponse>(body) {
                Ok(parsed) => match parsed.data.into_iter().next() {
                    Some(stream) => LivenessResult::Online {
                        title: stream.title.unwrap_or_default(),
                    },
                    None => LivenessResult::Offline,
                },
                Err(e) => LivenessResult::TransientError(format!("malformed body: {}", e)),
            }
        }
        HttpOutcome::Response { status, .. } => {
            LivenessResult::TransientError(format!("unexpected status {}", status))
        }
    }
}

/// One liveness query for one channel
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self, channel: &str, credential: &Credential) -> LivenessResult;
}

/// Queries the Helix streams endpoint
pub struct HelixProbe {
    client: reqwest::Client,
    streams_url: String,
    client_id: String,
}

impl HelixProbe {
    pub fn new(
        client: reqwest::Client,
        streams_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            streams_url: streams_url.into(),
            client_id: client_id.into(),
        }
    }

    async fn query(&self, channel: &str, credential: &Credential) -> HttpOutcome {
        let response = self
            .client
            .get(&self.streams_url)
            .query(&[("user_login", channel)])
            .header("Client-ID", self.client_id.as_str())
            .bearer_auth(&credential.token)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(body) => HttpOutcome::Response { status, body },
                    Err(e) => HttpOutcome::ConnectionFailed(e.to_string()),
                }
            }
            Err(e) => match e.status() {
                Some(status) => HttpOutcome::Response {
                    status: status.as_u16(),
                    body: String::new(),
                },
                None => HttpOutcome::ConnectionFailed(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl StatusProbe for HelixProbe {
    async fn probe(&self, channel: &str, credential: &Credential) -> LivenessResult {
        let outcome = self.query(channel, credential).await;
        debug!(channel, ?outcome, "Liveness query finished");
        classify(&outcome)
    }
}

/// Probe a channel with token handling.
///
/// An `Unauthorized` answer forces a token refresh and retries once; if the
/// retry is still unauthorized it is reported as `TransientError`. A transient
/// failure drops the cached token so the next cycle starts with a new one.
pub async fn probe_channel(
    prober: &dyn StatusProbe,
    tokens: &TokenManager,
    channel: &str,
) -> LivenessResult {
    let credential = match tokens.ensure_valid_token().await {
        Ok(credential) => credential,
        Err(e) => return LivenessResult::TransientError(format!("no access token: {}", e)),
    };

    match prober.probe(channel, &credential).await {
        LivenessResult::Unauthorized => {
            warn!(channel, "Unauthorized, refreshing access token");
            let refreshed = match tokens.force_refresh(&credential).await {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    return LivenessResult::TransientError(format!("token refresh failed: {}", e))
                }
            };
            match prober.probe(channel, &refreshed).await {
                LivenessResult::Unauthorized => LivenessResult::TransientError(
                    "still unauthorized after token refresh".to_string(),
                ),
                other => other,
            }
        }
        LivenessResult::TransientError(reason) => {
            tokens.invalidate().await;
            LivenessResult::TransientError(reason)
        }
        other => other,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedProbe;
    use super::*;
    use crate::token::test_support::CountingFetcher;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn response(status: u16, body: &str) -> HttpOutcome {
        HttpOutcome::Response {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_classify_populated_body_is_online() {
        let body = r#"{"data":[{"user_login":"alice","title":"Test Stream"}],"pagination":{}}"#;
        assert_eq!(
            classify(&response(200, body)),
            LivenessResult::Online {
                title: "Test Stream".to_string()
            }
        );
    }

    #[test]
    fn test_classify_empty_body_is_offline() {
        assert_eq!(
            classify(&response(200, r#"{"data":[],"pagination":{}}"#)),
            LivenessResult::Offline
        );
    }

    #[test]
    fn test_classify_status_codes() {
        assert_eq!(classify(&response(401, "")), LivenessResult::Unauthorized);
        assert_eq!(classify(&response(404, "")), LivenessResult::NotFound);
        assert!(matches!(
            classify(&response(503, "")),
            LivenessResult::TransientError(_)
        ));
        assert!(matches!(
            classify(&response(200, "<html>")),
            LivenessResult::TransientError(_)
        ));
    }

    #[test]
    fn test_classify_connection_error() {
        assert_eq!(
            classify(&HttpOutcome::ConnectionFailed("refused".to_string())),
            LivenessResult::TransientError("refused".to_string())
        );
    }

    // Property: classification is total and agrees with the status code family.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_classification_is_total(status in 100u16..600, body in ".{0,64}") {
            let result = classify(&response(status, &body));
            match status {
                401 => prop_assert_eq!(result, LivenessResult::Unauthorized),
                404 => prop_assert_eq!(result, LivenessResult::NotFound),
                200..=299 => prop_assert!(
                    matches!(
                        result,
                        LivenessResult::Online { .. }
                            | LivenessResult::Offline
                            | LivenessResult::TransientError(_)
                    ),
                    "status {} classified as {:?}",
                    status,
                    result
                ),
                _ => prop_assert!(
                    matches!(result, LivenessResult::TransientError(_)),
                    "status {} classified as {:?}",
                    status,
                    result
                ),
            }
        }
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_and_retries_once() {
        let fetcher = Arc::new(CountingFetcher::new(Some(3600)));
        let tokens = TokenManager::new(fetcher.clone());
        let prober = ScriptedProbe::new().script(
            "alice",
            vec![
                LivenessResult::Unauthorized,
                LivenessResult::Online {
                    title: "Test Stream".to_string(),
                },
            ],
        );

        let result = probe_channel(&prober, &tokens, "alice").await;

        assert_eq!(
            result,
            LivenessResult::Online {
                title: "Test Stream".to_string()
            }
        );
        assert_eq!(fetcher.calls(), 2);
        let seen = prober.seen_tokens.lock().unwrap().clone();
        assert_eq!(seen, vec!["token-1".to_string(), "token-2".to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_unauthorized_surfaces_as_transient() {
        let fetcher = Arc::new(CountingFetcher::new(Some(3600)));
        let tokens = TokenManager::new(fetcher.clone());
        let prober = ScriptedProbe::new().script("alice", vec![LivenessResult::Unauthorized]);

        let result = probe_channel(&prober, &tokens, "alice").await;

        assert!(matches!(result, LivenessResult::TransientError(_)));
        assert_eq!(prober.seen_tokens.lock().unwrap().len(), 2);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_error_is_not_retried() {
        let fetcher = Arc::new(CountingFetcher::new(Some(3600)));
        let tokens = TokenManager::new(fetcher.clone());
        let prober = ScriptedProbe::new().script(
            "alice",
            vec![LivenessResult::TransientError("timeout".to_string())],
        );

        let result = probe_channel(&prober, &tokens, "alice").await;

        assert_eq!(result, LivenessResult::TransientError("timeout".to_string()));
        assert_eq!(prober.seen_tokens.lock().unwrap().len(), 1);

        // The dropped token is replaced on the next probe
        probe_channel(&prober, &tokens, "alice").await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_token_failure_is_transient() {
        let tokens = TokenManager::new(Arc::new(CountingFetcher::failing()));
        let prober = ScriptedProbe::new().script("alice", vec![LivenessResult::Offline]);

        let result = probe_channel(&prober, &tokens, "alice").await;

        assert!(matches!(result, LivenessResult::TransientError(_)));
        assert!(prober.seen_tokens.lock().unwrap().is_empty());
    }
}
