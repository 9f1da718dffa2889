//! Client for the external authority that owns truck holds.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

pub const REQUEST_SOURCE: &str = "haul-relay";

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("authority returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("authority unreachable: {0}")]
    Transport(String),

    #[error("authority did not answer within {0:?}")]
    Timeout(Duration),
}

/// The system of record for holds. Local state only ever follows a
/// successful call.
#[async_trait]
pub trait HoldAuthority: Send + Sync {
    async fn place_hold(
        &self,
        truck_id: i64,
        dispatcher_id: i64,
        dispatcher_name: &str,
        token: Option<&SecretString>,
    ) -> Result<(), AuthorityError>;

    async fn release_hold(
        &self,
        truck_id: i64,
        dispatcher_id: i64,
        token: Option<&SecretString>,
    ) -> Result<(), AuthorityError>;

    async fn expire_hold(&self, truck_id: i64, expired_at: DateTime<Utc>) -> Result<(), AuthorityError>;
}

/// HTTP implementation. Any non-2xx answer is a failure.
pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthorityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn hold_url(&self, truck_id: i64) -> String {
        format!("{}/resource/{truck_id}/hold", self.base_url)
    }

    async fn execute(
        &self,
        req: reqwest::RequestBuilder,
        token: Option<&SecretString>,
    ) -> Result<(), AuthorityError> {
        let mut req = req.header("X-Request-Source", REQUEST_SOURCE);
        if let Some(token) = token {
            req = req.bearer_auth(token.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthorityError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HoldAuthority for HttpAuthority {
    async fn place_hold(
        &self,
        truck_id: i64,
        dispatcher_id: i64,
        dispatcher_name: &str,
        token: Option<&SecretString>,
    ) -> Result<(), AuthorityError> {
        let req = self.client.post(self.hold_url(truck_id)).json(&json!({
            "dispatcherId": dispatcher_id,
            "dispatcherName": dispatcher_name,
        }));
        self.execute(req, token).await
    }

    async fn release_hold(
        &self,
        truck_id: i64,
        dispatcher_id: i64,
        token: Option<&SecretString>,
    ) -> Result<(), AuthorityError> {
        let req = self
            .client
            .delete(self.hold_url(truck_id))
            .json(&json!({ "dispatcherId": dispatcher_id }));
        self.execute(req, token).await
    }

    async fn expire_hold(&self, truck_id: i64, expired_at: DateTime<Utc>) -> Result<(), AuthorityError> {
        let req = self
            .client
            .delete(format!("{}/expire", self.hold_url(truck_id)))
            .json(&json!({ "expiredAt": expired_at }));
        self.execute(req, None).await
    }
}

/// Scripted in-process authority for tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    pub enum Call {
        Place { truck_id: i64, dispatcher_id: i64 },
        Release { truck_id: i64, dispatcher_id: i64 },
        Expire { truck_id: i64 },
    }

    /// Mirrors the real authority's guard: one holder per truck.
    #[derive(Default)]
    pub struct FakeAuthority {
        holds: Mutex<HashMap<i64, i64>>,
        calls: Mutex<Vec<Call>>,
        failing: AtomicBool,
        stall: Mutex<Option<Duration>>,
    }

    impl FakeAuthority {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn stall_for(&self, delay: Duration) {
            *self.stall.lock() = Some(delay);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub fn holder(&self, truck_id: i64) -> Option<i64> {
            self.holds.lock().get(&truck_id).copied()
        }

        async fn gate(&self) -> Result<(), AuthorityError> {
            let stall = *self.stall.lock();
            if let Some(delay) = stall {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(AuthorityError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl HoldAuthority for FakeAuthority {
        async fn place_hold(
            &self,
            truck_id: i64,
            dispatcher_id: i64,
            _dispatcher_name: &str,
            _token: Option<&SecretString>,
        ) -> Result<(), AuthorityError> {
            self.calls.lock().push(Call::Place { truck_id, dispatcher_id });
            self.gate().await?;
            let mut holds = self.holds.lock();
            if holds.contains_key(&truck_id) {
                return Err(AuthorityError::Status {
                    status: 409,
                    body: "already held".into(),
                });
            }
            holds.insert(truck_id, dispatcher_id);
            Ok(())
        }

        async fn release_hold(
            &self,
            truck_id: i64,
            dispatcher_id: i64,
            _token: Option<&SecretString>,
        ) -> Result<(), AuthorityError> {
            self.calls.lock().push(Call::Release { truck_id, dispatcher_id });
            self.gate().await?;
            self.holds.lock().remove(&truck_id);
            Ok(())
        }

        async fn expire_hold(&self, truck_id: i64, _expired_at: DateTime<Utc>) -> Result<(), AuthorityError> {
            self.calls.lock().push(Call::Expire { truck_id });
            self.gate().await?;
            self.holds.lock().remove(&truck_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let authority = HttpAuthority::new("http://authority.local/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(authority.hold_url(5), "http://authority.local/api/resource/5/hold");
    }

    #[tokio::test]
    async fn unreachable_authority_is_a_transport_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let authority = HttpAuthority::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = authority.expire_hold(5, Utc::now()).await.unwrap_err();
        assert!(matches!(err, AuthorityError::Transport(_)), "got {err:?}");
    }
}
