use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use crate::{error::AppError, providers::ProviderError, state::AppState};

/// Resolves a session token to a user id. Passwords and sessions live with
/// the identity service; this side only asks who a token belongs to.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `None` when the token is unknown or expired.
    async fn current_user(&self, token: &str) -> Result<Option<Uuid>, ProviderError>;
}

/// `GET {AUTH_URL}/user` with the caller's bearer token.
pub struct HttpIdentityProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct AuthUser {
    id: Uuid,
}

impl HttpIdentityProvider {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn current_user(&self, token: &str) -> Result<Option<Uuid>, ProviderError> {
        let mut req = self.client.get(format!("{}/user", self.base_url)).bearer_auth(token);
        if let Some(key) = &self.api_key {
            req = req.header("apikey", key);
        }
        let res = req.send().await?;

        match res.status().as_u16() {
            200..=299 => {}
            401 | 403 | 404 => return Ok(None),
            status => {
                let body = res.text().await.unwrap_or_default();
                return Err(ProviderError::Status { status, body });
            }
        }

        let user: AuthUser = res
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(Some(user.id))
    }
}

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub Uuid);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Unauthorized)?;

        match state.identity.current_user(bearer.token()).await {
            Ok(Some(id)) => Ok(CurrentUser(id)),
            Ok(None) => Err(AppError::Unauthorized),
            Err(e) => {
                tracing::warn!(error = %e, "identity provider unavailable");
                Err(AppError::IdentityUnavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Settings;
    use crate::store::MemoryStore;
    use crate::testing::{HashEmbedder, MemoryObjectStore, TutorModel};
    use std::sync::Arc;
    use test_log::test;

    fn provider(url: String, key: Option<&str>) -> HttpIdentityProvider {
        HttpIdentityProvider::new(&url, key.map(str::to_string), Duration::from_secs(5)).unwrap()
    }

    #[test(tokio::test)]
    async fn known_token_resolves_to_user_id() {
        let id = Uuid::new_v4();
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/user")
            .match_header("authorization", "Bearer tok")
            .match_header("apikey", "anon")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"id":"{}","email":"p@example.com"}}"#, id))
            .create_async()
            .await;

        let user = provider(server.url(), Some("anon")).current_user("tok").await.unwrap();
        assert_eq!(user, Some(id));
        mock.assert_async().await;
    }

    #[test(tokio::test)]
    async fn rejected_token_is_no_user() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/user").with_status(401).create_async().await;
        assert_eq!(provider(server.url(), None).current_user("bad").await.unwrap(), None);
    }

    #[test(tokio::test)]
    async fn server_errors_are_reported() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/user").with_status(500).create_async().await;
        assert!(matches!(
            provider(server.url(), None).current_user("tok").await,
            Err(ProviderError::Status { status: 500, .. })
        ));
    }

    async fn resolve(identity: HttpIdentityProvider, token: &str) -> Result<CurrentUser, AppError> {
        let state = AppState {
            store: Arc::new(MemoryStore::new()),
            model: Arc::new(TutorModel::new(1, 50)),
            embedder: Arc::new(HashEmbedder),
            objects: Arc::new(MemoryObjectStore::default()),
            identity: Arc::new(identity),
            settings: Settings::default(),
        };
        let (mut parts, _) = http::Request::builder()
            .header(http::header::AUTHORIZATION, format!("Bearer {}", token))
            .body(())
            .unwrap()
            .into_parts();
        CurrentUser::from_request_parts(&mut parts, &state).await
    }

    #[test(tokio::test)]
    async fn outage_is_not_reported_as_bad_credentials() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/user").with_status(503).create_async().await;

        let err = resolve(provider(server.url(), None), "tok").await.unwrap_err();
        assert!(matches!(err, AppError::IdentityUnavailable(_)));
        assert_eq!(err.status(), http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test(tokio::test)]
    async fn unreachable_provider_is_unavailable() {
        // nothing listens on the discard port
        let err = resolve(provider("http://127.0.0.1:9".into(), None), "tok").await.unwrap_err();
        assert!(matches!(err, AppError::IdentityUnavailable(_)));
    }

    #[test(tokio::test)]
    async fn unknown_token_is_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/user").with_status(401).create_async().await;
        let err = resolve(provider(server.url(), None), "tok").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }
}
