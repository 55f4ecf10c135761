//! Remote data source boundary and a thin JSON-over-HTTP implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use crate::config::RemoteConfig;
use crate::error::SyncError;
use crate::model::{Entity, EntityKey, EntityKind};

/// Remote owner of pull requests and comment threads.
///
/// Every failure is classified into a [`SyncError`] so callers branch on
/// the kind of failure, never on transport details.
#[async_trait]
pub trait RemoteSource: Send + Sync {
  async fn fetch_entities(&self, container_id: &str, kind: EntityKind) -> Result<Vec<Entity>, SyncError>;

  async fn fetch_entity(&self, kind: EntityKind, key: &EntityKey) -> Result<Entity, SyncError>;

  /// Write `entity` and return the remote's accepted version.
  async fn push_entity(&self, entity: &Entity) -> Result<Entity, SyncError>;

  /// Records recently touched by the current user, across containers.
  async fn fetch_activity(&self) -> Result<Vec<Entity>, SyncError>;

  /// Cheap reachability check.
  async fn probe(&self) -> Result<(), SyncError>;
}

/// [`RemoteSource`] speaking plain JSON REST.
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, token: Option<String>) -> Result<Self> {
    let mut base =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid remote url {}: {}", config.url, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("Remote url {} cannot be used as a base", config.url));
    }
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(concat!("prsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| SyncError::validation("remote url cannot be a base"))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self.client.request(method, url);
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, SyncError> {
    let response = builder.send().await.map_err(classify_transport)?;
    let status = response.status();

    if !status.is_success() {
      let retry_after = retry_after(response.headers());
      let body = response.text().await.unwrap_or_default();
      return Err(classify_status(status, &body, retry_after));
    }

    response.json::<T>().await.map_err(classify_transport)
  }

  fn collection(kind: EntityKind) -> &'static str {
    match kind {
      EntityKind::PullRequest => "pulls",
      EntityKind::CommentThread => "threads",
    }
  }
}

#[async_trait]
impl RemoteSource for HttpRemote {
  async fn fetch_entities(&self, container_id: &str, kind: EntityKind) -> Result<Vec<Entity>, SyncError> {
    let url = self.endpoint(&["containers", container_id, Self::collection(kind)])?;
    self.send(self.request(Method::GET, url)).await
  }

  async fn fetch_entity(&self, kind: EntityKind, key: &EntityKey) -> Result<Entity, SyncError> {
    let url = self.endpoint(&[
      "containers",
      &key.container_id,
      Self::collection(kind),
      &key.entity_id,
    ])?;
    self.send(self.request(Method::GET, url)).await
  }

  async fn push_entity(&self, entity: &Entity) -> Result<Entity, SyncError> {
    let url = self.endpoint(&[
      "containers",
      &entity.key.container_id,
      Self::collection(entity.kind),
      &entity.key.entity_id,
    ])?;
    self.send(self.request(Method::PUT, url).json(entity)).await
  }

  async fn fetch_activity(&self) -> Result<Vec<Entity>, SyncError> {
    let url = self.endpoint(&["activity"])?;
    self.send(self.request(Method::GET, url)).await
  }

  async fn probe(&self) -> Result<(), SyncError> {
    let url = self.endpoint(&["health"])?;
    let response = self
      .request(Method::GET, url)
      .send()
      .await
      .map_err(classify_transport)?;
    let status = response.status();

    if status.is_success() {
      Ok(())
    } else {
      Err(classify_status(status, "", retry_after(response.headers())))
    }
  }
}

/// Map a non-success HTTP status to a classified error.
pub fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> SyncError {
  let message = if body.is_empty() {
    status.canonical_reason().unwrap_or("request failed").to_string()
  } else {
    body.chars().take(200).collect()
  };

  match status.as_u16() {
    429 => SyncError::RateLimit { retry_after },
    400 | 422 => SyncError::Validation(message),
    404 => SyncError::NotFound(message),
    409 => SyncError::Conflict(message),
    code if code >= 500 => SyncError::server(code, message),
    code => SyncError::Validation(format!("unexpected status {}: {}", code, message)),
  }
}

fn classify_transport(error: reqwest::Error) -> SyncError {
  if error.is_decode() {
    let status = error.status().map(|s| s.as_u16()).unwrap_or(200);
    return SyncError::server(status, format!("invalid response body: {}", error));
  }
  // Connect, DNS, timeout and truncated bodies all mean the link is unusable
  SyncError::network(error.to_string())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
  headers
    .get(RETRY_AFTER)?
    .to_str()
    .ok()?
    .trim()
    .parse::<u64>()
    .ok()
    .map(Duration::from_secs)
}
