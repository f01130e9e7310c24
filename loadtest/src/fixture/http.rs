use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::service::FixtureService;
use super::types::{
    ApiResponse, FixtureError, LoginData, LoginRequest, Target, TargetPage, TargetSpec,
};
use crate::config::Credentials;

/// REST client for the fixture collaborator
#[derive(Debug, Clone)]
pub struct HttpFixtureService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFixtureService {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FixtureError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<Result<T, String>, FixtureError> {
    let body: ApiResponse<T> = response.error_for_status()?.json().await?;
    Ok(body.into_data())
}

#[async_trait]
impl FixtureService for HttpFixtureService {
    async fn login(&self, credentials: &Credentials) -> Result<String, FixtureError> {
        let request = LoginRequest {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };
        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&request)
            .send()
            .await?;
        let data: LoginData = decode(response).await?.map_err(FixtureError::Auth)?;
        Ok(data.token)
    }

    async fn list_targets(
        &self,
        token: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TargetPage, FixtureError> {
        let response = self
            .client
            .get(self.url("/groups"))
            .bearer_auth(token)
            .query(&[("page", page), ("page_size", page_size)])
            .send()
            .await?;
        decode(response).await?.map_err(FixtureError::Fetch)
    }

    async fn create_target(&self, token: &str, spec: &TargetSpec) -> Result<Target, FixtureError> {
        let response = self
            .client
            .post(self.url("/groups"))
            .bearer_auth(token)
            .json(spec)
            .send()
            .await?;
        decode(response).await?.map_err(FixtureError::Create)
    }
}
