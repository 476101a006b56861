//! Blocking client for the facegated API.

use anyhow::{bail, Context, Result};
use facegate_core::auth::{
    AuthResponse, ErrorResponse, HistoryResponse, LoginRequest, ProfileResponse, RegisterRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use ureq::http::Response;
use ureq::{Agent, Body};

pub struct ApiClient {
    agent: Agent,
    base: String,
}

impl ApiClient {
    pub fn new(server: &str) -> Self {
        // Error statuses carry a JSON message; read it instead of failing early.
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            base: format!("{}/api/auth", server.trim_end_matches('/')),
        }
    }

    pub fn register(&self, req: &RegisterRequest) -> Result<AuthResponse> {
        self.post("register", req)
    }

    pub fn login(&self, req: &LoginRequest) -> Result<AuthResponse> {
        self.post("login", req)
    }

    pub fn profile(&self, token: &str) -> Result<ProfileResponse> {
        self.get("user", token)
    }

    pub fn history(&self, token: &str) -> Result<HistoryResponse> {
        self.get("history", token)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}/{path}", self.base);
        let resp = self
            .agent
            .post(&url)
            .send_json(body)
            .with_context(|| format!("request to {url} failed"))?;
        decode(resp)
    }

    fn get<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T> {
        let url = format!("{}/{path}", self.base);
        let resp = self
            .agent
            .get(&url)
            .header("Authorization", &format!("Bearer {token}"))
            .call()
            .with_context(|| format!("request to {url} failed"))?;
        decode(resp)
    }
}

fn decode<T: DeserializeOwned>(mut resp: Response<Body>) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .body_mut()
            .read_json::<T>()
            .context("malformed response body");
    }
    match resp.body_mut().read_json::<ErrorResponse>() {
        Ok(err) => bail!("{} ({})", err.message, status.as_u16()),
        Err(_) => bail!("server returned {status}"),
    }
}
