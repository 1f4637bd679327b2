//! Low level access to the Concentriq JSON API.
//!
//! [`RequestProxy`] owns the HTTP client, joins endpoints onto the API URL,
//! adds basic auth to every request and unwraps the `{data, meta, error}`
//! envelope the server wraps every JSON response in.

use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::config::Credentials;
use crate::error::{ApiError, Error, Result};
use crate::models::{Pagination, PaginationInfo, SortBy};

pub const USER_AGENT: &str = concat!("concentriq-cli/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Query parameters as sent with a request.
pub type Params = Vec<(&'static str, String)>;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    meta: Option<Meta>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    pagination: Option<PaginationInfo>,
}

/// Authenticated request helper bound to one Concentriq instance.
#[derive(Debug, Clone)]
pub struct RequestProxy {
    client: Client,
    no_redirect: Client,
    api_url: Url,
    user: String,
    password: SecretString,
}

impl RequestProxy {
    /// Validate the credentials and build the HTTP clients.
    pub fn new(creds: &Credentials) -> Result<Self> {
        if !creds.api_url.starts_with("http") {
            return Err(Error::InvalidConfig(format!(
                "api_url must start with http*..., got: {:?}",
                creds.api_url
            )));
        }
        if creds.user.trim().is_empty() {
            return Err(Error::InvalidConfig("user must be non-empty".into()));
        }
        if creds.password.expose_secret().trim().is_empty() {
            return Err(Error::InvalidConfig("password must be non-empty".into()));
        }

        let mut api_url = creds.api_url.clone();
        if !api_url.ends_with('/') {
            api_url.push('/');
        }
        let api_url = Url::parse(&api_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid api_url {api_url:?}: {e}")))?;

        let certificate = match &creds.ssl_certificate {
            Some(path) => {
                let pem = std::fs::read(path)?;
                Some(reqwest::Certificate::from_pem(&pem)?)
            }
            None => None,
        };
        let builder = |policy: Policy| {
            let mut b = Client::builder()
                .user_agent(USER_AGENT)
                .timeout(DEFAULT_TIMEOUT)
                .cookie_store(true)
                .redirect(policy);
            if let Some(cert) = &certificate {
                b = b.add_root_certificate(cert.clone());
            }
            b.build()
        };

        Ok(Self {
            client: builder(Policy::default())?,
            no_redirect: builder(Policy::none())?,
            api_url,
            user: creds.user.clone(),
            password: creds.password.clone(),
        })
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    fn url(&self, endpoint: &str) -> Result<Url> {
        self.api_url
            .join(endpoint)
            .map_err(|e| Error::InvalidConfig(format!("invalid endpoint {endpoint:?}: {e}")))
    }

    fn send(&self, client: &Client, builder: RequestBuilder) -> Result<Response> {
        let request = builder
            .basic_auth(&self.user, Some(self.password.expose_secret()))
            .build()?;
        tracing::debug!(method = %request.method(), url = %request.url(), "request");
        let response = client.execute(request)?;
        tracing::debug!(status = %response.status(), "response");
        Ok(response)
    }

    fn unwrap_envelope(response: Response) -> Result<(Value, Option<PaginationInfo>)> {
        let status = response.status();
        let body = response.text()?;
        let unexpected = || {
            let snippet: String = body.chars().take(200).collect();
            Error::UnexpectedResponse(format!("{status}: {snippet}"))
        };
        let envelope: Envelope = serde_json::from_str(&body).map_err(|_| unexpected())?;
        if let Some(err) = envelope.error {
            tracing::debug!(name = %err.name, status = err.status, "api error: {err}");
            return Err(err.into());
        }
        // proxies and auth layers answer with JSON that is not an envelope
        if status.is_client_error() || status.is_server_error() {
            return Err(unexpected());
        }
        let pagination = envelope.meta.unwrap_or_default().pagination;
        Ok((envelope.data, pagination))
    }

    fn check<T: DeserializeOwned>(response: Response) -> Result<T> {
        let (data, pagination) = Self::unwrap_envelope(response)?;
        if pagination.is_some() {
            return Err(Error::UnexpectedResponse(
                "response is paginated, this might be unintended".into(),
            ));
        }
        Ok(serde_json::from_value(data)?)
    }

    fn check_paginated<T: DeserializeOwned>(response: Response) -> Result<(T, PaginationInfo)> {
        let (data, pagination) = Self::unwrap_envelope(response)?;
        let pagination = pagination.ok_or_else(|| {
            Error::UnexpectedResponse("expected a paginated response".into())
        })?;
        Ok((serde_json::from_value(data)?, pagination))
    }

    pub fn get<T: DeserializeOwned>(&self, endpoint: &str, params: &Params) -> Result<T> {
        let req = self.client.get(self.url(endpoint)?).query(params);
        Self::check(self.send(&self.client, req)?)
    }

    pub fn get_paginated<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &Params,
    ) -> Result<(T, PaginationInfo)> {
        let req = self.client.get(self.url(endpoint)?).query(params);
        Self::check_paginated(self.send(&self.client, req)?)
    }

    /// Fetch a non-JSON body, e.g. csv or xml exports.
    pub fn get_text(&self, endpoint: &str, params: &Params) -> Result<String> {
        let req = self.client.get(self.url(endpoint)?).query(params);
        let response = self.send(&self.client, req)?;
        if !response.status().is_success() {
            Self::unwrap_envelope(response)?;
            return Err(Error::UnexpectedResponse("request was not successful".into()));
        }
        Ok(response.text()?)
    }

    /// Request an endpoint that answers with a redirect and return its target.
    pub fn get_redirect(&self, endpoint: &str) -> Result<String> {
        let req = self.no_redirect.get(self.url(endpoint)?);
        let response = self.send(&self.no_redirect, req)?;
        let status = response.status();
        if !status.is_redirection() {
            Self::unwrap_envelope(response)?;
            return Err(Error::UnexpectedResponse(format!(
                "expected redirect, got {status}"
            )));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::UnexpectedResponse("redirect without Location".into()))?;
        Ok(location.to_string())
    }

    pub fn post_form<T: DeserializeOwned, F: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        form: &F,
    ) -> Result<T> {
        let req = self.client.post(self.url(endpoint)?).form(form);
        Self::check(self.send(&self.client, req)?)
    }

    pub fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let req = self.client.post(self.url(endpoint)?).json(body);
        Self::check(self.send(&self.client, req)?)
    }

    pub fn post_multipart<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        form: multipart::Form,
    ) -> Result<T> {
        let req = self.client.post(self.url(endpoint)?).multipart(form);
        Self::check(self.send(&self.client, req)?)
    }

    pub fn patch_form<T: DeserializeOwned, F: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        form: &F,
    ) -> Result<T> {
        let req = self.client.patch(self.url(endpoint)?).form(form);
        Self::check(self.send(&self.client, req)?)
    }

    pub fn delete<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let req = self.client.delete(self.url(endpoint)?);
        Self::check(self.send(&self.client, req)?)
    }

    /// Walk a paginated endpoint page by page, starting after `offset` pages.
    pub fn pages(
        &self,
        endpoint: &str,
        params: Params,
        offset: u32,
        size: u32,
        sort_by: SortBy,
        descending: bool,
    ) -> Pages<'_> {
        Pages {
            proxy: self,
            endpoint: endpoint.to_string(),
            params,
            next_page: offset + 1,
            size,
            sort_by,
            descending,
            done: false,
        }
    }
}

/// Iterator over the `data` payload of consecutive pages.
///
/// Stops at the first page reporting `rowsReturned <= 0`, or after the
/// first error.
pub struct Pages<'a> {
    proxy: &'a RequestProxy,
    endpoint: String,
    params: Params,
    next_page: u32,
    size: u32,
    sort_by: SortBy,
    descending: bool,
    done: bool,
}

impl Iterator for Pages<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let pagination = Pagination::new(self.size, self.next_page, self.sort_by, self.descending);
        let mut params = self.params.clone();
        match pagination.to_query() {
            Ok(q) => params.push(("pagination", q)),
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        }
        match self.proxy.get_paginated::<Value>(&self.endpoint, &params) {
            Ok((_, info)) if info.rows_returned <= 0 => {
                self.done = true;
                None
            }
            Ok((data, _)) => {
                self.next_page += 1;
                Some(Ok(data))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
