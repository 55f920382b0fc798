use reqwest::Method;
use reqwest::blocking::Response;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum DevpiError {
    #[error("request to devpi server failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("devpi server rejected `{action}` with HTTP {status}: {message}")]
    Rejected {
        action: String,
        status: u16,
        message: String,
    },
    #[error("unexpected response to `{action}` from devpi server: {detail}")]
    MalformedResponse { action: String, detail: String },
    #[error("`{0}` is not a valid devpi server URL")]
    InvalidServerUrl(String),
    #[error("invalid package name pattern `{0}`")]
    InvalidPattern(String),
    #[error("`{0}` is not a `<name>==<version>` release spec")]
    InvalidReleaseSpec(String),
}

/// Settings of one index, as far as this tool cares about them.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSettings {
    /// Whether the index permits deleting releases.
    #[serde(default)]
    pub volatile: bool,
}

/// The command/query surface this tool needs from a devpi server.
///
/// The production implementation is [`DevpiClient`]; tests substitute an
/// in-memory fake.
pub trait DevpiOps {
    /// Select `index` as the context for subsequent queries.
    fn use_index(&mut self, index: &str) -> Result<(), DevpiError>;

    /// List release-file URLs of all versions (hidden ones included) of the
    /// packages on `index` matching `spec`. May contain non-URL
    /// informational lines.
    fn list_artifacts(&mut self, index: &str, spec: &str) -> Result<Vec<String>, DevpiError>;

    /// Enumerate the indices owned by `user` as `user/name` entries.
    fn list_indices(&mut self, user: &str) -> Result<Vec<String>, DevpiError>;

    /// Delete one exact release, identified by a `<name>==<version>` spec.
    fn remove(&mut self, index: &str, release_spec: &str) -> Result<(), DevpiError>;

    /// Raw JSON read of a server path such as `/+status`.
    fn get_json(&mut self, path: &str) -> Result<Value, DevpiError>;

    fn index_settings(&mut self, index: &str) -> Result<IndexSettings, DevpiError>;

    fn set_volatile(&mut self, index: &str, volatile: bool) -> Result<(), DevpiError>;
}

/// Blocking HTTP client for the devpi JSON API.
///
/// Authenticates once at construction via `POST /+login` and sends the
/// resulting session token as `X-Devpi-Auth` on every request. The session
/// is released when the value drops; there is nothing to tear down on the
/// server side.
pub struct DevpiClient {
    http: reqwest::blocking::Client,
    base: Url,
    auth: Option<String>,
}

impl DevpiClient {
    pub fn login(server: &str, user: &str, password: &str) -> Result<Self, DevpiError> {
        let base =
            Url::parse(server).map_err(|_| DevpiError::InvalidServerUrl(server.to_string()))?;
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("devpi-prune/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut client = DevpiClient {
            http,
            base,
            auth: None,
        };
        let body = json!({ "user": user, "password": password });
        let reply = client.send_json(Method::POST, "+login", Some(&body))?;
        let token = reply
            .pointer("/result/password")
            .and_then(Value::as_str)
            .ok_or_else(|| DevpiError::MalformedResponse {
                action: "POST +login".to_string(),
                detail: "missing result.password".to_string(),
            })?;
        client.auth = Some(format!("{user}:{token}"));
        tracing::debug!("authenticated against {} as {user}", client.base);
        Ok(client)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DevpiError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| DevpiError::InvalidServerUrl(self.base.to_string()))?;
            segments.pop_if_empty();
            for part in path.split('/').filter(|part| !part.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, DevpiError> {
        let action = format!("{method} {path}");
        let url = self.endpoint(path)?;

        let mut request = self
            .http
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(auth) = &self.auth {
            request = request.header("X-Devpi-Auth", auth);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<Value>()
                .ok()
                .and_then(|reply| {
                    reply
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "no detail provided".to_string());
            return Err(DevpiError::Rejected {
                action,
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, DevpiError> {
        Ok(self.send(method, path, body)?.json()?)
    }
}

impl DevpiOps for DevpiClient {
    /// The HTTP API is stateless, so selecting an index amounts to checking
    /// that it exists.
    fn use_index(&mut self, index: &str) -> Result<(), DevpiError> {
        self.index_settings(index)?;
        tracing::debug!("using index {index}");
        Ok(())
    }

    fn list_artifacts(&mut self, index: &str, spec: &str) -> Result<Vec<String>, DevpiError> {
        let matcher = name_matcher(spec)?;
        let listing = self.send_json(Method::GET, index, None)?;
        let projects: Vec<String> = listing
            .pointer("/result/projects")
            .and_then(Value::as_array)
            .ok_or_else(|| DevpiError::MalformedResponse {
                action: format!("GET {index}"),
                detail: "missing result.projects".to_string(),
            })?
            .iter()
            .filter_map(Value::as_str)
            .filter(|name| matcher.is_match(name))
            .map(str::to_string)
            .collect();

        let mut urls = Vec::new();
        for project in projects {
            let path = format!("{index}/{project}");
            let detail = self.send_json(Method::GET, &path, None)?;
            let versions = detail
                .pointer("/result")
                .and_then(Value::as_object)
                .ok_or_else(|| DevpiError::MalformedResponse {
                    action: format!("GET {path}"),
                    detail: "missing result".to_string(),
                })?;
            for data in versions.values() {
                let links = data
                    .pointer("/+links")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for link in links {
                    if link.get("rel").and_then(Value::as_str) == Some("releasefile")
                        && let Some(href) = link.get("href").and_then(Value::as_str)
                    {
                        urls.push(href.to_string());
                    }
                }
            }
        }
        Ok(urls)
    }

    fn list_indices(&mut self, user: &str) -> Result<Vec<String>, DevpiError> {
        let reply = self.send_json(Method::GET, user, None)?;
        let indexes = reply.pointer("/result/indexes").and_then(Value::as_object).ok_or_else(
            || DevpiError::MalformedResponse {
                action: format!("GET {user}"),
                detail: "missing result.indexes".to_string(),
            },
        )?;
        let mut names: Vec<String> = indexes.keys().map(|name| format!("{user}/{name}")).collect();
        names.sort();
        Ok(names)
    }

    fn remove(&mut self, index: &str, release_spec: &str) -> Result<(), DevpiError> {
        let (name, version) = release_spec
            .split_once("==")
            .ok_or_else(|| DevpiError::InvalidReleaseSpec(release_spec.to_string()))?;
        self.send(Method::DELETE, &format!("{index}/{name}/{version}"), None)?;
        tracing::info!("removed {name} {version} from {index}");
        Ok(())
    }

    fn get_json(&mut self, path: &str) -> Result<Value, DevpiError> {
        self.send_json(Method::GET, path, None)
    }

    fn index_settings(&mut self, index: &str) -> Result<IndexSettings, DevpiError> {
        let reply = self.send_json(Method::GET, index, None)?;
        let result = reply
            .get("result")
            .cloned()
            .ok_or_else(|| DevpiError::MalformedResponse {
                action: format!("GET {index}"),
                detail: "missing result".to_string(),
            })?;
        serde_json::from_value(result).map_err(|err| DevpiError::MalformedResponse {
            action: format!("GET {index}"),
            detail: err.to_string(),
        })
    }

    fn set_volatile(&mut self, index: &str, volatile: bool) -> Result<(), DevpiError> {
        // devpi expects Python bool literals in `key=value` modify requests.
        let body = json!([format!(
            "volatile={}",
            if volatile { "True" } else { "False" }
        )]);
        self.send(Method::PATCH, index, Some(&body))?;
        tracing::debug!("set {index} volatile={volatile}");
        Ok(())
    }
}

/// Compile a package name pattern with `*` wildcards into a full-string
/// matcher.
fn name_matcher(spec: &str) -> Result<regex::Regex, DevpiError> {
    let pattern = format!("^{}$", regex::escape(spec).replace(r"\*", ".*"));
    regex::Regex::new(&pattern).map_err(|_| DevpiError::InvalidPattern(spec.to_string()))
}
