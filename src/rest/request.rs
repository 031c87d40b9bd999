//! Request assembly: URL, headers, query, and body encoding.

use crate::config::HttpOptions;
use crate::error::{HttpFailure, RestError};
use crate::rest::captcha::CaptchaSolution;
use crate::rest::route::Route;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use std::time::Duration;

/// A query parameter value; arrays repeat the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Single(String),
    Many(Vec<String>),
}

impl From<&str> for QueryValue {
    fn from(v: &str) -> Self {
        Self::Single(v.to_owned())
    }
}

impl From<String> for QueryValue {
    fn from(v: String) -> Self {
        Self::Single(v)
    }
}

impl From<u64> for QueryValue {
    fn from(v: u64) -> Self {
        Self::Single(v.to_string())
    }
}

impl From<bool> for QueryValue {
    fn from(v: bool) -> Self {
        Self::Single(v.to_string())
    }
}

impl<T: Into<QueryValue>> From<Vec<T>> for QueryValue {
    fn from(values: Vec<T>) -> Self {
        let mut flat = Vec::with_capacity(values.len());
        for value in values {
            match value.into() {
                QueryValue::Single(s) => flat.push(s),
                QueryValue::Many(mut m) => flat.append(&mut m),
            }
        }
        Self::Many(flat)
    }
}

/// One file going into a multipart body. Streams are drained into bytes
/// by the caller before they get here.
#[derive(Debug, Clone)]
pub struct FileAttachment {
    /// Multipart field name; defaults to `files[{index}]`.
    pub key: Option<String>,
    pub name: String,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
}

/// Per-request options recognized by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, QueryValue)>,
    /// JSON body, or form fields when `dont_use_payload_json` is set.
    pub data: Option<serde_json::Value>,
    pub files: Vec<FileAttachment>,
    /// Caller header overrides.
    pub headers: Vec<(String, String)>,
    /// Audit-log reason, percent-encoded into its header.
    pub reason: Option<String>,
    /// Attach the authorization header (default true).
    pub no_auth: bool,
    /// Skip the `/v{n}` prefix.
    pub unversioned: bool,
    /// Webhook call: no auth header, bypasses global accounting.
    pub webhook: bool,
    /// Context object for `X-Context-Properties`.
    pub context: Option<serde_json::Value>,
    pub mfa_token: Option<String>,
    /// With files present, force `data` into `payload_json` even when it
    /// would default to form fields.
    pub use_payload_json: bool,
    /// With files present, send `data` fields as individual form parts.
    pub dont_use_payload_json: bool,
}

/// One logical API request, retried as a unit. Retry loops attach
/// captcha/MFA state between attempts.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: String,
    pub route: Route,
    pub options: RequestOptions,
    /// Solved captcha from a previous attempt.
    pub captcha: Option<CaptchaSolution>,
    /// Second-factor token from a previous attempt.
    pub mfa_authorization: Option<String>,
}

impl ApiRequest {
    pub fn new(method: &str, route: Route, options: RequestOptions) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            route,
            options,
            captcha: None,
            mfa_authorization: None,
        }
    }

    /// Absolute URL including version prefix and encoded query string.
    pub fn url(&self, config: &HttpOptions) -> Result<url::Url, RestError> {
        let mut text = String::from(config.api.trim_end_matches('/'));
        if !self.options.unversioned {
            text.push_str("/v");
            text.push_str(&config.version.to_string());
        }
        text.push_str(self.route.path());

        let mut url = url::Url::parse(&text).map_err(|e| self.failure(format!("bad url: {e}")))?;
        if !self.options.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.options.query {
                match value {
                    QueryValue::Single(v) => {
                        pairs.append_pair(key, v);
                    }
                    QueryValue::Many(values) => {
                        for v in values {
                            pairs.append_pair(key, v);
                        }
                    }
                }
            }
        }
        Ok(url)
    }

    /// Assemble the outbound request.
    ///
    /// `super_properties` is the cached base64 blob and `auth_token` the
    /// resolved authorization value, both owned by the manager.
    pub fn build(
        &self,
        client: &reqwest::Client,
        config: &HttpOptions,
        super_properties: &str,
        auth_token: &str,
    ) -> Result<reqwest::RequestBuilder, RestError> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|_| self.failure(format!("invalid method {}", self.method)))?;
        let url = self.url(config)?;

        let mut builder = client
            .request(method, url)
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .header("User-Agent", config.user_agent())
            .header("X-Super-Properties", super_properties)
            .header("X-Discord-Locale", &config.properties.system_locale)
            .header(
                "Sec-Ch-Ua-Platform",
                format!("\"{}\"", config.properties.platform_label()),
            );

        if let Some(major) = config.properties.browser_major() {
            builder = builder.header(
                "Sec-Ch-Ua",
                format!(
                    "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{major}\", \"{}\";v=\"{major}\"",
                    config.properties.browser
                ),
            );
        }
        if let Some(timezone) = &config.timezone {
            builder = builder.header("X-Discord-Timezone", timezone);
        }
        for (name, value) in &config.headers {
            builder = builder.header(name, value);
        }
        for (name, value) in &self.options.headers {
            builder = builder.header(name, value);
        }

        if !self.options.no_auth && !self.options.webhook {
            builder = builder.header("Authorization", auth_token);
        }
        if let Some(reason) = &self.options.reason {
            let encoded = utf8_percent_encode(reason, NON_ALPHANUMERIC).to_string();
            builder = builder.header("X-Audit-Log-Reason", encoded);
        }
        if let Some(context) = &self.options.context {
            let blob = serde_json::to_string(context).unwrap_or_default();
            builder = builder.header("X-Context-Properties", BASE64.encode(blob));
        }
        if let Some(mfa) = self.mfa_authorization.as_ref().or(self.options.mfa_token.as_ref()) {
            builder = builder.header("X-Discord-Mfa-Authorization", mfa);
        }
        if let Some(captcha) = &self.captcha {
            builder = builder.header("X-Captcha-Key", &captcha.key);
            if let Some(rqtoken) = &captcha.rqtoken {
                builder = builder.header("X-Captcha-Rqtoken", rqtoken);
            }
        }

        if !self.options.files.is_empty() {
            builder = builder.multipart(self.multipart_form()?);
        } else if let Some(data) = &self.options.data {
            builder = builder.json(data);
        }

        Ok(builder)
    }

    fn multipart_form(&self) -> Result<Form, RestError> {
        let mut form = Form::new();
        for (index, file) in self.options.files.iter().enumerate() {
            let key = file
                .key
                .clone()
                .unwrap_or_else(|| format!("files[{index}]"));
            let mut part = Part::bytes(file.data.clone()).file_name(file.name.clone());
            if let Some(content_type) = &file.content_type {
                part = part
                    .mime_str(content_type)
                    .map_err(|e| self.failure(format!("bad content type: {e}")))?;
            }
            form = form.part(key, part);
        }

        if let Some(data) = &self.options.data {
            if self.options.dont_use_payload_json && !self.options.use_payload_json {
                if let Some(fields) = data.as_object() {
                    for (key, value) in fields {
                        let text = match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        form = form.text(key.clone(), text);
                    }
                }
            } else {
                let blob = serde_json::to_string(data)
                    .map_err(|e| self.failure(format!("unserializable body: {e}")))?;
                form = form.text("payload_json", blob);
            }
        }
        Ok(form)
    }

    fn failure(&self, message: String) -> RestError {
        RestError::Http(HttpFailure {
            status: None,
            message,
            method: self.method.clone(),
            path: self.route.path().to_owned(),
            source: None,
        })
    }
}
