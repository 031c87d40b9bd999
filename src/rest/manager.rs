//! REST manager: handler registry, bucket binding, shared caches, and the
//! sweeper.

use crate::backoff::RetryBackoff;
use crate::clock::{Clock, SystemClock};
use crate::config::{HttpOptions, ProxySpec};
use crate::error::{HttpFailure, RestError};
use crate::events::EventBus;
use crate::rest::global::GlobalLimiter;
use crate::rest::handler::{Handler, ResponseBody};
use crate::rest::request::{ApiRequest, RequestOptions};
use crate::rest::route::Route;
use crate::sleeper::{Sleeper, TokioSleeper};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::HeaderValue;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Shared state every handler worker needs: the HTTP client, caches, the
/// global limiter, and the bucket-hash bindings discovered from response
/// headers.
pub struct RestContext {
    pub config: HttpOptions,
    pub globals: GlobalLimiter,
    pub bus: EventBus,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    pub backoff_ratelimit: RetryBackoff,
    pub backoff_server: RetryBackoff,
    client: Mutex<reqwest::Client>,
    cookie_jar: Arc<reqwest::cookie::Jar>,
    token: Mutex<String>,
    auth_cache: Mutex<Option<(String, String)>>,
    super_cache: Mutex<Option<(u64, String)>>,
    /// `METHOD:bucket-route` to server bucket hash.
    bindings: Mutex<HashMap<String, String>>,
}

impl RestContext {
    fn new(
        config: HttpOptions,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, RestError> {
        let cookie_jar = Arc::new(reqwest::cookie::Jar::default());
        let client = build_client(config.agent.as_ref(), Arc::clone(&cookie_jar))?;
        let token = config.token.clone();
        Ok(Self {
            globals: GlobalLimiter::new(config.global_rate_limit),
            bus,
            clock,
            sleeper,
            backoff_ratelimit: RetryBackoff::ratelimited(),
            backoff_server: RetryBackoff::server_error(),
            client: Mutex::new(client),
            cookie_jar,
            token: Mutex::new(token),
            auth_cache: Mutex::new(None),
            super_cache: Mutex::new(None),
            bindings: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// The HTTP client (cheap handle clone).
    pub fn http_client(&self) -> reqwest::Client {
        lock(&self.client).clone()
    }

    /// The resolved authorization value, cached per token. A `Bot `
    /// prefix is stripped; this client authenticates as a user.
    pub fn auth_token(&self) -> String {
        let raw = lock(&self.token).clone();
        let mut cache = lock(&self.auth_cache);
        if let Some((cached_raw, resolved)) = cache.as_ref() {
            if *cached_raw == raw {
                return resolved.clone();
            }
        }
        let resolved = raw.strip_prefix("Bot ").unwrap_or(&raw).to_owned();
        *cache = Some((raw, resolved.clone()));
        resolved
    }

    /// The base64 super-properties header, rebuilt when the user agent or
    /// the properties change.
    pub fn super_properties(&self) -> String {
        let blob = self.config.properties.super_properties().to_string();
        let mut hasher = DefaultHasher::new();
        self.config.user_agent().hash(&mut hasher);
        blob.hash(&mut hasher);
        let fingerprint = hasher.finish();

        let mut cache = lock(&self.super_cache);
        if let Some((cached_fingerprint, encoded)) = cache.as_ref() {
            if *cached_fingerprint == fingerprint {
                return encoded.clone();
            }
        }
        let encoded = BASE64.encode(blob);
        *cache = Some((fingerprint, encoded.clone()));
        encoded
    }

    /// Record a server-revealed bucket hash for a handler key.
    pub fn bind_bucket(&self, handler_key: &str, hash: &str) {
        let mut bindings = lock(&self.bindings);
        let previous = bindings.insert(handler_key.to_owned(), hash.to_owned());
        if previous.as_deref() != Some(hash) {
            debug!(key = handler_key, hash, "bucket hash bound");
        }
    }

    /// The routing key for a request: the discovered bucket hash when one
    /// is known, otherwise the method-qualified bucket route.
    pub fn resolve_key(&self, handler_key: &str) -> String {
        lock(&self.bindings)
            .get(handler_key)
            .cloned()
            .unwrap_or_else(|| handler_key.to_owned())
    }

    fn replace_token(&self, token: String) {
        *lock(&self.token) = token;
        *lock(&self.auth_cache) = None;
    }

    fn replace_client(&self, agent: Option<&ProxySpec>) -> Result<(), RestError> {
        // Same jar, new client, so cookies survive proxy changes.
        let client = build_client(agent, Arc::clone(&self.cookie_jar))?;
        *lock(&self.client) = client;
        Ok(())
    }

    fn prune_bindings(&self, live: &HashMap<String, Handler>) {
        lock(&self.bindings).retain(|key, hash| live.contains_key(hash) || live.contains_key(key));
    }
}

impl std::fmt::Debug for RestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestContext")
            .field("config", &self.config)
            .field("globals", &self.globals)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn build_client(
    agent: Option<&ProxySpec>,
    jar: Arc<reqwest::cookie::Jar>,
) -> Result<reqwest::Client, RestError> {
    let mut builder = reqwest::Client::builder().cookie_provider(jar);
    if let Some(spec) = agent {
        let mut proxy = reqwest::Proxy::all(spec.uri()).map_err(|e| client_error(e))?;
        if let ProxySpec::WithHeaders { headers, .. } = spec {
            for (name, value) in headers {
                if name.eq_ignore_ascii_case("proxy-authorization") {
                    if let Ok(value) = HeaderValue::from_str(value) {
                        proxy = proxy.custom_http_auth(value);
                    }
                }
            }
        }
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(client_error)
}

fn client_error(e: reqwest::Error) -> RestError {
    RestError::Http(HttpFailure {
        status: None,
        message: format!("cannot build HTTP client: {e}"),
        method: String::new(),
        path: String::new(),
        source: Some(e),
    })
}

/// The REST request issuer.
///
/// Owns the per-bucket handler registry and a background sweeper that
/// drops idle handlers and orphaned bucket bindings. Dropping the `Rest`
/// stops the sweeper.
#[derive(Debug)]
pub struct Rest {
    ctx: Arc<RestContext>,
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl Rest {
    /// Build the REST pipeline with production clock and sleeper. Must be
    /// called from within a tokio runtime.
    pub fn new(config: HttpOptions) -> Result<Self, RestError> {
        Self::with_parts(
            config,
            EventBus::new(),
            Arc::new(SystemClock::default()),
            Arc::new(TokioSleeper),
        )
    }

    /// Build with explicit bus, clock, and sleeper (the test seam).
    pub fn with_parts(
        config: HttpOptions,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, RestError> {
        let sweep_every = Duration::from_millis(config.sweep_interval_ms.max(1_000));
        let ctx = Arc::new(RestContext::new(config, bus, clock, sleeper)?);
        let handlers: Arc<Mutex<HashMap<String, Handler>>> = Arc::new(Mutex::new(HashMap::new()));

        let sweeper = tokio::spawn(sweep_loop(
            Arc::downgrade(&ctx),
            Arc::downgrade(&handlers),
            sweep_every,
        ));

        Ok(Self { ctx, handlers, sweeper })
    }

    pub fn bus(&self) -> &EventBus {
        &self.ctx.bus
    }

    /// Issue a request. Queued FIFO behind everything else bound for the
    /// same rate-limit bucket.
    pub async fn request(
        &self,
        method: &str,
        route: Route,
        options: RequestOptions,
    ) -> Result<ResponseBody, RestError> {
        let request = ApiRequest::new(method, route, options);
        let key = self.ctx.resolve_key(&request.route.handler_key(&request.method));

        let handler = {
            let mut handlers = lock(&self.handlers);
            handlers
                .entry(key.clone())
                .or_insert_with(|| Handler::spawn(Arc::clone(&self.ctx), key))
                .clone()
        };

        handler.submit(request).await.map_err(|_| RestError::QueueClosed)?
    }

    pub async fn get(&self, route: Route, options: RequestOptions) -> Result<ResponseBody, RestError> {
        self.request("GET", route, options).await
    }

    pub async fn post(&self, route: Route, options: RequestOptions) -> Result<ResponseBody, RestError> {
        self.request("POST", route, options).await
    }

    pub async fn patch(&self, route: Route, options: RequestOptions) -> Result<ResponseBody, RestError> {
        self.request("PATCH", route, options).await
    }

    pub async fn put(&self, route: Route, options: RequestOptions) -> Result<ResponseBody, RestError> {
        self.request("PUT", route, options).await
    }

    pub async fn delete(&self, route: Route, options: RequestOptions) -> Result<ResponseBody, RestError> {
        self.request("DELETE", route, options).await
    }

    /// Swap the account token; the auth cache rebuilds on next use.
    pub fn set_token(&self, token: impl Into<String>) {
        self.ctx.replace_token(token.into());
    }

    /// Swap the proxy configuration. Cookies carry over.
    pub fn set_agent(&self, agent: Option<ProxySpec>) -> Result<(), RestError> {
        self.ctx.replace_client(agent.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &Arc<RestContext> {
        &self.ctx
    }
}

impl Drop for Rest {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn sweep_loop(
    ctx: std::sync::Weak<RestContext>,
    handlers: std::sync::Weak<Mutex<HashMap<String, Handler>>>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let (Some(ctx), Some(handlers)) = (ctx.upgrade(), handlers.upgrade()) else {
            return;
        };
        let now = ctx.clock.unix_millis();
        let idle_after = ctx.config.sweep_interval_ms;
        let mut handlers = lock(&handlers);
        let before = handlers.len();
        handlers.retain(|_, handler| !handler.state().is_inactive(now, idle_after));
        let swept = before - handlers.len();
        if swept > 0 {
            debug!(swept, remaining = handlers.len(), "swept idle handlers");
        }
        ctx.prune_bindings(&handlers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rest() -> Rest {
        Rest::new(HttpOptions::new("secret-token")).expect("client builds")
    }

    #[tokio::test]
    async fn auth_token_is_cached_and_stripped() {
        let rest = rest();
        assert_eq!(rest.context().auth_token(), "secret-token");
        // Cached path returns the same resolution.
        assert_eq!(rest.context().auth_token(), "secret-token");

        rest.set_token("Bot abc123");
        assert_eq!(rest.context().auth_token(), "abc123");
    }

    #[tokio::test]
    async fn super_properties_decode_back_to_the_config() {
        let rest = rest();
        let encoded = rest.context().super_properties();
        // Cache hit returns the identical blob.
        assert_eq!(rest.context().super_properties(), encoded);

        let decoded = BASE64.decode(&encoded).expect("valid base64");
        let value: serde_json::Value = serde_json::from_slice(&decoded).expect("valid json");
        assert_eq!(value["browser"], "Chrome");
        assert_eq!(value["release_channel"], "stable");
    }

    #[tokio::test]
    async fn bucket_binding_redirects_the_handler_key() {
        let rest = rest();
        let route = Route::from_segments(["channels", "111111111111111111", "messages"]);
        let key = route.handler_key("POST");

        // Before discovery the key routes to itself.
        assert_eq!(rest.context().resolve_key(&key), key);

        rest.context().bind_bucket(&key, "hash-77");
        assert_eq!(rest.context().resolve_key(&key), "hash-77");

        // Another route with the same bucket key shares the hash.
        let sibling = Route::from_segments(["channels", "111111111111111111", "messages"]);
        assert_eq!(rest.context().resolve_key(&sibling.handler_key("POST")), "hash-77");
    }

    #[tokio::test]
    async fn proxy_swap_keeps_working() {
        let rest = rest();
        rest.set_agent(Some(ProxySpec::Uri("http://127.0.0.1:9".to_owned())))
            .expect("proxy accepted");
        rest.set_agent(None).expect("proxy removed");
    }

    #[tokio::test]
    async fn bad_proxy_uri_is_an_error() {
        let rest = rest();
        assert!(rest.set_agent(Some(ProxySpec::Uri("::not a uri::".to_owned()))).is_err());
    }
}
