//! Per-bucket request worker.
//!
//! Every rate-limit bucket gets one handler: a FIFO queue drained by a
//! worker task that keeps at most one HTTP call in flight. The worker
//! applies the coordinator's decisions (global window, bucket window,
//! invalid-request penalties) and drives the retry loops for 429s, 5xx,
//! captcha challenges, and second-factor demands.

use crate::error::{ApiError, HttpFailure, RestError};
use crate::events::{DiagnosticEvent, RateLimitInfo};
use crate::rest::captcha::{CaptchaChallenge, CaptchaSolution};
use crate::rest::global::INVALID_REQUESTS;
use crate::rest::headers::{RatelimitHeaders, RatelimitScope};
use crate::rest::manager::RestContext;
use crate::rest::request::ApiRequest;
use crate::rest::totp;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Error code for "second factor required".
const MFA_REQUIRED_CODE: u64 = 60_003;

/// A parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Bytes(Vec<u8>),
    Empty,
}

impl ResponseBody {
    /// The JSON value, when the response carried one.
    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Json(value) => value.to_string().into_bytes(),
            Self::Bytes(bytes) => bytes,
            Self::Empty => Vec::new(),
        }
    }
}

/// Rate-limit bookkeeping shared between a handler's worker and the
/// manager's sweeper.
#[derive(Debug)]
pub(crate) struct HandlerState {
    limit: AtomicU32,
    remaining: AtomicI64,
    reset_at_ms: AtomicI64,
    last_used_ms: AtomicI64,
    queued: AtomicU32,
}

impl HandlerState {
    fn new() -> Self {
        Self {
            limit: AtomicU32::new(u32::MAX),
            remaining: AtomicI64::new(i64::MAX),
            reset_at_ms: AtomicI64::new(0),
            last_used_ms: AtomicI64::new(0),
            queued: AtomicU32::new(0),
        }
    }

    pub(crate) fn limit(&self) -> u32 {
        self.limit.load(Ordering::Acquire)
    }

    /// Milliseconds until this bucket opens, or `None` to proceed.
    fn wait_needed_ms(&self, now_unix_ms: i64) -> Option<u64> {
        let reset = self.reset_at_ms.load(Ordering::Acquire);
        if self.remaining.load(Ordering::Acquire) <= 0 && now_unix_ms < reset {
            Some((reset - now_unix_ms) as u64)
        } else {
            None
        }
    }

    /// Fold a response's rate-limit headers into the bucket state. The
    /// values describe the route-wide window, so they apply on every
    /// response — including sublimit 429s, whose `retry_after` is handled
    /// separately without touching this state.
    pub(crate) fn apply(&self, headers: &RatelimitHeaders, reaction_route: bool, now_unix_ms: i64) {
        if let Some(limit) = headers.limit {
            self.limit.store(limit, Ordering::Release);
        }
        if let Some(remaining) = headers.remaining {
            self.remaining.store(i64::from(remaining), Ordering::Release);
        }
        if let Some(reset_at) = headers.reset_at_ms(reaction_route, now_unix_ms) {
            self.reset_at_ms.store(reset_at, Ordering::Release);
        }
        self.last_used_ms.store(now_unix_ms, Ordering::Release);
    }

    #[cfg(test)]
    fn snapshot(&self) -> (u32, i64, i64) {
        (
            self.limit.load(Ordering::Acquire),
            self.remaining.load(Ordering::Acquire),
            self.reset_at_ms.load(Ordering::Acquire),
        )
    }

    /// Whether the handler can be swept: nothing queued, nothing recent.
    pub(crate) fn is_inactive(&self, now_unix_ms: i64, idle_after_ms: u64) -> bool {
        self.queued.load(Ordering::Acquire) == 0
            && now_unix_ms.saturating_sub(self.last_used_ms.load(Ordering::Acquire))
                >= idle_after_ms as i64
            && now_unix_ms >= self.reset_at_ms.load(Ordering::Acquire)
    }
}

struct Job {
    request: ApiRequest,
    reply: oneshot::Sender<Result<ResponseBody, RestError>>,
}

/// Handle to one bucket's serialized queue.
#[derive(Debug, Clone)]
pub(crate) struct Handler {
    jobs: mpsc::UnboundedSender<Job>,
    state: Arc<HandlerState>,
}

impl Handler {
    /// Spawn the worker for a bucket.
    pub(crate) fn spawn(ctx: Arc<RestContext>, key: String) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let state = Arc::new(HandlerState::new());
        tokio::spawn(worker(ctx, key, Arc::clone(&state), rx));
        Self { jobs, state }
    }

    /// Queue a request; the returned channel resolves with its outcome.
    pub(crate) fn submit(
        &self,
        request: ApiRequest,
    ) -> oneshot::Receiver<Result<ResponseBody, RestError>> {
        let (reply, rx) = oneshot::channel();
        self.state.queued.fetch_add(1, Ordering::AcqRel);
        if self.jobs.send(Job { request, reply }).is_err() {
            self.state.queued.fetch_sub(1, Ordering::AcqRel);
        }
        rx
    }

    pub(crate) fn state(&self) -> &Arc<HandlerState> {
        &self.state
    }
}

async fn worker(
    ctx: Arc<RestContext>,
    key: String,
    state: Arc<HandlerState>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    debug!(bucket = %key, "handler worker started");
    while let Some(job) = jobs.recv().await {
        let result = execute(&ctx, &state, job.request).await;
        state.queued.fetch_sub(1, Ordering::AcqRel);
        // The caller may have given up; that is not the worker's problem.
        let _ = job.reply.send(result);
    }
    debug!(bucket = %key, "handler worker stopped");
}

/// Drive one request to completion, honoring every wait and retry rule.
async fn execute(
    ctx: &RestContext,
    state: &HandlerState,
    mut request: ApiRequest,
) -> Result<ResponseBody, RestError> {
    let method = request.method.clone();
    let path = request.route.path().to_owned();
    let bucket_route = request.route.bucket().to_owned();
    let handler_key = request.route.handler_key(&method);
    let reaction_route = request.route.is_reaction_route();
    let webhook = request.options.webhook;
    let offset = ctx.config.time_offset_ms;

    let mut retries: u32 = 0;
    let mut captcha_retries: u32 = 0;
    let mut mfa_retried = false;

    loop {
        // Phase 1: wait out any active limit, or fail fast if the caller
        // opted into rejection.
        loop {
            let now = ctx.clock.unix_millis();
            let (wait_ms, global) = match ctx.globals.wait_needed_ms(now, webhook) {
                Some(wait) => (wait, true),
                None => match state.wait_needed_ms(now) {
                    Some(wait) => (wait, false),
                    None => break,
                },
            };
            let wait_ms = (wait_ms as i64 + offset).max(0) as u64;
            let info = RateLimitInfo {
                timeout_ms: wait_ms,
                limit: if global { ctx.globals.limit() } else { state.limit() },
                method: method.clone(),
                path: path.clone(),
                route: bucket_route.clone(),
                global,
            };
            ctx.bus.emit(DiagnosticEvent::RateLimited(info.clone()));
            if ctx.config.reject_on_rate_limit.rejects(&info) {
                return Err(RestError::RateLimited(info));
            }
            if global {
                ctx.globals.wait_for_reset(now).await;
            } else {
                ctx.sleeper.sleep(Duration::from_millis(wait_ms)).await;
            }
        }

        // Phase 2: global bookkeeping for this attempt.
        ctx.globals.consume(ctx.clock.unix_millis(), webhook);

        // Phase 3: fire the call.
        ctx.bus.emit_with(|| DiagnosticEvent::ApiRequest {
            method: method.clone(),
            path: path.clone(),
            route: bucket_route.clone(),
            retries,
        });

        let builder = request.build(
            &ctx.http_client(),
            &ctx.config,
            &ctx.super_properties(),
            &ctx.auth_token(),
        )?;
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                if retries < ctx.config.retry_limit {
                    retries += 1;
                    ctx.sleeper.sleep(ctx.backoff_server.delay(retries)).await;
                    continue;
                }
                return Err(RestError::Http(HttpFailure {
                    status: None,
                    message: format!("request failed: {e}"),
                    method,
                    path,
                    source: Some(e),
                }));
            }
        };

        let status = response.status().as_u16();
        ctx.bus.emit_with(|| DiagnosticEvent::ApiResponse {
            method: method.clone(),
            path: path.clone(),
            route: bucket_route.clone(),
            status,
        });

        // Phase 4: rate-limit bookkeeping from the response.
        let headers = RatelimitHeaders::parse(response.headers());
        let now = ctx.clock.unix_millis();
        state.apply(&headers, reaction_route, now);
        if let Some(hash) = &headers.bucket {
            ctx.bind_bucket(&handler_key, hash);
        }

        // Phase 5: invalid-request circuit breaker.
        let shared = headers.scope == RatelimitScope::Shared;
        if counts_as_invalid(status, shared) {
            let count = INVALID_REQUESTS.register(now);
            let interval = ctx.config.invalid_request_warning_interval;
            if interval > 0 && count % interval == 0 {
                ctx.bus.emit(DiagnosticEvent::InvalidRequestWarning {
                    count,
                    remaining_ms: INVALID_REQUESTS.remaining_ms(now),
                });
            }
            if let Some(penalty) = crate::rest::global::InvalidRequestTracker::penalty(count) {
                ctx.sleeper.sleep(penalty).await;
            }
        }

        // Phase 6: done.
        if (200..400).contains(&status) {
            return read_body(response).await;
        }

        // Phase 7: 429 resolution.
        if status == 429 {
            let mut retry_after_ms = headers.retry_after_ms();
            let mut global_hit = headers.global || headers.scope == RatelimitScope::Global;

            if retry_after_ms.is_none() {
                // Fall back to the body, which some endpoints use instead
                // of headers.
                let body: Value = response.json().await.unwrap_or(Value::Null);
                if let Some(seconds) = body.get("retry_after").and_then(|v| v.as_f64()) {
                    retry_after_ms = Some((seconds * 1_000.0) as u64);
                }
                if body.get("global").and_then(|v| v.as_bool()).unwrap_or(false) {
                    global_hit = true;
                }
            }

            if global_hit {
                let until = now + retry_after_ms.unwrap_or(1_000) as i64;
                ctx.globals.mark_limited_until(until);
                warn!(%method, %path, "globally rate limited for {}ms", retry_after_ms.unwrap_or(1_000));
            } else if shared {
                debug!(%method, %path, "shared-scope 429, retrying after window");
            } else {
                // Route sublimit: sleep locally without touching the
                // bucket's route-wide state.
                debug!(%method, %path, "sublimited for {:?}ms", retry_after_ms);
            }

            let delay = retry_after_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| ctx.backoff_ratelimit.delay(retries));
            ctx.sleeper.sleep(delay).await;
            retries += 1;
            continue;
        }

        // Phase 8: other 4xx — captcha and second-factor loops first.
        if (400..500).contains(&status) {
            let body: Value = response.json().await.unwrap_or(Value::Null);

            if let Some(challenge) = CaptchaChallenge::from_body(&body) {
                if let Some(solver) = &ctx.config.captcha_solver {
                    if challenge.is_retryable()
                        && captcha_retries < ctx.config.captcha_retry_limit
                    {
                        match solver.solve(&challenge, ctx.config.user_agent()).await {
                            Ok(key) => {
                                request.captcha = Some(CaptchaSolution {
                                    key,
                                    rqtoken: challenge.captcha_rqtoken.clone(),
                                });
                                captcha_retries += 1;
                                debug!(%method, %path, captcha_retries, "retrying with solved captcha");
                                continue;
                            }
                            Err(e) => {
                                // Out of solves; the original API error
                                // falls through below.
                                warn!(%method, %path, error = %e, "captcha solver failed");
                            }
                        }
                    }
                }
            }

            let mfa_required =
                body.get("code").and_then(|v| v.as_u64()) == Some(MFA_REQUIRED_CODE);
            if mfa_required && !request.options.no_auth && !mfa_retried {
                if let Some(token) = second_factor_token(ctx, &body).await {
                    request.mfa_authorization = Some(token);
                    mfa_retried = true;
                    debug!(%method, %path, "retrying with second-factor token");
                    continue;
                }
            }

            return Err(RestError::Api(ApiError::from_body(body, status, method, path)));
        }

        // Phase 9: 5xx with bounded backoff.
        if retries < ctx.config.retry_limit {
            retries += 1;
            ctx.sleeper.sleep(ctx.backoff_server.delay(retries)).await;
            continue;
        }
        return Err(RestError::Http(HttpFailure {
            status: Some(status),
            message: format!("server error after {retries} retries"),
            method,
            path,
            source: None,
        }));
    }
}

/// Whether a response status feeds the invalid-request counter.
/// Shared-scope 429s are someone else's traffic and never count.
fn counts_as_invalid(status: u16, shared_scope: bool) -> bool {
    matches!(status, 401 | 403) || (status == 429 && !shared_scope)
}

/// Complete the TOTP second-factor exchange, returning the short-lived
/// authorization token. `None` when the offer cannot be satisfied (no
/// TOTP key configured, TOTP not among the offered methods, or the
/// verify call failed) — the original API error then surfaces unchanged.
async fn second_factor_token(ctx: &RestContext, body: &Value) -> Option<String> {
    let totp_key = ctx.config.totp_key.as_ref()?;
    let mfa = &body["mfa"];
    let ticket = mfa["ticket"].as_str()?;
    let offers_totp = mfa["methods"].as_array().map(|methods| {
        methods
            .iter()
            .any(|m| m.get("type").and_then(|t| t.as_str()) == Some("totp"))
    })?;
    if !offers_totp {
        return None;
    }

    let code = match totp::generate(totp_key, (ctx.clock.unix_millis() / 1_000) as u64) {
        Ok(code) => code,
        Err(e) => {
            warn!(error = %e, "cannot generate TOTP code");
            return None;
        }
    };

    let url = format!(
        "{}/v{}/mfa/finish",
        ctx.config.api.trim_end_matches('/'),
        ctx.config.version
    );
    let response = ctx
        .http_client()
        .post(url)
        .header("Authorization", ctx.auth_token())
        .json(&serde_json::json!({
            "ticket": ticket,
            "mfa_type": "totp",
            "data": code,
        }))
        .send()
        .await;

    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!(status = %response.status(), "second-factor verify rejected");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "second-factor verify failed");
            return None;
        }
    };
    let body: Value = response.json().await.ok()?;
    body.get("token").and_then(|t| t.as_str()).map(str::to_owned)
}

/// Parse a success body: JSON when the content type says so, raw bytes
/// otherwise, empty for 204s.
async fn read_body(response: reqwest::Response) -> Result<ResponseBody, RestError> {
    if response.status().as_u16() == 204 {
        return Ok(ResponseBody::Empty);
    }
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);

    if is_json {
        let value = response
            .json()
            .await
            .map_err(|e| RestError::Http(HttpFailure {
                status: None,
                message: format!("undecodable body: {e}"),
                method: String::new(),
                path: String::new(),
                source: Some(e),
            }))?;
        Ok(ResponseBody::Json(value))
    } else {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RestError::Http(HttpFailure {
                status: None,
                message: format!("unreadable body: {e}"),
                method: String::new(),
                path: String::new(),
                source: Some(e),
            }))?;
        Ok(ResponseBody::Bytes(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> RatelimitHeaders {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                name.parse::<HeaderName>().expect("name"),
                HeaderValue::from_str(value).expect("value"),
            );
        }
        RatelimitHeaders::parse(&map)
    }

    #[test]
    fn fresh_state_never_waits() {
        let state = HandlerState::new();
        assert_eq!(state.wait_needed_ms(1_000), None);
    }

    #[test]
    fn drained_bucket_waits_until_reset() {
        let state = HandlerState::new();
        state.apply(
            &headers(&[
                ("x-ratelimit-limit", "5"),
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset-after", "60"),
            ]),
            false,
            1_000,
        );

        assert_eq!(state.wait_needed_ms(2_000), Some(59_000));
        // Past the reset, requests flow again.
        assert_eq!(state.wait_needed_ms(61_001), None);
    }

    #[test]
    fn sublimit_429_headers_keep_route_state_intact() {
        // A 429 on a route whose headers still show budget: the stored
        // remaining/reset must mirror the headers (4 / now+60s), not be
        // zeroed by the 429 itself.
        let state = HandlerState::new();
        state.apply(
            &headers(&[
                ("x-ratelimit-limit", "5"),
                ("x-ratelimit-remaining", "4"),
                ("x-ratelimit-reset-after", "60"),
                ("retry-after", "5"),
            ]),
            false,
            10_000,
        );

        let (limit, remaining, reset_at) = state.snapshot();
        assert_eq!(limit, 5);
        assert_eq!(remaining, 4);
        assert_eq!(reset_at, 70_000);
        // Route-wide state says "go"; only the sublimit sleep stalls the
        // one retried request.
        assert_eq!(state.wait_needed_ms(10_001), None);
    }

    #[test]
    fn missing_headers_leave_state_untouched() {
        let state = HandlerState::new();
        state.apply(
            &headers(&[
                ("x-ratelimit-limit", "5"),
                ("x-ratelimit-remaining", "2"),
                ("x-ratelimit-reset-after", "10"),
            ]),
            false,
            0,
        );
        // A later response with no rate-limit headers at all.
        state.apply(&headers(&[]), false, 5);

        let (limit, remaining, reset_at) = state.snapshot();
        assert_eq!(limit, 5);
        assert_eq!(remaining, 2);
        assert_eq!(reset_at, 10_000);
    }

    #[test]
    fn inactivity_requires_idle_queue_and_past_reset() {
        let state = HandlerState::new();
        state.apply(
            &headers(&[
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset-after", "10"),
            ]),
            false,
            0,
        );

        // Recently used.
        assert!(!state.is_inactive(5_000, 60_000));
        // Idle long enough and past the reset.
        assert!(state.is_inactive(120_000, 60_000));

        // A queued job blocks sweeping no matter the clock.
        state.queued.fetch_add(1, Ordering::AcqRel);
        assert!(!state.is_inactive(120_000, 60_000));
    }

    #[test]
    fn shared_scope_429_is_not_an_invalid_request() {
        assert!(counts_as_invalid(401, false));
        assert!(counts_as_invalid(403, false));
        assert!(counts_as_invalid(429, false));
        assert!(!counts_as_invalid(429, true));
        // The shared flag only matters for 429s.
        assert!(counts_as_invalid(401, true));
        assert!(!counts_as_invalid(404, false));
        assert!(!counts_as_invalid(500, false));
    }

    #[test]
    fn response_body_accessors() {
        let json = ResponseBody::Json(serde_json::json!({"id": "1"}));
        assert_eq!(json.clone().into_json().unwrap()["id"], "1");
        assert_eq!(json.into_bytes(), br#"{"id":"1"}"#.to_vec());

        let bytes = ResponseBody::Bytes(vec![1, 2, 3]);
        assert_eq!(bytes.clone().into_json(), None);
        assert_eq!(bytes.into_bytes(), vec![1, 2, 3]);

        assert_eq!(ResponseBody::Empty.into_bytes(), Vec::<u8>::new());
    }
}
