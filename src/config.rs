//! Client configuration for the gateway and REST surfaces.

use crate::events::RateLimitInfo;
use crate::rest::captcha::CaptchaSolver;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Client identity sent in IDENTIFY properties and the REST
/// super-properties header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
    pub system_locale: String,
    pub browser_user_agent: String,
    pub browser_version: String,
    pub os_version: String,
    pub client_build_number: u64,
}

impl Default for ClientProperties {
    fn default() -> Self {
        let user_agent = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            .to_owned();
        Self {
            os: "Windows".to_owned(),
            browser: "Chrome".to_owned(),
            device: String::new(),
            system_locale: "en-US".to_owned(),
            browser_version: "120.0.0.0".to_owned(),
            os_version: "10".to_owned(),
            client_build_number: 263_582,
            browser_user_agent: user_agent,
        }
    }
}

impl ClientProperties {
    /// The JSON blob behind the `X-Super-Properties` header.
    pub fn super_properties(&self) -> serde_json::Value {
        json!({
            "os": self.os,
            "browser": self.browser,
            "device": self.device,
            "system_locale": self.system_locale,
            "browser_user_agent": self.browser_user_agent,
            "browser_version": self.browser_version,
            "os_version": self.os_version,
            "referrer": "",
            "referring_domain": "",
            "referrer_current": "",
            "referring_domain_current": "",
            "release_channel": "stable",
            "client_build_number": self.client_build_number,
            "client_event_source": serde_json::Value::Null,
        })
    }

    /// The `properties` object for IDENTIFY.
    pub fn identify_properties(&self) -> serde_json::Value {
        json!({
            "os": self.os,
            "browser": self.browser,
            "device": self.device,
        })
    }

    /// Browser platform label for browser-like request headers.
    pub fn platform_label(&self) -> &'static str {
        match self.os.to_ascii_lowercase().as_str() {
            "windows" => "Windows",
            "macos" | "mac os x" | "darwin" => "macOS",
            "android" => "Android",
            "ios" => "iOS",
            _ => "Linux",
        }
    }

    /// Major version inferred from the user agent, e.g. `120` out of
    /// `Chrome/120.0.0.0`.
    pub fn browser_major(&self) -> Option<u32> {
        let ua = &self.browser_user_agent;
        let idx = ua.find("Chrome/")?;
        let rest = &ua[idx + "Chrome/".len()..];
        let major: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        major.parse().ok()
    }
}

/// Outbound frame pacing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Sends allowed per window.
    pub capacity: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Consecutive important dispatches allowed while normal traffic
    /// waits.
    pub important_burst: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self { capacity: 120, window_ms: 60_000, important_burst: 3 }
    }
}

/// Gateway (websocket) configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub gateway_url: String,
    pub version: u8,
    pub encoding: String,
    /// Negotiate zlib-stream transport compression.
    pub compress: bool,
    pub intents: u64,
    pub properties: ClientProperties,
    pub scheduler: SchedulerOptions,
    /// Use the extended heartbeat payload shape. Off by default; the
    /// server does not document when it is negotiated.
    pub use_qos_heartbeat: bool,
    /// How long after READY to wait for expected guilds before promoting
    /// the shard to ready anyway.
    pub wait_guild_timeout_ms: u64,
    /// How long to wait for a close frame after issuing one before
    /// synthesizing the close locally.
    pub close_timeout_ms: u64,
    /// Initial presence sent with IDENTIFY.
    pub initial_presence: Option<serde_json::Value>,
    pub shard_id: u16,
    pub shard_count: u16,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            gateway_url: "wss://gateway.discord.gg".to_owned(),
            version: 9,
            encoding: "json".to_owned(),
            compress: true,
            intents: 0,
            properties: ClientProperties::default(),
            scheduler: SchedulerOptions::default(),
            use_qos_heartbeat: false,
            wait_guild_timeout_ms: 15_000,
            close_timeout_ms: 5_000,
            initial_presence: None,
            shard_id: 0,
            shard_count: 1,
        }
    }

    pub fn with_intents(mut self, intents: u64) -> Self {
        self.intents = intents;
        self
    }

    pub fn with_shard(mut self, id: u16, count: u16) -> Self {
        self.shard_id = id;
        self.shard_count = count.max(1);
        self
    }

    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    /// Whether the GUILDS intent bit is set; without it READY never
    /// announces guilds and the guild-wait phase is skipped.
    pub fn wants_guilds(&self) -> bool {
        self.intents & 1 != 0
    }
}

/// Proxy configuration for the REST client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySpec {
    /// A plain proxy URI.
    Uri(String),
    /// A proxy URI plus headers to send with CONNECT.
    WithHeaders { uri: String, headers: Vec<(String, String)> },
}

impl ProxySpec {
    pub fn uri(&self) -> &str {
        match self {
            Self::Uri(uri) => uri,
            Self::WithHeaders { uri, .. } => uri,
        }
    }
}

/// What to do when a request would have to wait on a rate limit.
#[derive(Clone, Default)]
pub enum RejectPolicy {
    /// Wait transparently.
    #[default]
    Never,
    /// Reject when the bucket route starts with any of these prefixes.
    RoutePrefixes(Vec<String>),
    /// Reject when the predicate matches.
    Predicate(Arc<dyn Fn(&RateLimitInfo) -> bool + Send + Sync>),
}

impl RejectPolicy {
    pub fn rejects(&self, info: &RateLimitInfo) -> bool {
        match self {
            Self::Never => false,
            Self::RoutePrefixes(prefixes) => {
                prefixes.iter().any(|p| info.route.starts_with(p.as_str()))
            }
            Self::Predicate(predicate) => predicate(info),
        }
    }
}

impl std::fmt::Debug for RejectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "RejectPolicy::Never"),
            Self::RoutePrefixes(p) => f.debug_tuple("RejectPolicy::RoutePrefixes").field(p).finish(),
            Self::Predicate(_) => write!(f, "RejectPolicy::Predicate(..)"),
        }
    }
}

/// REST pipeline configuration.
#[derive(Clone)]
pub struct HttpOptions {
    pub token: String,
    /// API origin, without the version suffix.
    pub api: String,
    /// CDN origin for attachment and asset URLs.
    pub cdn: String,
    pub version: u8,
    /// Extra headers merged into every request.
    pub headers: HashMap<String, String>,
    pub properties: ClientProperties,
    pub agent: Option<ProxySpec>,
    /// Client-side global request allowance per second.
    pub global_rate_limit: u32,
    pub request_timeout_ms: u64,
    /// Padding added to every computed reset deadline, absorbing local
    /// timer skew.
    pub time_offset_ms: i64,
    pub sweep_interval_ms: u64,
    pub retry_limit: u32,
    pub invalid_request_warning_interval: u32,
    pub captcha_retry_limit: u32,
    pub captcha_solver: Option<Arc<dyn CaptchaSolver>>,
    /// Base32 TOTP secret for the second-factor retry loop.
    pub totp_key: Option<String>,
    pub reject_on_rate_limit: RejectPolicy,
    /// Reported in the `X-Discord-Timezone` header when set.
    pub timezone: Option<String>,
}

impl HttpOptions {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api: "https://discord.com/api".to_owned(),
            cdn: "https://cdn.discordapp.com".to_owned(),
            version: 9,
            headers: HashMap::new(),
            properties: ClientProperties::default(),
            agent: None,
            global_rate_limit: 50,
            request_timeout_ms: 15_000,
            time_offset_ms: 0,
            sweep_interval_ms: 60_000,
            retry_limit: 3,
            invalid_request_warning_interval: 500,
            captcha_retry_limit: 3,
            captcha_solver: None,
            totp_key: None,
            reject_on_rate_limit: RejectPolicy::Never,
            timezone: None,
        }
    }

    /// The user agent for outbound requests.
    pub fn user_agent(&self) -> &str {
        self.headers
            .get("User-Agent")
            .map(String::as_str)
            .unwrap_or(&self.properties.browser_user_agent)
    }
}

impl std::fmt::Debug for HttpOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOptions")
            .field("api", &self.api)
            .field("version", &self.version)
            .field("token", &"<redacted>")
            .field("agent", &self.agent)
            .field("global_rate_limit", &self.global_rate_limit)
            .field("retry_limit", &self.retry_limit)
            .field("reject_on_rate_limit", &self.reject_on_rate_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_major_is_parsed_from_user_agent() {
        let props = ClientProperties::default();
        assert_eq!(props.browser_major(), Some(120));
    }

    #[test]
    fn browser_major_handles_foreign_user_agents() {
        let props = ClientProperties {
            browser_user_agent: "curl/8.0".to_owned(),
            ..ClientProperties::default()
        };
        assert_eq!(props.browser_major(), None);
    }

    #[test]
    fn platform_label_maps_known_systems() {
        let mut props = ClientProperties::default();
        assert_eq!(props.platform_label(), "Windows");

        props.os = "macOS".to_owned();
        assert_eq!(props.platform_label(), "macOS");

        props.os = "freebsd".to_owned();
        assert_eq!(props.platform_label(), "Linux");
    }

    #[test]
    fn super_properties_carry_the_build_number() {
        let props = ClientProperties::default();
        let blob = props.super_properties();
        assert_eq!(blob["client_build_number"], 263_582);
        assert_eq!(blob["browser"], "Chrome");
    }

    #[test]
    fn reject_policy_matches_route_prefixes() {
        let policy = RejectPolicy::RoutePrefixes(vec!["/channels".into()]);
        let mut info = crate::events::RateLimitInfo {
            timeout_ms: 1,
            limit: 1,
            method: "GET".into(),
            path: "/channels/1".into(),
            route: "/channels/1".into(),
            global: false,
        };
        assert!(policy.rejects(&info));

        info.route = "/guilds/1".into();
        assert!(!policy.rejects(&info));
    }

    #[test]
    fn reject_policy_predicate_sees_global_flag() {
        let policy = RejectPolicy::Predicate(Arc::new(|info| info.global));
        let info = crate::events::RateLimitInfo {
            timeout_ms: 1,
            limit: 1,
            method: "GET".into(),
            path: "/users/@me".into(),
            route: "/users/@me".into(),
            global: true,
        };
        assert!(policy.rejects(&info));
    }

    #[test]
    fn user_agent_prefers_explicit_header() {
        let mut options = HttpOptions::new("token");
        assert!(options.user_agent().contains("Chrome"));

        options.headers.insert("User-Agent".into(), "custom/1.0".into());
        assert_eq!(options.user_agent(), "custom/1.0");
    }

    #[test]
    fn gateway_config_detects_guilds_intent() {
        let config = GatewayConfig::new("t");
        assert!(!config.wants_guilds());
        assert!(config.with_intents(1).wants_guilds());
    }
}
