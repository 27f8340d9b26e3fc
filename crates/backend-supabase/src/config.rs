use std::time::Duration;

use backend_core::{BackendError, BackendErrorCategory, RetryPolicy};
use url::{Host, Url};

pub const DEFAULT_MESSAGES_TABLE: &str = "messages";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const REALTIME_PATH: &str = "/realtime/v1/websocket";
const REALTIME_PROTOCOL_VERSION: &str = "1.0.0";

/// Connection settings for one Supabase project.
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    project_url: Url,
    anon_key: String,
    table: String,
    realtime_endpoint: Url,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_policy: RetryPolicy,
}

impl SupabaseConfig {
    /// Validate the project URL and key. The realtime endpoint is derived from the URL.
    pub fn new(project_url: &str, anon_key: &str) -> Result<Self, BackendError> {
        let project_url = normalize_project_url(project_url)?;
        let anon_key = anon_key.trim();
        if anon_key.is_empty() {
            return Err(config_error(
                "missing_anon_key",
                "Supabase anon key is required",
            ));
        }
        let realtime_endpoint = realtime_endpoint_for(&project_url)?;

        Ok(Self {
            project_url,
            anon_key: anon_key.to_owned(),
            table: DEFAULT_MESSAGES_TABLE.to_owned(),
            realtime_endpoint,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_policy: RetryPolicy::default(),
        })
    }

    /// Use a different table in the `public` schema.
    pub fn with_table(mut self, table: &str) -> Result<Self, BackendError> {
        self.table = validate_table_name(table)?;
        Ok(self)
    }

    /// Point the live subscription at a custom websocket endpoint (`ws://` or `wss://`).
    pub fn with_realtime_endpoint(mut self, endpoint: &str) -> Result<Self, BackendError> {
        let parsed = Url::parse(endpoint.trim()).map_err(|err| {
            config_error(
                "invalid_realtime_endpoint",
                format!("invalid realtime endpoint: {err}"),
            )
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(config_error(
                "invalid_realtime_endpoint",
                "realtime endpoint must use ws:// or wss://",
            ));
        }
        self.realtime_endpoint = parsed;
        Ok(self)
    }

    pub fn project_url(&self) -> &Url {
        &self.project_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// PostgREST URL of the messages table.
    pub fn rest_url(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.project_url.as_str().trim_end_matches('/'),
            self.table
        )
    }

    /// Websocket URL with the key and protocol version attached.
    pub fn realtime_url(&self) -> Url {
        let mut url = self.realtime_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", REALTIME_PROTOCOL_VERSION);
        url
    }
}

/// Normalize a project URL to `https://host[:port]`.
///
/// A bare host gets `https://`. `http://` is kept only for loopback hosts, such as a local
/// Supabase stack on `http://127.0.0.1:54321`; other schemes and remote plain-http hosts are
/// rejected.
pub fn normalize_project_url(raw: &str) -> Result<Url, BackendError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(config_error(
            "missing_project_url",
            "Supabase project URL is required",
        ));
    }

    let candidate = if let Some(rest) = raw.strip_prefix("https://") {
        format!("https://{}", rest.trim())
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("http://{}", rest.trim())
    } else if raw.contains("://") {
        return Err(config_error(
            "invalid_project_url",
            "Supabase project URLs must use https://",
        ));
    } else {
        format!("https://{raw}")
    };

    let parsed = Url::parse(&candidate).map_err(|err| {
        config_error(
            "invalid_project_url",
            format!("invalid Supabase project URL: {err}"),
        )
    })?;
    if parsed.host_str().is_none() {
        return Err(config_error(
            "invalid_project_url",
            "Supabase project URL must include a host, for example xyz.supabase.co",
        ));
    }
    if parsed.scheme() == "http" && !is_loopback(&parsed) {
        return Err(config_error(
            "insecure_project_url",
            "plain http is only allowed for localhost; use https:// for remote projects",
        ));
    }
    Ok(parsed)
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn realtime_endpoint_for(project_url: &Url) -> Result<Url, BackendError> {
    let mut endpoint = project_url.clone();
    let scheme = if project_url.scheme() == "http" { "ws" } else { "wss" };
    endpoint.set_scheme(scheme).map_err(|()| {
        config_error(
            "invalid_project_url",
            "cannot derive a websocket URL from the project URL",
        )
    })?;
    endpoint.set_path(REALTIME_PATH);
    endpoint.set_query(None);
    endpoint.set_fragment(None);
    Ok(endpoint)
}

fn validate_table_name(raw: &str) -> Result<String, BackendError> {
    let table = raw.trim();
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(table.to_owned())
    } else {
        Err(config_error(
            "invalid_table_name",
            format!("'{raw}' is not a plain table name"),
        ))
    }
}

fn config_error(code: &str, message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorCategory::Config, code, message)
}
