//! Storage configuration: host directives plus environment fallback.
//!
//! [`S3Options`] collects the raw options from the host's configuration
//! block. [`S3Options::resolve`] fills empty fields from the `S3_*`
//! environment variables and validates the result into [`S3Settings`].
//!
//! ```
//! use certstash_core::config::S3Options;
//!
//! let options = S3Options::parse(
//!     "storage s3 {\n  host s3.local:9000\n  bucket certs\n  prefix acme\n}",
//! )
//! .unwrap();
//! assert_eq!(options.bucket, "certs");
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CertStashError;
use crate::Result;

/// Environment variable consulted when `host` is empty.
pub const ENV_HOST: &str = "S3_HOST";
/// Environment variable consulted when `bucket` is empty.
pub const ENV_BUCKET: &str = "S3_BUCKET";
/// Environment variable consulted when `access_id` is empty.
pub const ENV_ACCESS_ID: &str = "S3_ACCESS_ID";
/// Environment variable consulted when `secret_key` is empty.
pub const ENV_SECRET_KEY: &str = "S3_SECRET_KEY";
/// Environment variable consulted when `prefix` is empty.
pub const ENV_PREFIX: &str = "S3_PREFIX";
/// Environment variable consulted when `insecure` is not set.
pub const ENV_INSECURE: &str = "S3_INSECURE";

/// Default signing region; S3-compatible servers generally ignore it.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default staleness window for lock records: 5 minutes.
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Default retry interval while a lock is held elsewhere: 5 seconds.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How the S3 client obtains credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialMode {
    /// `access_id` / `secret_key` from the configuration or environment.
    #[default]
    Static,
    /// Instance role credentials fetched by the S3 client from the instance
    /// metadata service.
    Instance,
}

impl FromStr for CredentialMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "instance" => Ok(Self::Instance),
            other => Err(format!("expected 'static' or 'instance', got '{other}'")),
        }
    }
}

/// Raw options as written in the host configuration.
///
/// Empty strings and `None` mean "not configured"; those fields fall back
/// to the environment (for the six `S3_*` options) or to defaults.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct S3Options {
    pub host: String,
    pub bucket: String,
    pub access_id: String,
    pub secret_key: String,
    pub prefix: String,
    pub insecure: Option<bool>,
    pub region: Option<String>,
    pub credentials: Option<CredentialMode>,
    pub lock_stale_after: Option<Duration>,
    pub lock_poll_interval: Option<Duration>,
    pub lock_refresh_interval: Option<Duration>,
}

impl fmt::Debug for S3Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Options")
            .field("host", &self.host)
            .field("bucket", &self.bucket)
            .field("access_id", &self.access_id)
            .field("secret_key", &redact(&self.secret_key))
            .field("prefix", &self.prefix)
            .field("insecure", &self.insecure)
            .field("region", &self.region)
            .field("credentials", &self.credentials)
            .field("lock_stale_after", &self.lock_stale_after)
            .field("lock_poll_interval", &self.lock_poll_interval)
            .field("lock_refresh_interval", &self.lock_refresh_interval)
            .finish()
    }
}

impl S3Options {
    /// Parse a configuration block in directive grammar.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_directives(parse_directives(text)?)
    }

    /// Build options from `(key, value)` directives. Unknown keys are ignored.
    pub fn from_directives<I, K, V>(directives: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in directives {
            options.apply(key.as_ref(), value.as_ref())?;
        }
        Ok(options)
    }

    /// Apply a single directive.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "host" => self.host = value.to_string(),
            "bucket" => self.bucket = value.to_string(),
            "access_id" => self.access_id = value.to_string(),
            "secret_key" => self.secret_key = value.to_string(),
            "prefix" => self.prefix = value.to_string(),
            "insecure" => {
                self.insecure = Some(parse_bool(value).map_err(|e| {
                    CertStashError::config(format!("invalid value for 'insecure': {e}"))
                })?);
            }
            "region" => self.region = Some(value.to_string()),
            "credentials" => {
                self.credentials = Some(value.parse().map_err(|e| {
                    CertStashError::config(format!("invalid value for 'credentials': {e}"))
                })?);
            }
            "lock_stale_after" => self.lock_stale_after = Some(duration_option(key, value)?),
            "lock_poll_interval" => self.lock_poll_interval = Some(duration_option(key, value)?),
            "lock_refresh_interval" => {
                self.lock_refresh_interval = Some(duration_option(key, value)?);
            }
            _ => {
                tracing::debug!(option = %key, "Ignoring unknown storage option");
            }
        }
        Ok(())
    }

    /// Resolve against the process environment.
    pub fn resolve(self) -> Result<S3Settings> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve against an arbitrary environment lookup.
    pub fn resolve_with<F>(self, env: F) -> Result<S3Settings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| env(name).filter(|v| !v.is_empty());
        let fallback = |value: String, name: &str| {
            if value.is_empty() {
                lookup(name).unwrap_or_default()
            } else {
                value
            }
        };

        let insecure = match self.insecure {
            Some(insecure) => insecure,
            None => match lookup(ENV_INSECURE) {
                Some(raw) => parse_bool(&raw).map_err(|e| {
                    CertStashError::config(format!(
                        "invalid value for 'insecure' (from {ENV_INSECURE}): {e}"
                    ))
                })?,
                None => false,
            },
        };

        let lock_stale_after = self.lock_stale_after.unwrap_or(DEFAULT_LOCK_STALE_AFTER);
        let settings = S3Settings {
            host: fallback(self.host, ENV_HOST),
            bucket: fallback(self.bucket, ENV_BUCKET),
            access_id: fallback(self.access_id, ENV_ACCESS_ID),
            secret_key: fallback(self.secret_key, ENV_SECRET_KEY),
            prefix: fallback(self.prefix, ENV_PREFIX),
            insecure,
            region: self.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
            credentials: self.credentials.unwrap_or_default(),
            lock: LockSettings {
                stale_after: lock_stale_after,
                poll_interval: self.lock_poll_interval.unwrap_or(DEFAULT_LOCK_POLL_INTERVAL),
                refresh_interval: self.lock_refresh_interval.unwrap_or(lock_stale_after / 3),
            },
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Timing of the distributed lock protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Age after which another instance may reclaim a lock record.
    pub stale_after: Duration,
    /// Base retry interval while the lock is held elsewhere.
    pub poll_interval: Duration,
    /// How often a held lock record is rewritten to stay fresh.
    pub refresh_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_LOCK_STALE_AFTER,
            poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            refresh_interval: DEFAULT_LOCK_STALE_AFTER / 3,
        }
    }
}

/// Fully resolved and validated storage settings.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub host: String,
    pub bucket: String,
    pub access_id: String,
    pub secret_key: String,
    pub prefix: String,
    pub insecure: bool,
    pub region: String,
    pub credentials: CredentialMode,
    pub lock: LockSettings,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("host", &self.host)
            .field("bucket", &self.bucket)
            .field("access_id", &self.access_id)
            .field("secret_key", &redact(&self.secret_key))
            .field("prefix", &self.prefix)
            .field("insecure", &self.insecure)
            .field("region", &self.region)
            .field("credentials", &self.credentials)
            .field("lock", &self.lock)
            .finish()
    }
}

impl S3Settings {
    /// True when the endpoint is reached over HTTPS.
    pub fn secure(&self) -> bool {
        !self.insecure
    }

    /// The endpoint URL handed to the S3 client.
    pub fn endpoint(&self) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{scheme}://{}", self.host)
    }

    /// Check that the settings describe a usable bucket.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(CertStashError::config(format!(
                "'host' is required (or set {ENV_HOST})"
            )));
        }
        if self.host.contains("://") {
            return Err(CertStashError::config(format!(
                "'host' must be host[:port] without a scheme, got '{}'",
                self.host
            )));
        }
        if self.bucket.is_empty() {
            return Err(CertStashError::config(format!(
                "'bucket' is required (or set {ENV_BUCKET})"
            )));
        }
        if self.prefix.starts_with('/') || self.prefix.ends_with('/') || self.prefix.contains("//")
        {
            return Err(CertStashError::config(format!(
                "'prefix' must not start or end with '/' or contain empty segments, got '{}'",
                self.prefix
            )));
        }
        if self.credentials == CredentialMode::Static
            && (self.access_id.is_empty() || self.secret_key.is_empty())
        {
            return Err(CertStashError::config(format!(
                "static credentials need 'access_id' and 'secret_key' (or {ENV_ACCESS_ID} / {ENV_SECRET_KEY})"
            )));
        }
        if self.lock.stale_after.is_zero() || self.lock.poll_interval.is_zero() {
            return Err(CertStashError::config(
                "'lock_stale_after' and 'lock_poll_interval' must be greater than zero",
            ));
        }
        if self.lock.refresh_interval.is_zero() || self.lock.refresh_interval >= self.lock.stale_after {
            return Err(CertStashError::config(
                "'lock_refresh_interval' must be greater than zero and shorter than 'lock_stale_after'",
            ));
        }
        Ok(())
    }
}

/// Split a configuration block into `(key, value)` directives.
///
/// One directive per line; `#` starts a comment; an enclosing
/// `name [args] {` ... `}` block is accepted. Directives without a value
/// are skipped. Values may be double-quoted to carry spaces.
pub fn parse_directives(text: &str) -> Result<Vec<(String, String)>> {
    let mut directives = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let tokens = tokenize(line).map_err(|e| {
            CertStashError::config(format!("line {}: {e}", number + 1))
        })?;

        match tokens.as_slice() {
            [] => {}
            [close] if close == "}" => {}
            [.., open] if open == "{" => {}
            [_key] => {}
            [key, value] => directives.push((key.clone(), value.clone())),
            [key, ..] => {
                return Err(CertStashError::config(format!(
                    "line {}: option '{key}' takes exactly one value",
                    number + 1
                )));
            }
        }
    }

    Ok(directives)
}

/// Split a line into whitespace-separated tokens, honouring double quotes
/// and stopping at a `#` comment.
fn tokenize(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '#' {
            break;
        } else if c == '"' {
            chars.next();
            let mut token = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    other => token.push(other),
                }
            }
            if !closed {
                return Err("unterminated quoted value".to_string());
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }

    Ok(tokens)
}

/// Parse a boolean the way Go's `strconv.ParseBool` does, case-insensitively.
pub fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(format!("expected 'true' or 'false', got '{value}'")),
    }
}

/// Parse a duration such as `250ms`, `30s`, `5m`, `1h` or bare seconds.
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("expected a duration like '30s' or '5m', got '{value}'"))?;

    let seconds_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(amount)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => return Err(format!("unknown duration unit '{other}' in '{value}'")),
    };
    amount
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{value}' is too large"))
}

fn duration_option(key: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| CertStashError::config(format!("invalid value for '{key}': {e}")))
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn base_options() -> S3Options {
        S3Options {
            host: "s3.local".to_string(),
            bucket: "certs".to_string(),
            access_id: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_block() {
        let text = r#"
            storage s3 {
                host s3.local:9000
                bucket certs
                access_id AKIDEXAMPLE
                secret_key "with space"
                prefix acme   # trailing comment
                insecure TRUE
            }
        "#;
        let options = S3Options::parse(text).unwrap();
        assert_eq!(options.host, "s3.local:9000");
        assert_eq!(options.bucket, "certs");
        assert_eq!(options.secret_key, "with space");
        assert_eq!(options.prefix, "acme");
        assert_eq!(options.insecure, Some(true));
    }

    #[test]
    fn test_unknown_and_valueless_directives_are_ignored() {
        let options = S3Options::from_directives([
            ("host", "s3.local"),
            ("colour", "blue"),
        ])
        .unwrap();
        assert_eq!(options.host, "s3.local");

        let directives = parse_directives("bucket\nhost s3.local\n").unwrap();
        assert_eq!(directives, vec![("host".to_string(), "s3.local".to_string())]);
    }

    #[test]
    fn test_too_many_values_is_an_error() {
        let err = parse_directives("host a b\n").unwrap_err();
        assert!(err.to_string().contains("'host'"));
    }

    #[test]
    fn test_malformed_insecure_names_option() {
        let err = S3Options::from_directives([("insecure", "maybe")]).unwrap_err();
        assert!(matches!(err, CertStashError::Config { .. }));
        assert!(err.to_string().contains("insecure"));
    }

    #[test]
    fn test_env_fallback_only_when_empty() {
        let env = env_of(&[
            (ENV_HOST, "env-host"),
            (ENV_BUCKET, "env-bucket"),
            (ENV_PREFIX, "env-prefix"),
        ]);
        let settings = base_options().resolve_with(env).unwrap();
        assert_eq!(settings.host, "s3.local");
        assert_eq!(settings.bucket, "certs");
        assert_eq!(settings.prefix, "env-prefix");
    }

    #[test]
    fn test_env_supplies_everything() {
        let env = env_of(&[
            (ENV_HOST, "minio:9000"),
            (ENV_BUCKET, "certs"),
            (ENV_ACCESS_ID, "id"),
            (ENV_SECRET_KEY, "secret"),
            (ENV_INSECURE, "true"),
        ]);
        let settings = S3Options::default().resolve_with(env).unwrap();
        assert_eq!(settings.host, "minio:9000");
        assert!(settings.insecure);
        assert!(!settings.secure());
        assert_eq!(settings.endpoint(), "http://minio:9000");
        assert_eq!(settings.prefix, "");
    }

    #[test]
    fn test_configured_insecure_false_beats_env() {
        let mut options = base_options();
        options.insecure = Some(false);
        let settings = options
            .resolve_with(env_of(&[(ENV_INSECURE, "true")]))
            .unwrap();
        assert!(!settings.insecure);
        assert_eq!(settings.endpoint(), "https://s3.local");
    }

    #[test]
    fn test_malformed_env_insecure_names_variable() {
        let err = base_options()
            .resolve_with(env_of(&[(ENV_INSECURE, "yes please")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_INSECURE));
    }

    #[test]
    fn test_missing_bucket_fails() {
        let mut options = base_options();
        options.bucket.clear();
        let err = options.resolve_with(env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn test_host_with_scheme_fails() {
        let mut options = base_options();
        options.host = "https://s3.local".to_string();
        assert!(options.resolve_with(env_of(&[])).is_err());
    }

    #[test]
    fn test_prefix_with_separator_edges_fails() {
        for prefix in ["/acme", "acme/", "acme//certs"] {
            let mut options = base_options();
            options.prefix = prefix.to_string();
            let err = options.resolve_with(env_of(&[])).unwrap_err();
            assert!(err.to_string().contains("'prefix'"), "{prefix}");
        }

        let mut nested = base_options();
        nested.prefix = "tenants/acme".to_string();
        assert!(nested.resolve_with(env_of(&[])).is_ok());
    }

    #[test]
    fn test_instance_credentials_need_no_keys() {
        let options = S3Options {
            host: "s3.amazonaws.com".to_string(),
            bucket: "certs".to_string(),
            credentials: Some(CredentialMode::Instance),
            ..Default::default()
        };
        let settings = options.resolve_with(env_of(&[])).unwrap();
        assert_eq!(settings.credentials, CredentialMode::Instance);

        let static_missing = S3Options {
            host: "s3.amazonaws.com".to_string(),
            bucket: "certs".to_string(),
            ..Default::default()
        };
        assert!(static_missing.resolve_with(env_of(&[])).is_err());
    }

    #[test]
    fn test_lock_defaults_and_overrides() {
        let settings = base_options().resolve_with(env_of(&[])).unwrap();
        assert_eq!(settings.lock, LockSettings::default());
        assert_eq!(settings.region, DEFAULT_REGION);

        let mut options = base_options();
        options.apply("lock_stale_after", "90s").unwrap();
        options.apply("lock_poll_interval", "250ms").unwrap();
        let settings = options.resolve_with(env_of(&[])).unwrap();
        assert_eq!(settings.lock.stale_after, Duration::from_secs(90));
        assert_eq!(settings.lock.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.lock.refresh_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_refresh_must_be_shorter_than_staleness() {
        let mut options = base_options();
        options.apply("lock_stale_after", "10s").unwrap();
        options.apply("lock_refresh_interval", "10s").unwrap();
        assert!(options.resolve_with(env_of(&[])).is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("5 fortnights").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("5124095576030432h").is_err());
        assert!(parse_duration("307445734561825861m").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_oversized_duration_names_option() {
        let err = S3Options::parse("lock_stale_after 5124095576030432h").unwrap_err();
        assert!(matches!(err, CertStashError::Config { .. }));
        assert!(err.to_string().contains("lock_stale_after"), "got {err}");
        assert!(err.to_string().contains("too large"), "got {err}");
    }

    #[test]
    fn test_parse_bool_forms() {
        assert_eq!(parse_bool("True"), Ok(true));
        assert_eq!(parse_bool("FALSE"), Ok(false));
        assert_eq!(parse_bool("1"), Ok(true));
        assert!(parse_bool("yes").is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let options = base_options();
        let rendered = format!("{options:?}");
        assert!(!rendered.contains("wJalrXUtnFEMI"));
        assert!(rendered.contains("<redacted>"));

        let settings = options.resolve_with(env_of(&[])).unwrap();
        assert!(!format!("{settings:?}").contains("wJalrXUtnFEMI"));
    }
}
