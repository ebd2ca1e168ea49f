//! Built-in redactors.
//!
//! The teacher has no redaction stage; these are modeled on its
//! `backend/filtering.rs` free-function style (pure functions over a
//! record's fields) lifted onto the dynamic [`crate::envelope::Value`]
//! tree and wired through the [`crate::pipeline::Redactor`] trait.

use ahash::AHashMap;
use async_trait::async_trait;
use regex::Regex;

use crate::envelope::{Envelope, Value};
use crate::pipeline::{OnError, RedactOutcome, Redactor};

#[derive(Debug, Clone)]
enum Segment {
    Exact(String),
    Wildcard,
}

fn parse_path(path: &str) -> Vec<Segment> {
    path.split('.')
        .map(|seg| if seg == "*" { Segment::Wildcard } else { Segment::Exact(seg.to_string()) })
        .collect()
}

struct ScanState {
    keys_scanned: usize,
    max_keys: usize,
    max_depth: usize,
    cap_exceeded: bool,
}

/// Masks values at allow-listed dotted paths (`*` wildcards any segment),
/// bounded by a depth cap and a total key-scan cap.
pub struct FieldMaskRedactor {
    paths: Vec<Vec<Segment>>,
    mask_token: String,
    on_error: OnError,
    max_depth: usize,
    max_keys: usize,
}

impl FieldMaskRedactor {
    pub fn new(paths: &[&str], mask_token: impl Into<String>, on_error: OnError) -> Self {
        Self {
            paths: paths.iter().map(|p| parse_path(p)).collect(),
            mask_token: mask_token.into(),
            on_error,
            max_depth: 16,
            max_keys: 1000,
        }
    }

    pub fn with_caps(mut self, max_depth: usize, max_keys: usize) -> Self {
        self.max_depth = max_depth;
        self.max_keys = max_keys;
        self
    }

    fn redact_map(map: &mut AHashMap<String, Value>, active: &[&[Segment]], depth: usize, state: &mut ScanState, mask_token: &str) {
        if state.cap_exceeded || depth > state.max_depth {
            state.cap_exceeded = true;
            return;
        }
        for (k, v) in map.iter_mut() {
            if state.cap_exceeded {
                return;
            }
            state.keys_scanned += 1;
            if state.keys_scanned > state.max_keys {
                state.cap_exceeded = true;
                return;
            }
            let mut next: Vec<&[Segment]> = Vec::new();
            let mut hit = false;
            for segs in active {
                if segs.is_empty() {
                    continue;
                }
                let matches = match &segs[0] {
                    Segment::Exact(s) => s == k,
                    Segment::Wildcard => true,
                };
                if matches {
                    let rest = &segs[1..];
                    if rest.is_empty() {
                        hit = true;
                    } else {
                        next.push(rest);
                    }
                }
            }
            if hit {
                *v = Value::Str(mask_token.to_string());
            } else if !next.is_empty() {
                if let Value::Map(inner) = v {
                    Self::redact_map(inner, &next, depth + 1, state, mask_token);
                }
            }
        }
    }
}

#[async_trait]
impl Redactor for FieldMaskRedactor {
    fn name(&self) -> &str {
        "field_mask"
    }

    fn on_error(&self) -> OnError {
        self.on_error
    }

    async fn redact(&self, envelope: &mut Envelope) -> RedactOutcome {
        let active: Vec<&[Segment]> = self.paths.iter().map(|p| p.as_slice()).collect();
        let mut state = ScanState {
            keys_scanned: 0,
            max_keys: self.max_keys,
            max_depth: self.max_depth,
            cap_exceeded: false,
        };
        Self::redact_map(&mut envelope.data, &active, 0, &mut state, &self.mask_token);
        if state.cap_exceeded {
            envelope.push_diagnostic(
                "redactor:field_mask",
                "depth or key-scan cap exceeded; remainder left unscanned",
            );
            if self.on_error == OnError::Closed {
                return RedactOutcome::DropEnvelope;
            }
        }
        RedactOutcome::Continue
    }
}

/// Case-insensitively matches key *names* (not values) at any nesting
/// depth and masks the matched value. Patterns are tried in declaration
/// order, which is what makes masking deterministic across invocations.
pub struct RegexMaskRedactor {
    patterns: Vec<Regex>,
    mask_token: String,
    on_error: OnError,
}

impl RegexMaskRedactor {
    pub fn new(patterns: &[&str], mask_token: impl Into<String>, on_error: OnError) -> Result<Self, regex::Error> {
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns: compiled,
            mask_token: mask_token.into(),
            on_error,
        })
    }

    fn key_matches(&self, key: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(key))
    }

    fn walk(&self, map: &mut AHashMap<String, Value>) {
        for (k, v) in map.iter_mut() {
            if self.key_matches(k) {
                *v = Value::Str(self.mask_token.clone());
                continue;
            }
            if let Value::Map(inner) = v {
                self.walk(inner);
            }
        }
    }
}

#[async_trait]
impl Redactor for RegexMaskRedactor {
    fn name(&self) -> &str {
        "regex_mask"
    }

    fn on_error(&self) -> OnError {
        self.on_error
    }

    async fn redact(&self, envelope: &mut Envelope) -> RedactOutcome {
        self.walk(&mut envelope.data);
        RedactOutcome::Continue
    }
}

/// Masks userinfo (`user:pass@`) on any string value that parses as a URL
/// carrying credentials.
pub struct UrlCredentialsRedactor {
    mask_token: String,
    url_with_userinfo: Regex,
    on_error: OnError,
}

impl UrlCredentialsRedactor {
    pub fn new(mask_token: impl Into<String>, on_error: OnError) -> Self {
        Self {
            mask_token: mask_token.into(),
            url_with_userinfo: Regex::new(r"^(?P<scheme>[a-zA-Z][a-zA-Z0-9+.\-]*://)(?P<userinfo>[^@/\s]+)@(?P<rest>.*)$").unwrap(),
            on_error,
        }
    }

    fn mask_value(&self, s: &str) -> Option<String> {
        let caps = self.url_with_userinfo.captures(s)?;
        let scheme = &caps["scheme"];
        let userinfo = &caps["userinfo"];
        let rest = &caps["rest"];
        let masked_userinfo = if let Some((_, _)) = userinfo.split_once(':') {
            format!("{m}:{m}", m = self.mask_token)
        } else {
            self.mask_token.clone()
        };
        Some(format!("{scheme}{masked_userinfo}@{rest}"))
    }

    fn walk(&self, map: &mut AHashMap<String, Value>) {
        for v in map.values_mut() {
            match v {
                Value::Str(s) => {
                    if let Some(masked) = self.mask_value(s) {
                        *s = masked;
                    }
                }
                Value::Map(inner) => self.walk(inner),
                _ => {}
            }
        }
    }
}

#[async_trait]
impl Redactor for UrlCredentialsRedactor {
    fn name(&self) -> &str {
        "url_credentials"
    }

    fn on_error(&self) -> OnError {
        self.on_error
    }

    async fn redact(&self, envelope: &mut Envelope) -> RedactOutcome {
        self.walk(&mut envelope.data);
        RedactOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Level;

    fn env_with(data: AHashMap<String, Value>) -> Envelope {
        let mut e = Envelope::new(Level::INFO, "INFO", "hi");
        e.data = data;
        e
    }

    #[tokio::test]
    async fn field_mask_matches_nested_dotted_path() {
        let mut user = AHashMap::new();
        user.insert("password".to_string(), Value::from("hunter2"));
        user.insert("name".to_string(), Value::from("x"));
        let mut data = AHashMap::new();
        data.insert("user".to_string(), Value::Map(user));
        let mut envelope = env_with(data);

        let redactor = FieldMaskRedactor::new(&["user.password"], "***", OnError::Warn);
        let outcome = redactor.redact(&mut envelope).await;
        assert_eq!(outcome, RedactOutcome::Continue);

        if let Value::Map(user) = envelope.data.get("user").unwrap() {
            assert_eq!(user.get("password"), Some(&Value::from("***")));
            assert_eq!(user.get("name"), Some(&Value::from("x")));
        } else {
            panic!("expected map");
        }
    }

    #[tokio::test]
    async fn field_mask_wildcard_segment() {
        let mut inner1 = AHashMap::new();
        inner1.insert("token".to_string(), Value::from("abc"));
        let mut inner2 = AHashMap::new();
        inner2.insert("token".to_string(), Value::from("def"));
        let mut accounts = AHashMap::new();
        accounts.insert("a1".to_string(), Value::Map(inner1));
        accounts.insert("a2".to_string(), Value::Map(inner2));
        let mut data = AHashMap::new();
        data.insert("accounts".to_string(), Value::Map(accounts));
        let mut envelope = env_with(data);

        let redactor = FieldMaskRedactor::new(&["accounts.*.token"], "***", OnError::Warn);
        redactor.redact(&mut envelope).await;

        if let Value::Map(accounts) = envelope.data.get("accounts").unwrap() {
            for acct in accounts.values() {
                if let Value::Map(m) = acct {
                    assert_eq!(m.get("token"), Some(&Value::from("***")));
                }
            }
        }
    }

    #[tokio::test]
    async fn field_mask_exceeding_key_cap_leaves_remainder_and_diagnoses() {
        let mut data = AHashMap::new();
        for i in 0..5 {
            data.insert(format!("k{i}"), Value::from("v"));
        }
        let mut envelope = env_with(data);
        let redactor = FieldMaskRedactor::new(&["k0"], "***", OnError::Warn).with_caps(16, 2);
        redactor.redact(&mut envelope).await;
        assert!(envelope.diagnostics.contains_key("redactor:field_mask"));
    }

    #[tokio::test]
    async fn field_mask_closed_on_error_drops_envelope() {
        let mut data = AHashMap::new();
        for i in 0..5 {
            data.insert(format!("k{i}"), Value::from("v"));
        }
        let mut envelope = env_with(data);
        let redactor = FieldMaskRedactor::new(&["k0"], "***", OnError::Closed).with_caps(16, 2);
        let outcome = redactor.redact(&mut envelope).await;
        assert_eq!(outcome, RedactOutcome::DropEnvelope);
    }

    #[tokio::test]
    async fn regex_mask_matches_key_name_at_any_depth() {
        let mut inner = AHashMap::new();
        inner.insert("api_secret".to_string(), Value::from("xyz"));
        let mut data = AHashMap::new();
        data.insert("config".to_string(), Value::Map(inner));
        let mut envelope = env_with(data);

        let redactor = RegexMaskRedactor::new(&["secret$"], "***", OnError::Warn).unwrap();
        redactor.redact(&mut envelope).await;

        if let Value::Map(config) = envelope.data.get("config").unwrap() {
            assert_eq!(config.get("api_secret"), Some(&Value::from("***")));
        }
    }

    #[tokio::test]
    async fn url_credentials_masks_userinfo() {
        let mut data = AHashMap::new();
        data.insert("endpoint".to_string(), Value::from("https://u:p@h/x"));
        let mut envelope = env_with(data);

        let redactor = UrlCredentialsRedactor::new("***", OnError::Warn);
        redactor.redact(&mut envelope).await;

        assert_eq!(
            envelope.data.get("endpoint"),
            Some(&Value::from("https://***:***@h/x"))
        );
    }

    #[tokio::test]
    async fn url_credentials_leaves_url_without_userinfo_untouched() {
        let mut data = AHashMap::new();
        data.insert("endpoint".to_string(), Value::from("https://h/x"));
        let mut envelope = env_with(data);

        let redactor = UrlCredentialsRedactor::new("***", OnError::Warn);
        redactor.redact(&mut envelope).await;

        assert_eq!(envelope.data.get("endpoint"), Some(&Value::from("https://h/x")));
    }
}
