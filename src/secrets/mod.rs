use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;

/// Environment fallback for stream keys: `Q8_STREAMER_KEY_<REF>`, with the
/// reference upper-cased and `-`/`.` turned into `_`.
pub const ENV_PREFIX: &str = "Q8_STREAMER_KEY_";

/// Resolves a `credentials_ref` to the secret the encoder needs.
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, reference: &str) -> Option<SecretString>;
}

/// Keys loaded from the config file, with an environment fallback.
#[derive(Default)]
pub struct StaticCredentials {
    entries: HashMap<String, SecretString>,
    use_env: bool,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<String, String>) -> Self {
        let mut store = Self::new();
        for (reference, key) in map {
            store.insert(reference, key);
        }
        store
    }

    pub fn with_env_fallback(mut self) -> Self {
        self.use_env = true;
        self
    }

    pub fn insert(&mut self, reference: impl Into<String>, key: impl Into<String>) {
        self.entries.insert(reference.into(), SecretString::from(key.into()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn env_name(reference: &str) -> String {
        let suffix: String = reference
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}", ENV_PREFIX, suffix)
    }
}

impl CredentialStore for StaticCredentials {
    fn resolve(&self, reference: &str) -> Option<SecretString> {
        let found = self
            .entries
            .get(reference)
            .map(|secret| secret.expose_secret().to_string())
            .or_else(|| {
                self.use_env
                    .then(|| std::env::var(Self::env_name(reference)).ok())
                    .flatten()
            })?;
        (!found.trim().is_empty()).then(|| SecretString::from(found))
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut refs: Vec<&String> = self.entries.keys().collect();
        refs.sort();
        f.debug_struct("StaticCredentials").field("refs", &refs).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_from_map() {
        let mut map = HashMap::new();
        map.insert("key1".to_string(), "abcd-efgh".to_string());
        map.insert("blank".to_string(), "   ".to_string());
        let store = StaticCredentials::from_map(map);

        assert_eq!(store.resolve("key1").unwrap().expose_secret(), "abcd-efgh");
        assert!(store.resolve("blank").is_none());
        assert!(store.resolve("missing").is_none());
        assert!(!format!("{:?}", store).contains("abcd"));
    }

    #[test]
    fn test_env_name_mapping() {
        assert_eq!(StaticCredentials::env_name("yt-live.main"), "Q8_STREAMER_KEY_YT_LIVE_MAIN");
    }

    #[test]
    fn test_env_fallback() {
        std::env::set_var("Q8_STREAMER_KEY_ENV_ONLY_TEST", "from-env");
        let store = StaticCredentials::new().with_env_fallback();
        assert_eq!(store.resolve("env-only-test").unwrap().expose_secret(), "from-env");
        assert!(StaticCredentials::new().resolve("env-only-test").is_none());
    }
}
