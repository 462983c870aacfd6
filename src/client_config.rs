use std::{path::PathBuf, time::Duration};

use crate::{
    action_dispatcher::NoopActionDispatcher,
    conditions::ValidationMode,
    config::CacheConfig,
    history::HistoryStoreConfig,
    signing::{ApiKey, SignUtil},
    ActionDispatcher, Client, Error, Result,
};

const FILE_PREFIX: &str = "file://";
const HTTPS_PREFIX: &str = "https://";

/// Configuration for [`Client`].
pub struct ClientConfig<'a> {
    pub(crate) api_key: String,
    pub(crate) bundle_id: String,
    pub(crate) config_url: Option<String>,
    pub(crate) data_dir: Option<PathBuf>,
    pub(crate) verifier: Option<SignUtil>,
    pub(crate) validation_mode: ValidationMode,
    pub(crate) history: HistoryStoreConfig,
    pub(crate) cache: CacheConfig,
    pub(crate) session_gap: Duration,
    pub(crate) allow_debug_load: bool,
    pub(crate) action_dispatcher: Box<dyn ActionDispatcher + Send + Sync + 'a>,
}

impl<'a> ClientConfig<'a> {
    /// Create a default configuration for the app with `bundle_id`, using the specified API
    /// key.
    ///
    /// ```
    /// # use critical_moments::ClientConfig;
    /// ClientConfig::from_api_key("CM1-...", "com.example.app");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>, bundle_id: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            bundle_id: bundle_id.into(),
            config_url: None,
            data_dir: None,
            verifier: None,
            validation_mode: ValidationMode::default(),
            history: HistoryStoreConfig::default(),
            cache: CacheConfig::default(),
            session_gap: ClientConfig::DEFAULT_SESSION_GAP,
            allow_debug_load: false,
            action_dispatcher: Box::new(NoopActionDispatcher),
        }
    }

    /// Where the config file is loaded from. Must start with `https://` or `file://`.
    ///
    /// ```
    /// # use critical_moments::ClientConfig;
    /// let mut config = ClientConfig::from_api_key("CM1-...", "com.example.app");
    /// assert!(config.config_url("https://example.com/cm.config").is_ok());
    /// assert!(config.config_url("http://example.com/cm.config").is_err());
    /// ```
    pub fn config_url(&mut self, config_url: impl Into<String>) -> Result<&mut Self> {
        let config_url = config_url.into();
        if !config_url.starts_with(FILE_PREFIX) && !config_url.starts_with(HTTPS_PREFIX) {
            return Err(Error::InvalidConfigUrl);
        }
        self.config_url = Some(config_url);
        Ok(self)
    }

    /// Existing directory for the history database and the config cache.
    pub fn data_dir(&mut self, data_dir: impl Into<PathBuf>) -> &mut Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    /// Public key that signed the API key and the config file.
    pub fn verifier(&mut self, verifier: SignUtil) -> &mut Self {
        self.verifier = Some(verifier.public_only());
        self
    }

    /// How conditions in the config are validated. Deployed apps should keep the default,
    /// [`ValidationMode::Lenient`].
    pub fn validation_mode(&mut self, validation_mode: ValidationMode) -> &mut Self {
        self.validation_mode = validation_mode;
        self
    }

    /// Minimum time between two samples of the same property recorded on use.
    pub fn min_sample_interval(&mut self, interval: Duration) -> &mut Self {
        self.history.min_sample_interval = interval;
        self
    }

    /// Default for [`ClientConfig::session_gap`].
    pub const DEFAULT_SESSION_GAP: Duration = Duration::from_secs(10 * 60);

    /// Time in the background after which returning to the foreground starts a new session.
    pub fn session_gap(&mut self, session_gap: Duration) -> &mut Self {
        self.session_gap = session_gap;
        self
    }

    /// Timeouts for checking and downloading the config file.
    pub fn cache_config(&mut self, cache: CacheConfig) -> &mut Self {
        self.cache = cache;
        self
    }

    /// Accept unsigned config JSON from `file://` urls. For local development only.
    pub fn allow_debug_load(&mut self, allow_debug_load: bool) -> &mut Self {
        self.allow_debug_load = allow_debug_load;
        self
    }

    /// Set the host's action dispatcher, which presents actions and schedules notifications.
    ///
    /// ```
    /// # use critical_moments::{config::Action, ClientConfig};
    /// let mut config = ClientConfig::from_api_key("CM1-...", "com.example.app");
    /// config.action_dispatcher(|name: &str, action: &Action| -> Result<(), String> {
    ///     println!("{name}: {}", action.action_type());
    ///     Ok(())
    /// });
    /// ```
    pub fn action_dispatcher(
        &mut self,
        action_dispatcher: impl ActionDispatcher + Send + Sync + 'a,
    ) -> &mut Self {
        self.action_dispatcher = Box::new(action_dispatcher);
        self
    }

    /// Create a new [`Client`] using the specified configuration. Fails if a required setting
    /// is missing or the API key is not valid for the bundle id.
    pub fn to_client(self) -> Result<Client<'a>> {
        let verifier = self.verifier.as_ref().ok_or(Error::MissingSetting("verifier"))?;
        ApiKey::parse(&self.api_key)?.check(&self.bundle_id, verifier)?;
        if self.config_url.is_none() {
            return Err(Error::MissingSetting("config URL"));
        }
        if self.data_dir.is_none() {
            return Err(Error::MissingSetting("data directory"));
        }
        Client::new(self)
    }

    pub(crate) fn file_path(url: &str) -> Option<&str> {
        url.strip_prefix(FILE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        signing::{ApiKey, SignUtil},
        ClientConfig, Error,
    };

    fn keys() -> (SignUtil, String) {
        let signer = SignUtil::generate();
        let key = ApiKey::new_signed("com.example.app", &signer)
            .unwrap()
            .to_string();
        (signer, key)
    }

    #[test]
    fn rejects_unsupported_urls() {
        let mut config = ClientConfig::from_api_key("key", "com.example.app");
        assert!(matches!(
            config.config_url("ftp://example.com/cm.config"),
            Err(Error::InvalidConfigUrl)
        ));
        assert!(config.config_url("file:///tmp/cm.config").is_ok());
        assert!(config.config_url("https://example.com/cm.config").is_ok());
    }

    #[test]
    fn requires_a_verifier() {
        let config = ClientConfig::from_api_key("key", "com.example.app");
        assert!(matches!(
            config.to_client(),
            Err(Error::MissingSetting("verifier"))
        ));
    }

    #[test]
    fn checks_the_api_key() {
        let (signer, key) = keys();

        let mut config = ClientConfig::from_api_key("CM1-garbage", "com.example.app");
        config.verifier(signer.clone());
        assert!(matches!(config.to_client(), Err(Error::InvalidApiKey)));

        let mut config = ClientConfig::from_api_key(key.clone(), "com.example.other");
        config.verifier(signer.clone());
        assert!(matches!(
            config.to_client(),
            Err(Error::ApiKeyBundleMismatch { .. })
        ));

        let mut config = ClientConfig::from_api_key(key, "com.example.app");
        config.verifier(SignUtil::generate());
        assert!(matches!(config.to_client(), Err(Error::InvalidApiKey)));
    }

    #[test]
    fn requires_config_url_and_data_dir() {
        let (signer, key) = keys();

        let mut config = ClientConfig::from_api_key(key.clone(), "com.example.app");
        config.verifier(signer.clone());
        assert!(matches!(
            config.to_client(),
            Err(Error::MissingSetting("config URL"))
        ));

        let mut config = ClientConfig::from_api_key(key, "com.example.app");
        config.verifier(signer);
        config.config_url("file:///tmp/cm.config").unwrap();
        assert!(matches!(
            config.to_client(),
            Err(Error::MissingSetting("data directory"))
        ));
    }
}
