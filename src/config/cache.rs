use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::{blocking::Client, StatusCode};
use url::Url;

use crate::{Error, Result};

const CONFIG_FILE_SUFFIX: &str = ".config";
const ETAG_DELIMITER: &str = "--etag--";
const CACHE_BUSTER_PARAM: &str = "cm_cache_buster";
const TMP_DIR: &str = "tmp";

/// Network settings for [`ConfigCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Timeout for the HEAD request checking whether the cached file is current.
    pub head_timeout: Duration,
    /// Timeout for downloading the file.
    pub get_timeout: Duration,
}

impl CacheConfig {
    /// Default HEAD timeout.
    pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default GET timeout.
    pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(20);
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            head_timeout: Self::DEFAULT_HEAD_TIMEOUT,
            get_timeout: Self::DEFAULT_GET_TIMEOUT,
        }
    }
}

/// Local copies of remote config files, revalidated with ETags.
///
/// A file is stored as `<name>--etag--<etag>.config` when the host sent a usable ETag, and
/// as `<name>.config` otherwise. Only one file per name is kept.
#[derive(Debug)]
pub struct ConfigCache {
    dir: PathBuf,
    head_client: Client,
    get_client: Client,
}

impl ConfigCache {
    /// Cache in `dir`, which must already exist.
    pub fn new(dir: impl Into<PathBuf>, config: CacheConfig) -> Result<ConfigCache> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("cache directory does not exist: {}", dir.display()),
            )
            .into());
        }
        Ok(ConfigCache {
            dir,
            head_client: Client::builder().timeout(config.head_timeout).build()?,
            get_client: Client::builder().timeout(config.get_timeout).build()?,
        })
    }

    /// Directory holding the cached files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a current copy of the file at `url`, cached under `name`.
    ///
    /// A cached copy whose ETag still matches is returned without downloading. When the
    /// download fails, any cached copy is returned instead.
    pub fn verify_or_fetch(&self, url: &str, name: &str) -> Result<PathBuf> {
        let url = cache_bust_url(url)?;

        let prior = self.cached_file(name);
        if let Some((path, Some(etag))) = &prior {
            if self.fetch_etag(&url).as_deref() == Some(etag.as_str()) {
                log::debug!(target: "critical_moments", name, etag = etag.as_str(); "cached config is current");
                return Ok(path.clone());
            }
        }

        match self.fetch_and_cache(&url, name) {
            Ok(path) => {
                if let Some((prior_path, _)) = prior.filter(|(prior_path, _)| *prior_path != path) {
                    if let Err(err) = fs::remove_file(&prior_path) {
                        log::warn!(target: "critical_moments", path:? = prior_path;
                            "could not delete prior cache file, cache directory is accumulating files: {err}");
                    }
                }
                Ok(path)
            }
            Err(err) => match prior {
                Some((path, _)) => {
                    log::warn!(target: "critical_moments", name;
                        "unable to update config file, using cached copy: {err}");
                    Ok(path)
                }
                None => Err(err),
            },
        }
    }

    /// Cached file for `name` and its ETag, if there is one.
    pub fn cached_file(&self, name: &str) -> Option<(PathBuf, Option<String>)> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(target: "critical_moments", "could not read cache directory: {err}");
                return None;
            }
        };
        let exact = format!("{name}{CONFIG_FILE_SUFFIX}");
        for entry in entries.flatten() {
            if entry.file_type().map_or(true, |file_type| file_type.is_dir()) {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name == exact {
                return Some((entry.path(), None));
            }
            let etag = file_name
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix(ETAG_DELIMITER))
                .and_then(|rest| rest.strip_suffix(CONFIG_FILE_SUFFIX));
            if let Some(etag) = etag {
                let etag = (!etag.is_empty()).then(|| etag.to_owned());
                return Some((entry.path(), etag));
            }
        }
        None
    }

    fn fetch_etag(&self, url: &Url) -> Option<String> {
        let response = self
            .head_client
            .head(url.clone())
            .send()
            .inspect_err(|err| {
                log::debug!(target: "critical_moments", "config HEAD request failed: {err}");
            })
            .ok()?;
        if response.status() != StatusCode::OK {
            return None;
        }
        clean_etag(response.headers().get(reqwest::header::ETAG)?.to_str().ok()?)
    }

    fn fetch_and_cache(&self, url: &Url, name: &str) -> Result<PathBuf> {
        log::debug!(target: "critical_moments", name; "downloading config file");
        let response = self.get_client.get(url.clone()).send()?;
        if response.status() != StatusCode::OK {
            return Err(Error::HttpStatus(response.status().as_u16()));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .and_then(clean_etag);
        let file_name = match &etag {
            Some(etag) => format!("{name}{ETAG_DELIMITER}{etag}{CONFIG_FILE_SUFFIX}"),
            None => {
                log::warn!(target: "critical_moments",
                    "config host did not return a usable ETag header; the file will be downloaded on every launch");
                format!("{name}{CONFIG_FILE_SUFFIX}")
            }
        };
        let body = response.bytes()?;

        // Write to a temporary file and rename, so a file named with an ETag is always complete.
        let tmp_dir = self.dir.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&tmp_dir)?;
        tmp.write_all(&body)?;
        let path = self.dir.join(file_name);
        tmp.persist(&path).map_err(|err| err.error)?;
        Ok(path)
    }
}

/// `url` with a random `cm_cache_buster` query parameter, so CDNs pass the request to the
/// origin.
fn cache_bust_url(url: &str) -> Result<Url> {
    let mut url = Url::parse(url).map_err(|_| Error::InvalidConfigUrl)?;
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != CACHE_BUSTER_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair(CACHE_BUSTER_PARAM, &rand::random::<u32>().to_string());
    Ok(url)
}

/// The ETag without quotes, when it is strong and safe to use in a file name.
fn clean_etag(etag: &str) -> Option<String> {
    if etag.starts_with("W/") {
        return None;
    }
    let etag = etag.strip_prefix('"')?.strip_suffix('"')?;
    let unsafe_name = etag.is_empty()
        || etag == "."
        || etag == ".."
        || etag.contains(['/', '\\', '\0']);
    (!unsafe_name).then(|| etag.to_owned())
}
