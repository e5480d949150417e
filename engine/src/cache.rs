//! Fetching of schemas and linked documents, from local files or over HTTP, with an optional
//! on-disk cache.

use std::{
    cell::RefCell,
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use encoding_rs::{Encoding, UTF_8};
use lazy_static::lazy_static;
use regex::bytes::Regex;
use relmap_xsd::{
    import::{is_url, Import, ImportError, ImportResolver, LoadedDocument},
    read_schemas, LoadOptions, SchemaSet, SchemaSource, XsdError,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::conf::Conf;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource {0} is not available")]
    Unavailable(String),
    #[error("remote download of {0} is disabled")]
    RemoteDisabled(String),
    #[error("resource {location} is larger than {max_size} bytes")]
    TooLarge { location: String, max_size: u64 },
    #[error("download of {location} failed with status {status}")]
    Status { location: String, status: u16 },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

lazy_static! {
    static ref XML_ENCODING: Regex =
        Regex::new(r#"^<\?xml[^>]*encoding\s*=\s*["']([A-Za-z0-9._-]+)["']"#).unwrap();
}

/// How a single fetch may proceed.
#[derive(Clone, Debug)]
pub struct FetchOptions<'a> {
    pub allow_remote: bool,
    pub use_disk_cache: bool,
    pub timeout: Option<Duration>,
    pub max_size: Option<u64>,
    pub headers: &'a [(String, String)],
}

impl Default for FetchOptions<'_> {
    fn default() -> Self {
        Self {
            allow_remote: true,
            use_disk_cache: true,
            timeout: None,
            max_size: None,
            headers: &[],
        }
    }
}

/// Loads documents by location. Remote documents are kept in memory for the lifetime of the
/// cache and, when a directory is configured, on disk across runs.
#[derive(Debug)]
pub struct ResourceCache {
    directory: Option<PathBuf>,
    allow_remote: bool,
    timeout: Duration,
    fetched: RefCell<HashMap<String, String>>,
}

impl ResourceCache {
    pub fn new(directory: Option<PathBuf>, allow_remote: bool) -> Self {
        Self {
            directory,
            allow_remote,
            timeout: Duration::from_secs(30),
            fetched: RefCell::new(HashMap::new()),
        }
    }

    /// The cache used to load schemas.
    pub fn for_schemas(conf: &Conf) -> Self {
        let directory = conf
            .schema_cache
            .enabled
            .then(|| conf.schema_cache.directory.clone().unwrap_or_else(default_directory));
        Self::new(directory, conf.allow_remote_schema_download)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn fetch(&self, location: &str) -> Result<String, ResourceError> {
        self.fetch_with(location, &FetchOptions::default())
    }

    pub fn fetch_with(
        &self,
        location: &str,
        options: &FetchOptions,
    ) -> Result<String, ResourceError> {
        if !is_url(location) {
            let path = location.strip_prefix("file://").unwrap_or(location);
            let bytes = fs::read(path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ResourceError::Unavailable(location.to_string()),
                _ => ResourceError::Io(e),
            })?;
            check_size(location, bytes.len(), options.max_size)?;
            return Ok(decode(&bytes));
        }

        if let Some(text) = self.fetched.borrow().get(location) {
            return Ok(text.clone());
        }
        let cached = options
            .use_disk_cache
            .then(|| self.cache_path(location))
            .flatten();
        if let Some(path) = cached.as_ref().filter(|p| p.is_file()) {
            debug!("Using cached copy {} of {location}", path.display());
            let text = decode(&fs::read(path)?);
            self.fetched
                .borrow_mut()
                .insert(location.to_string(), text.clone());
            return Ok(text);
        }
        if !(self.allow_remote && options.allow_remote) {
            return Err(ResourceError::RemoteDisabled(location.to_string()));
        }

        let bytes = self.download(location, options)?;
        if let Some(path) = cached {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &bytes)?;
        }
        let text = decode(&bytes);
        self.fetched
            .borrow_mut()
            .insert(location.to_string(), text.clone());
        Ok(text)
    }

    fn download(&self, location: &str, options: &FetchOptions) -> Result<Vec<u8>, ResourceError> {
        info!("Downloading {location}");
        let client = reqwest::blocking::Client::builder()
            .timeout(options.timeout.unwrap_or(self.timeout))
            .build()?;
        let mut request = client.get(location);
        for (name, value) in options.headers {
            request = request.header(name, value);
        }
        let response = request.send()?;
        if !response.status().is_success() {
            return Err(ResourceError::Status {
                location: location.to_string(),
                status: response.status().as_u16(),
            });
        }
        if let (Some(length), Some(max_size)) = (response.content_length(), options.max_size) {
            if length > max_size {
                return Err(ResourceError::TooLarge {
                    location: location.to_string(),
                    max_size,
                });
            }
        }
        let bytes = response.bytes()?;
        check_size(location, bytes.len(), options.max_size)?;
        Ok(bytes.to_vec())
    }

    /// Where the copy of `url` is kept, if the cache has a directory.
    pub fn cache_path(&self, url: &str) -> Option<PathBuf> {
        let directory = self.directory.as_ref()?;
        let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
        let mut path = directory.clone();
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            let segment = segment
                .chars()
                .map(|c| match c {
                    'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
                    _ => '_',
                })
                .collect::<String>();
            path.push(if segment == ".." { "__".to_string() } else { segment });
        }
        Some(path)
    }
}

impl ImportResolver for ResourceCache {
    fn resolve_import(&self, import: &Import) -> Result<LoadedDocument, ImportError> {
        let location = import
            .resolved_location()
            .ok_or(ImportError::UnsupportedImport)?;
        match self.fetch(&location) {
            Ok(content) => Ok(LoadedDocument { location, content }),
            Err(ResourceError::Unavailable(location)) => Err(ImportError::NotAvailable(location)),
            Err(ResourceError::Io(e)) => Err(ImportError::Io(e)),
            Err(e) => Err(ImportError::UnspecifiedLoad(Box::new(e))),
        }
    }
}

/// Loads `sources` and the schemas they include or import, through a [`ResourceCache`] set up
/// from `conf`.
pub fn load_schemas(conf: &Conf, sources: &[SchemaSource]) -> Result<SchemaSet, XsdError> {
    let resolvers: Vec<Box<dyn ImportResolver>> = vec![Box::new(ResourceCache::for_schemas(conf))];
    let options = LoadOptions {
        strict: conf.schema_full_checking,
        handle_multiple_imports: conf.handle_multiple_imports,
        ..Default::default()
    };
    info!("Loading {} schema(s)", sources.len());
    read_schemas(sources, &resolvers, &options)
}

fn default_directory() -> PathBuf {
    std::env::temp_dir().join("relmap_cache")
}

fn check_size(location: &str, size: usize, max_size: Option<u64>) -> Result<(), ResourceError> {
    match max_size {
        Some(max_size) if size as u64 > max_size => Err(ResourceError::TooLarge {
            location: location.to_string(),
            max_size,
        }),
        _ => Ok(()),
    }
}

/// Decodes a document using its byte order mark or XML declaration, UTF-8 otherwise.
pub fn decode(bytes: &[u8]) -> String {
    let encoding = Encoding::for_bom(bytes)
        .map(|(encoding, _)| encoding)
        .or_else(|| {
            let declaration = XML_ENCODING.captures(bytes)?;
            Encoding::for_label(declaration.get(1)?.as_bytes())
        })
        .unwrap_or(UTF_8);
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        debug!("Invalid {} sequences replaced", encoding.name());
    }
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_encoding_is_honoured() {
        let latin1 = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><a>caf\xe9</a>";
        assert!(decode(latin1).ends_with("<a>caf\u{e9}</a>"));
        assert_eq!(decode("<a>\u{e9}</a>".as_bytes()), "<a>\u{e9}</a>");
    }

    #[test]
    fn disk_cache_serves_remote_documents() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(Some(dir.path().to_path_buf()), false);
        let url = "http://example.invalid/schemas/a.xsd";
        let path = cache.cache_path(url).unwrap();
        assert_eq!(path, dir.path().join("example.invalid").join("schemas").join("a.xsd"));

        assert!(matches!(
            cache.fetch(url),
            Err(ResourceError::RemoteDisabled(_))
        ));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "<schema/>").unwrap();
        assert_eq!(cache.fetch(url).unwrap(), "<schema/>");
    }

    #[test]
    fn local_files_and_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.xml");
        fs::write(&path, "<doc>0123456789</doc>").unwrap();
        let cache = ResourceCache::new(None, false);
        let location = path.to_string_lossy();
        assert_eq!(cache.fetch(&location).unwrap(), "<doc>0123456789</doc>");
        let limited = FetchOptions {
            max_size: Some(5),
            ..Default::default()
        };
        assert!(matches!(
            cache.fetch_with(&location, &limited),
            Err(ResourceError::TooLarge { .. })
        ));
        assert!(matches!(
            cache.fetch(&dir.path().join("missing.xml").to_string_lossy()),
            Err(ResourceError::Unavailable(_))
        ));
    }
}
