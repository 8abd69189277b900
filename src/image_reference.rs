use std::fmt;

/// Registry hostname used when an image reference carries none.
pub static DEFAULT_REGISTRY: &str = "registry-1.docker.io";
/// Namespace assumed for single-component image names (`nginx` -> `library/nginx`).
pub static DEFAULT_NAMESPACE: &str = "library";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub namespace: String,
    pub repository: String,
}

#[derive(Debug)]
pub enum ParseError {
    EmptyImage,
    MissingRepository(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EmptyImage => write!(f, "image reference is empty"),
            ParseError::MissingRepository(image) => {
                write!(f, "image reference '{}' has no repository component", image)
            }
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.registry, self.namespace, self.repository)
    }
}

impl ImageReference {
    /// Parses an image name into registry, namespace and repository.
    ///
    /// A leading path segment is treated as a registry host only when it
    /// contains a dot, a colon (port) or is literally `localhost`; anything
    /// else is a namespace on the default registry.
    pub fn parse(image: &str) -> Result<Self, ParseError> {
        if image.is_empty() {
            return Err(ParseError::EmptyImage);
        }

        let (registry, remaining) = match image.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first, rest),
            _ => (DEFAULT_REGISTRY, image),
        };

        let (namespace, repository) = match remaining.split_once('/') {
            Some((ns, repo)) => (ns, repo),
            None => (DEFAULT_NAMESPACE, remaining),
        };

        if repository.is_empty() {
            return Err(ParseError::MissingRepository(image.to_string()));
        }

        Ok(Self {
            registry: registry.to_string(),
            namespace: namespace.to_string(),
            repository: repository.to_string(),
        })
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Reduces an image reference to its bare repository path for comparison.
///
/// Strips any digest qualifier, any tag (a colon after the last slash), and
/// any registry host prefix, then applies the implicit `library` namespace,
/// so that `nginx`, `docker.io/nginx:alpine` and `library/nginx@sha256:...`
/// all normalize to `library/nginx`.
pub fn normalize(image: &str) -> String {
    let mut img = image;

    if let Some(at) = img.find('@') {
        img = &img[..at];
    }

    let last_slash = img.rfind('/');
    if let Some(colon) = img.rfind(':') {
        if last_slash.is_none_or(|s| colon > s) {
            img = &img[..colon];
        }
    }

    if let Some((first, rest)) = img.split_once('/') {
        if is_registry_host(first) {
            img = rest;
        }
    }

    if img.contains('/') {
        img.to_string()
    } else {
        format!("{}/{}", DEFAULT_NAMESPACE, img)
    }
}

/// Whether two image references name the same repository, ignoring tag,
/// digest, registry host and implicit-namespace variation.
pub fn references_match(a: &str, b: &str) -> bool {
    let na = normalize(a);
    let nb = normalize(b);

    fn strip_library(s: &str) -> &str {
        s.strip_prefix("library/").unwrap_or(s)
    }

    na == nb || strip_library(&na) == strip_library(&nb)
}
