use std::{collections::BTreeMap, sync::Arc};

use rand::seq::SliceRandom;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    Endpoint, Identity, LocatorHandle, RouterHandle, RuntimeConfig,
    config::{check_connection_timeout, check_invocation_timeout, check_locator_cache_timeout},
    error::{Error, ErrorKind, Result},
};

/// Per-request key/value context carried to the server.
pub type Context = BTreeMap<String, String>;

#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum InvocationMode {
    #[default]
    Twoway,
    Oneway,
    BatchOneway,
    Datagram,
    BatchDatagram,
}

impl InvocationMode {
    #[must_use]
    pub fn is_twoway(self) -> bool {
        self == InvocationMode::Twoway
    }

    #[must_use]
    pub fn is_batch(self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    #[must_use]
    pub fn is_datagram(self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }

    fn flag(self) -> &'static str {
        match self {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        }
    }
}

#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum EndpointSelection {
    #[default]
    Random,
    Ordered,
}

#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

impl EncodingVersion {
    pub const V1_0: Self = Self { major: 1, minor: 0 };
    pub const V1_1: Self = Self { major: 1, minor: 1 };
}

impl Default for EncodingVersion {
    fn default() -> Self {
        Self::V1_1
    }
}

impl std::fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl std::str::FromStr for EncodingVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::new(ErrorKind::InvalidArgument, format!("invalid encoding: {s}"));
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// Immutable description of a remote object and of how requests reach it.
///
/// Every `change_*` method returns the receiver itself when the value is
/// unchanged, so handlers cached against it stay valid. Otherwise it
/// returns a new reference with exactly that field replaced.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    identity: Identity,
    facet: String,
    endpoints: Vec<Endpoint>,
    adapter_id: String,
    mode: InvocationMode,
    cache_connection: bool,
    endpoint_selection: EndpointSelection,
    secure: bool,
    prefer_secure: bool,
    encoding: EncodingVersion,
    context: Context,
    invocation_timeout: i32,
    locator_cache_timeout: i32,
    timeout: Option<i32>,
    connection_id: String,
    compress: Option<bool>,
    collocation_optimized: bool,
    router: Option<RouterHandle>,
    locator: Option<LocatorHandle>,
}

impl Reference {
    /// # Errors
    ///
    /// Fails with `IllegalIdentity` when the identity name is empty.
    pub fn new(identity: Identity, config: &RuntimeConfig) -> Result<Self> {
        identity.validate()?;
        Ok(Self {
            identity,
            facet: String::new(),
            endpoints: Vec::new(),
            adapter_id: String::new(),
            mode: InvocationMode::Twoway,
            cache_connection: config.cache_connection,
            endpoint_selection: config.endpoint_selection,
            secure: false,
            prefer_secure: config.prefer_secure,
            encoding: EncodingVersion::default(),
            context: Context::new(),
            invocation_timeout: config.invocation_timeout_ms,
            locator_cache_timeout: config.locator_cache_timeout_ms,
            timeout: None,
            connection_id: String::new(),
            compress: None,
            collocation_optimized: true,
            router: None,
            locator: None,
        })
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn facet(&self) -> &str {
        &self.facet
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    #[must_use]
    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    #[must_use]
    pub fn mode(&self) -> InvocationMode {
        self.mode
    }

    #[must_use]
    pub fn cache_connection(&self) -> bool {
        self.cache_connection
    }

    #[must_use]
    pub fn endpoint_selection(&self) -> EndpointSelection {
        self.endpoint_selection
    }

    #[must_use]
    pub fn secure(&self) -> bool {
        self.secure
    }

    #[must_use]
    pub fn prefer_secure(&self) -> bool {
        self.prefer_secure
    }

    #[must_use]
    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    #[must_use]
    pub fn invocation_timeout(&self) -> i32 {
        self.invocation_timeout
    }

    #[must_use]
    pub fn locator_cache_timeout(&self) -> i32 {
        self.locator_cache_timeout
    }

    /// Connection timeout override, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<i32> {
        self.timeout
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Compression override, if any.
    #[must_use]
    pub fn compress(&self) -> Option<bool> {
        self.compress
    }

    #[must_use]
    pub fn collocation_optimized(&self) -> bool {
        self.collocation_optimized
    }

    #[must_use]
    pub fn router(&self) -> Option<&RouterHandle> {
        self.router.as_ref()
    }

    #[must_use]
    pub fn locator(&self) -> Option<&LocatorHandle> {
        self.locator.as_ref()
    }

    /// True when the endpoints come from the locator.
    #[must_use]
    pub fn is_indirect(&self) -> bool {
        self.endpoints.is_empty() && !self.adapter_id.is_empty()
    }

    fn change(self: &Arc<Self>, unchanged: bool, apply: impl FnOnce(&mut Self)) -> Arc<Self> {
        if unchanged {
            return Arc::clone(self);
        }
        let mut reference = Self::clone(self);
        apply(&mut reference);
        Arc::new(reference)
    }

    /// # Errors
    ///
    /// Fails with `IllegalIdentity` when the new name is empty.
    pub fn change_identity(self: &Arc<Self>, identity: Identity) -> Result<Arc<Self>> {
        identity.validate()?;
        Ok(self.change(identity == self.identity, |r| r.identity = identity))
    }

    #[must_use]
    pub fn change_facet(self: &Arc<Self>, facet: &str) -> Arc<Self> {
        self.change(facet == self.facet, |r| r.facet = facet.to_string())
    }

    /// Makes the reference indirect; explicit endpoints are dropped.
    #[must_use]
    pub fn change_adapter_id(self: &Arc<Self>, adapter_id: &str) -> Arc<Self> {
        self.change(adapter_id == self.adapter_id, |r| {
            r.adapter_id = adapter_id.to_string();
            r.endpoints.clear();
        })
    }

    /// Makes the reference direct; the adapter id is dropped.
    #[must_use]
    pub fn change_endpoints(self: &Arc<Self>, endpoints: Vec<Endpoint>) -> Arc<Self> {
        self.change(endpoints == self.endpoints, |r| {
            r.endpoints = endpoints;
            r.adapter_id.clear();
        })
    }

    #[must_use]
    pub fn change_mode(self: &Arc<Self>, mode: InvocationMode) -> Arc<Self> {
        self.change(mode == self.mode, |r| r.mode = mode)
    }

    #[must_use]
    pub fn change_cache_connection(self: &Arc<Self>, cache_connection: bool) -> Arc<Self> {
        self.change(cache_connection == self.cache_connection, |r| {
            r.cache_connection = cache_connection;
        })
    }

    #[must_use]
    pub fn change_endpoint_selection(self: &Arc<Self>, selection: EndpointSelection) -> Arc<Self> {
        self.change(selection == self.endpoint_selection, |r| {
            r.endpoint_selection = selection;
        })
    }

    #[must_use]
    pub fn change_secure(self: &Arc<Self>, secure: bool) -> Arc<Self> {
        self.change(secure == self.secure, |r| r.secure = secure)
    }

    #[must_use]
    pub fn change_prefer_secure(self: &Arc<Self>, prefer_secure: bool) -> Arc<Self> {
        self.change(prefer_secure == self.prefer_secure, |r| {
            r.prefer_secure = prefer_secure;
        })
    }

    #[must_use]
    pub fn change_encoding(self: &Arc<Self>, encoding: EncodingVersion) -> Arc<Self> {
        self.change(encoding == self.encoding, |r| r.encoding = encoding)
    }

    #[must_use]
    pub fn change_context(self: &Arc<Self>, context: Context) -> Arc<Self> {
        self.change(context == self.context, |r| r.context = context)
    }

    /// # Errors
    ///
    /// Fails with `InvalidArgument` unless `timeout >= 1`, `-1` or `-2`.
    pub fn change_invocation_timeout(self: &Arc<Self>, timeout: i32) -> Result<Arc<Self>> {
        check_invocation_timeout(timeout)?;
        Ok(self.change(timeout == self.invocation_timeout, |r| {
            r.invocation_timeout = timeout;
        }))
    }

    /// # Errors
    ///
    /// Fails with `InvalidArgument` when `timeout < -1`.
    pub fn change_locator_cache_timeout(self: &Arc<Self>, timeout: i32) -> Result<Arc<Self>> {
        check_locator_cache_timeout(timeout)?;
        Ok(self.change(timeout == self.locator_cache_timeout, |r| {
            r.locator_cache_timeout = timeout;
        }))
    }

    /// # Errors
    ///
    /// Fails with `InvalidArgument` unless `timeout >= 1` or `-1`.
    pub fn change_timeout(self: &Arc<Self>, timeout: i32) -> Result<Arc<Self>> {
        check_connection_timeout(timeout)?;
        Ok(self.change(Some(timeout) == self.timeout, |r| r.timeout = Some(timeout)))
    }

    #[must_use]
    pub fn change_connection_id(self: &Arc<Self>, connection_id: &str) -> Arc<Self> {
        self.change(connection_id == self.connection_id, |r| {
            r.connection_id = connection_id.to_string();
        })
    }

    #[must_use]
    pub fn change_compress(self: &Arc<Self>, compress: bool) -> Arc<Self> {
        self.change(Some(compress) == self.compress, |r| r.compress = Some(compress))
    }

    #[must_use]
    pub fn change_collocation_optimized(self: &Arc<Self>, optimized: bool) -> Arc<Self> {
        self.change(optimized == self.collocation_optimized, |r| {
            r.collocation_optimized = optimized;
        })
    }

    /// Installs a new router. Cached client endpoints belong to the handle,
    /// so lookups made through the previous router are not carried over.
    #[must_use]
    pub fn change_router(self: &Arc<Self>, router: Option<RouterHandle>) -> Arc<Self> {
        self.change(router == self.router, |r| r.router = router)
    }

    /// Installs a new locator. Its adapter lookup table starts out empty.
    #[must_use]
    pub fn change_locator(self: &Arc<Self>, locator: Option<LocatorHandle>) -> Arc<Self> {
        self.change(locator == self.locator, |r| r.locator = locator)
    }

    /// Endpoints this reference resolves to, before filtering.
    ///
    /// A router takes precedence, then explicit endpoints, then the
    /// locator lookup of the adapter id.
    ///
    /// # Errors
    pub async fn resolve_endpoints(&self) -> Result<Vec<Endpoint>> {
        if let Some(router) = &self.router {
            return router.client_endpoints().await;
        }
        if !self.endpoints.is_empty() {
            return Ok(self.endpoints.clone());
        }
        if self.adapter_id.is_empty() {
            return Err(Error::new(
                ErrorKind::NoEndpoint,
                format!("`{}` has neither endpoints nor adapter id", self.identity),
            ));
        }
        let Some(locator) = &self.locator else {
            return Err(Error::new(
                ErrorKind::NoEndpoint,
                format!("no locator to resolve adapter `{}`", self.adapter_id),
            ));
        };
        locator
            .endpoints(&self.adapter_id, self.locator_cache_timeout)
            .await
    }

    /// Orders and filters `endpoints` for a connection attempt.
    ///
    /// # Errors
    ///
    /// Fails with `NoEndpoint` when nothing usable remains.
    pub fn filter_endpoints(&self, endpoints: &[Endpoint]) -> Result<Vec<Endpoint>> {
        let mut filtered: Vec<Endpoint> = endpoints
            .iter()
            .filter(|e| e.is_datagram() == self.mode.is_datagram())
            .filter(|e| !self.secure || e.is_secure())
            .map(|e| {
                let mut endpoint = e.clone();
                if let Some(timeout) = self.timeout {
                    endpoint.timeout = timeout;
                }
                if let Some(compress) = self.compress {
                    endpoint.compress = compress;
                }
                endpoint
            })
            .collect();

        if self.endpoint_selection == EndpointSelection::Random {
            filtered.shuffle(&mut rand::thread_rng());
        }
        if self.prefer_secure {
            filtered.sort_by_key(|e| !e.is_secure());
        } else {
            filtered.sort_by_key(Endpoint::is_secure);
        }

        if filtered.is_empty() {
            return Err(Error::new(
                ErrorKind::NoEndpoint,
                format!("no usable endpoint for `{self}`"),
            ));
        }
        Ok(filtered)
    }

    /// Parses the string form produced by `Display`.
    ///
    /// # Errors
    pub fn parse(s: &str, config: &RuntimeConfig) -> Result<Self> {
        let invalid = |m: String| Error::new(ErrorKind::InvalidArgument, m);

        let s = s.trim();
        let (identity, rest) = split_quoted(s, |c| c.is_whitespace() || c == ':' || c == '@')
            .ok_or_else(|| invalid(format!("unterminated quote in `{s}`")))?;
        let mut reference = Reference::new(identity.parse()?, config)?;

        let (options, target) = split_options(rest)
            .ok_or_else(|| invalid(format!("unterminated quote in `{s}`")))?;

        let mut tokens = options.into_iter();
        while let Some(option) = tokens.next() {
            match option {
                "-f" => {
                    let facet = tokens
                        .next()
                        .ok_or_else(|| invalid(format!("no facet after -f in `{s}`")))?;
                    reference.facet = facet.to_string();
                }
                "-t" => reference.mode = InvocationMode::Twoway,
                "-o" => reference.mode = InvocationMode::Oneway,
                "-O" => reference.mode = InvocationMode::BatchOneway,
                "-d" => reference.mode = InvocationMode::Datagram,
                "-D" => reference.mode = InvocationMode::BatchDatagram,
                "-s" => reference.secure = true,
                "-e" => {
                    let encoding = tokens
                        .next()
                        .ok_or_else(|| invalid(format!("no encoding after -e in `{s}`")))?;
                    reference.encoding = encoding.parse()?;
                }
                other => return Err(invalid(format!("unknown option `{other}` in `{s}`"))),
            }
        }

        if let Some(endpoints) = target.strip_prefix(':') {
            reference.endpoints = endpoints
                .split(':')
                .map(str::parse)
                .collect::<Result<Vec<Endpoint>>>()?;
        } else if let Some(adapter_id) = target.strip_prefix('@') {
            let adapter_id = adapter_id.trim().trim_matches('"');
            if adapter_id.is_empty() {
                return Err(invalid(format!("empty adapter id in `{s}`")));
            }
            reference.adapter_id = adapter_id.to_string();
        }
        Ok(reference)
    }
}

fn split_quoted(s: &str, is_end: impl Fn(char) -> bool) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('"') {
        let end = rest.find('"')?;
        Some((&rest[..end], &rest[end + 1..]))
    } else {
        let end = s.find(is_end).unwrap_or(s.len());
        Some((&s[..end], &s[end..]))
    }
}

/// Splits the options before the target into tokens, a quoted token
/// counting as one, and returns them with the rest starting at the first
/// `:` or `@` outside quotes.
fn split_options(s: &str) -> Option<(Vec<&str>, &str)> {
    let mut tokens = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() && !rest.starts_with([':', '@']) {
        let (token, tail) = split_quoted(rest, |c| c.is_whitespace() || c == ':' || c == '@')?;
        tokens.push(token);
        rest = tail.trim_start();
    }
    Some((tokens, rest))
}

fn quote_if_needed(s: &str) -> std::borrow::Cow<'_, str> {
    if s.contains(|c: char| c.is_whitespace() || c == ':' || c == '@') {
        format!("\"{s}\"").into()
    } else {
        s.into()
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", quote_if_needed(&self.identity.to_string()))?;
        if !self.facet.is_empty() {
            write!(f, " -f {}", quote_if_needed(&self.facet))?;
        }
        write!(f, " {}", self.mode.flag())?;
        if self.secure {
            write!(f, " -s")?;
        }
        if self.encoding != EncodingVersion::default() {
            write!(f, " -e {}", self.encoding)?;
        }
        if !self.endpoints.is_empty() {
            for endpoint in &self.endpoints {
                write!(f, ":{endpoint}")?;
            }
        } else if !self.adapter_id.is_empty() {
            write!(f, " @ {}", quote_if_needed(&self.adapter_id))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, &RuntimeConfig::default())
    }
}
