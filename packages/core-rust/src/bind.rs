//! Parameter binding: string-keyed parameters into typed operation requests.
//!
//! Binding is total and side-effect free. A field that fails to parse is an
//! error, never a silently substituted default.

use std::collections::hash_map;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::status::StatusCode;

/// Errors produced by a binding rule. All of them surface as
/// `StatusCode::MalformedRequest`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("missing parameter: {name}")]
    Missing { name: String },
    #[error("invalid value {value:?} for parameter {name}: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
    #[error("unexpected parameter: {name}")]
    Unexpected { name: String },
}

impl From<BindError> for StatusCode {
    fn from(_: BindError) -> Self {
        StatusCode::MalformedRequest
    }
}

/// Unordered parameter name to string value mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(HashMap<String, String>);

impl Params {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// # Errors
    ///
    /// Returns `BindError::Missing` if the parameter is absent.
    pub fn require(&self, name: &str) -> Result<&str, BindError> {
        self.get(name).ok_or_else(|| BindError::Missing {
            name: name.to_string(),
        })
    }

    /// Parses a required parameter with its `FromStr` implementation.
    ///
    /// # Errors
    ///
    /// Returns `BindError::Missing` if absent, `BindError::Invalid` if the
    /// value does not parse.
    pub fn parse<T>(&self, name: &str) -> Result<T, BindError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.require(name)?;
        parse_value(name, raw)
    }

    /// Like [`parse`](Self::parse) but an absent parameter yields `None`.
    ///
    /// # Errors
    ///
    /// Returns `BindError::Invalid` if the parameter is present and does not
    /// parse.
    pub fn parse_opt<T>(&self, name: &str) -> Result<Option<T>, BindError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(name)
            .map(|raw| parse_value(name, raw))
            .transpose()
    }

    /// Fails if any parameter is present. For operations that take none and
    /// want to be strict about it.
    ///
    /// # Errors
    ///
    /// Returns `BindError::Unexpected` naming one of the extra parameters.
    pub fn expect_empty(&self) -> Result<(), BindError> {
        match self.0.keys().next() {
            Some(name) => Err(BindError::Unexpected { name: name.clone() }),
            None => Ok(()),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, String> {
        self.0.iter()
    }

    #[must_use]
    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

impl From<HashMap<String, String>> for Params {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a String, &'a String);
    type IntoIter = hash_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, BindError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>().map_err(|e| BindError::Invalid {
        name: name.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// A typed request value produced from parameters.
pub trait Bind: Sized {
    /// # Errors
    ///
    /// Returns a `BindError` when the parameters do not describe a valid
    /// request.
    fn bind(params: &Params) -> Result<Self, BindError>;
}

/// Operations without parameters ignore whatever they are given.
impl Bind for () {
    fn bind(_params: &Params) -> Result<Self, BindError> {
        Ok(())
    }
}
