use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Namespace used for identifiers written without a `namespace:` prefix.
pub const CORE_NAMESPACE: &str = "core";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("component identifier must not be empty")]
    Empty,

    #[error("invalid component identifier '{0}', expected 'namespace:name' or 'name'")]
    Invalid(String),
}

/// Identifies the kind of component that produced an event, e.g. `http:listener`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ComponentIdentifier {
    namespace: String,
    name: String,
}

impl ComponentIdentifier {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for ComponentIdentifier {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LocationError::Empty);
        }
        match s.split_once(':') {
            None => Ok(Self::new(CORE_NAMESPACE, s)),
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains(':') =>
            {
                Ok(Self::new(namespace, name))
            }
            Some(_) => Err(LocationError::Invalid(s.to_string())),
        }
    }
}

impl fmt::Display for ComponentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Where in a flow an event entered the runtime.
///
/// `location` is the component path inside the flow (for example `orders/source`), while
/// the identifier names the connector and source that produced the event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ComponentLocation {
    location: String,
    identifier: ComponentIdentifier,
}

impl ComponentLocation {
    pub fn new(location: impl Into<String>, identifier: ComponentIdentifier) -> Self {
        Self {
            location: location.into(),
            identifier,
        }
    }

    pub fn parse(location: impl Into<String>, identifier: &str) -> Result<Self, LocationError> {
        Ok(Self::new(location, identifier.parse()?))
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn identifier(&self) -> &ComponentIdentifier {
        &self.identifier
    }

    /// The connector namespace, e.g. `http` for `http:listener`.
    pub fn connector_name(&self) -> &str {
        self.identifier.namespace()
    }

    /// The source name, e.g. `listener` for `http:listener`.
    pub fn source_name(&self) -> &str {
        self.identifier.name()
    }
}

impl fmt::Display for ComponentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.location, self.identifier)
    }
}
