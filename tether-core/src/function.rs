//! Remote function identifiers and call payloads.

use crate::error::{TetherResult, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Maximum accepted length of a function identifier.
const MAX_FUNCTION_NAME_LEN: usize = 256;

/// Validated identifier of a remote function, e.g. `messages:list`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionName(String);

impl FunctionName {
    /// Validate and wrap a function identifier.
    ///
    /// Names must be non-empty, at most 256 bytes and free of whitespace and
    /// control characters.
    pub fn new(name: impl Into<String>) -> TetherResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::InvalidFunctionName {
                name,
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        if name.len() > MAX_FUNCTION_NAME_LEN {
            return Err(ValidationError::InvalidFunctionName {
                name,
                reason: format!("must be at most {} bytes", MAX_FUNCTION_NAME_LEN),
            }
            .into());
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::InvalidFunctionName {
                name,
                reason: "must not contain whitespace or control characters".to_string(),
            }
            .into());
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FunctionName {
    type Error = crate::TetherError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for FunctionName {
    type Error = crate::TetherError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FunctionName> for String {
    fn from(value: FunctionName) -> Self {
        value.0
    }
}

/// A function identifier together with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub function: FunctionName,
    pub args: Value,
}

impl FunctionCall {
    pub fn new(function: FunctionName, args: Value) -> Self {
        Self { function, args }
    }

    /// Copy of this call with `paginationOpts` merged into the arguments.
    ///
    /// Non-object arguments are rejected because the options must live next
    /// to the caller's own fields.
    pub fn with_pagination(
        &self,
        num_items: usize,
        cursor: Option<&str>,
        end_cursor: Option<&str>,
    ) -> TetherResult<Self> {
        let mut args = match &self.args {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(ValidationError::InvalidArgs {
                    reason: format!("paginated arguments must be an object, got {}", other),
                }
                .into())
            }
        };
        let mut opts = serde_json::Map::new();
        opts.insert("numItems".to_string(), Value::from(num_items));
        opts.insert(
            "cursor".to_string(),
            cursor.map(Value::from).unwrap_or(Value::Null),
        );
        if let Some(end) = end_cursor {
            opts.insert("endCursor".to_string(), Value::from(end));
        }
        args.insert("paginationOpts".to_string(), Value::Object(opts));
        Ok(Self {
            function: self.function.clone(),
            args: Value::Object(args),
        })
    }
}

/// Arguments for a query, or the sentinel meaning "do not fetch".
#[derive(Debug, Clone, PartialEq, Default)]
pub enum QueryArgs {
    #[default]
    Skip,
    Args(Value),
}

impl QueryArgs {
    pub fn skip() -> Self {
        QueryArgs::Skip
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, QueryArgs::Skip)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            QueryArgs::Skip => None,
            QueryArgs::Args(value) => Some(value),
        }
    }
}

impl From<Value> for QueryArgs {
    fn from(value: Value) -> Self {
        QueryArgs::Args(value)
    }
}

impl From<Option<Value>> for QueryArgs {
    fn from(value: Option<Value>) -> Self {
        value.map(QueryArgs::Args).unwrap_or(QueryArgs::Skip)
    }
}
