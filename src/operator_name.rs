//! Operator names
//!
//! A base name carries two bits derived from its spelling: whether it is
//! inplace (`add_`, `__iadd__`) and whether it is a dunder method
//! (`__add__`). The full [`OperatorName`] adds an optional `.overload`.

use std::fmt;
use std::str::FromStr;

use crate::error::SchemaError;

/// Names that validly appear as `__iXXX__`, marking inplace operators
pub const AUGMENTED_ASSIGNMENT_NAMES: [&str; 11] = [
    "add", "sub", "mul", "div", "mod", "pow", "lshift", "rshift", "and", "xor", "or",
];

/// Operator identity without its overload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BaseOperatorName {
    pub base: String,
    pub inplace: bool,
    pub dunder_method: bool,
}

impl BaseOperatorName {
    pub fn parse(op: &str) -> Result<Self, SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidOperatorName {
            name: op.to_string(),
            reason: reason.to_string(),
        };
        if op.is_empty() {
            return Err(invalid("operator name is empty"));
        }
        if op.ends_with("_out") {
            return Err(invalid(
                "_out suffix is reserved and not permitted for operator names; \
                 did you mean to specify an out overload name instead?",
            ));
        }

        let name = match dunder_inner(op) {
            Some(inner) => {
                match inner
                    .strip_prefix('i')
                    .filter(|verb| AUGMENTED_ASSIGNMENT_NAMES.contains(verb))
                {
                    Some(verb) => BaseOperatorName {
                        base: verb.to_string(),
                        inplace: true,
                        dunder_method: true,
                    },
                    None => {
                        // Historically true of every dunder method we support
                        if inner.starts_with('i') {
                            return Err(invalid(
                                "dunder methods starting with 'i' must be augmented assignments",
                            ));
                        }
                        BaseOperatorName {
                            base: inner.to_string(),
                            inplace: false,
                            dunder_method: true,
                        }
                    }
                }
            }
            None => match op.strip_suffix('_') {
                Some(base) => BaseOperatorName {
                    base: base.to_string(),
                    inplace: true,
                    dunder_method: false,
                },
                None => BaseOperatorName {
                    base: op.to_string(),
                    inplace: false,
                    dunder_method: false,
                },
            },
        };
        SchemaError::check_round_trip("operator name", name.to_string(), op)?;
        Ok(name)
    }
}

/// `__name__` with no underscores inside
fn dunder_inner(op: &str) -> Option<&str> {
    op.strip_prefix("__")
        .and_then(|rest| rest.strip_suffix("__"))
        .filter(|inner| !inner.is_empty() && !inner.contains('_'))
}

impl fmt::Display for BaseOperatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dunder_method {
            let i = if self.inplace { "i" } else { "" };
            write!(f, "__{}{}__", i, self.base)
        } else {
            let i = if self.inplace { "_" } else { "" };
            write!(f, "{}{}", self.base, i)
        }
    }
}

impl FromStr for BaseOperatorName {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BaseOperatorName::parse(s)
    }
}

/// Base operator name plus overload, e.g. `add_.Tensor`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorName {
    pub name: BaseOperatorName,
    /// Empty for the default overload
    pub overload_name: String,
}

impl OperatorName {
    pub fn parse(op_name: &str) -> Result<Self, SchemaError> {
        let (name, overload_name) = op_name.split_once('.').unwrap_or((op_name, ""));
        let r = OperatorName {
            name: BaseOperatorName::parse(name)?,
            overload_name: overload_name.to_string(),
        };
        SchemaError::check_round_trip("operator name", r.to_string(), op_name)?;
        Ok(r)
    }

    /// `op` or `op_overload`, matching the generated operator struct names
    pub fn unambiguous_name(&self) -> String {
        if self.overload_name.is_empty() {
            self.name.to_string()
        } else {
            format!("{}_{}", self.name, self.overload_name)
        }
    }

    pub fn remove_inplace(&self) -> OperatorName {
        OperatorName {
            name: BaseOperatorName {
                inplace: false,
                ..self.name.clone()
            },
            overload_name: self.overload_name.clone(),
        }
    }

    pub fn with_overload(&self, overload: &str) -> OperatorName {
        OperatorName {
            name: BaseOperatorName {
                inplace: false,
                ..self.name.clone()
            },
            overload_name: overload.to_string(),
        }
    }
}

impl fmt::Display for OperatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.overload_name.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.name, self.overload_name)
        }
    }
}

impl FromStr for OperatorName {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperatorName::parse(s)
    }
}
