//! Alias annotations: `a`, `a!`, `a -> *`, `a! -> *`
//!
//! Annotations describe aliasing and mutation of Tensor-shaped values. They
//! are carried on the owning argument or return rather than inside the
//! [`Type`](crate::types::Type), since the only nesting that occurs is
//! directly on a Tensor, optionally wrapped in `?` or `[]`.

use std::fmt;
use std::str::FromStr;

use nom::{
    bytes::complete::tag,
    character::complete::{char, satisfy},
    combinator::{all_consuming, opt},
    sequence::tuple,
    IResult,
};

use crate::error::SchemaError;

const BECOMES_WILDCARD: &str = " -> *";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Annotation {
    /// Alias set labels; the grammar only ever produces one
    pub alias_set: Vec<String>,
    pub is_write: bool,
    /// After the call, the value may alias anything (`-> *`)
    pub becomes_wildcard: bool,
}

impl Annotation {
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let (label, is_write, becomes_wildcard) = match all_consuming(annotation)(text) {
            Ok((_, parsed)) => parsed,
            Err(_) => return Err(SchemaError::UnrecognizedAnnotation(text.to_string())),
        };
        let ann = Annotation {
            alias_set: vec![label.to_string()],
            is_write,
            becomes_wildcard,
        };
        SchemaError::check_round_trip("annotation", ann.to_string(), text)?;
        Ok(ann)
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.alias_set.join("|"))?;
        if self.is_write {
            f.write_str("!")?;
        }
        if self.becomes_wildcard {
            f.write_str(BECOMES_WILDCARD)?;
        }
        Ok(())
    }
}

impl FromStr for Annotation {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Annotation::parse(s)
    }
}

fn annotation(input: &str) -> IResult<&str, (char, bool, bool)> {
    let (input, (label, write, wildcard)) = tuple((
        satisfy(|c| c.is_ascii_lowercase()),
        opt(char('!')),
        opt(tag(BECOMES_WILDCARD)),
    ))(input)?;
    Ok((input, (label, write.is_some(), wildcard.is_some())))
}
