//! Type grammar
//!
//! ```text
//! T ::= atom | T '?' | T '[' N? ']'
//! ```
//!
//! Suffixes bind outer-to-inner, so `int[]?` is an optional list of ints
//! and `Tensor?[]` is a list of optional tensors. Parsing is exact: the
//! printed form of a parsed type must equal the input text.

use std::fmt;
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, digit1},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::many0,
    sequence::{delimited, pair},
    IResult,
};

use crate::error::SchemaError;

// ============================================================================
// Base types
// ============================================================================

/// Atomic types with no further structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BaseTy {
    Generator,
    ScalarType,
    Tensor,
    Int,
    Dimname,
    Float,
    Str,
    Bool,
    Layout,
    Device,
    Scalar,
    MemoryFormat,
    QScheme,
    Storage,
    Stream,
    SymInt,
    /// Legacy spelling kept for older schemas
    ConstQuantizerPtr,
}

impl BaseTy {
    pub const ALL: [BaseTy; 17] = [
        BaseTy::Generator,
        BaseTy::ScalarType,
        BaseTy::Tensor,
        BaseTy::Int,
        BaseTy::Dimname,
        BaseTy::Float,
        BaseTy::Str,
        BaseTy::Bool,
        BaseTy::Layout,
        BaseTy::Device,
        BaseTy::Scalar,
        BaseTy::MemoryFormat,
        BaseTy::QScheme,
        BaseTy::Storage,
        BaseTy::Stream,
        BaseTy::SymInt,
        BaseTy::ConstQuantizerPtr,
    ];

    /// Surface spelling in schema text
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseTy::Generator => "Generator",
            BaseTy::ScalarType => "ScalarType",
            BaseTy::Tensor => "Tensor",
            BaseTy::Int => "int",
            BaseTy::Dimname => "Dimname",
            BaseTy::Float => "float",
            BaseTy::Str => "str",
            BaseTy::Bool => "bool",
            BaseTy::Layout => "Layout",
            BaseTy::Device => "Device",
            BaseTy::Scalar => "Scalar",
            BaseTy::MemoryFormat => "MemoryFormat",
            BaseTy::QScheme => "QScheme",
            BaseTy::Storage => "Storage",
            BaseTy::Stream => "Stream",
            BaseTy::SymInt => "SymInt",
            BaseTy::ConstQuantizerPtr => "ConstQuantizerPtr",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|ty| ty.as_str() == name)
    }
}

impl fmt::Display for BaseTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Types
// ============================================================================

/// A type in the schema language
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Base(BaseTy),
    /// May be given `None`
    Optional(Box<Type>),
    /// Homogeneous list, optionally with a fixed size (`int[2]`)
    List { elem: Box<Type>, size: Option<usize> },
}

impl Type {
    pub fn base(ty: BaseTy) -> Self {
        Type::Base(ty)
    }

    pub fn optional(elem: Type) -> Self {
        Type::Optional(Box::new(elem))
    }

    pub fn list(elem: Type, size: Option<usize>) -> Self {
        Type::List {
            elem: Box::new(elem),
            size,
        }
    }

    /// Parse a type, rejecting anything that does not print back identically
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let ty = match all_consuming(type_expr)(text) {
            Ok((_, (atom, suffixes))) => {
                let base = BaseTy::from_name(atom)
                    .ok_or_else(|| SchemaError::UnrecognizedType(text.to_string()))?;
                suffixes
                    .into_iter()
                    .fold(Type::Base(base), |inner, suffix| match suffix {
                        Suffix::Optional => Type::optional(inner),
                        Suffix::List(size) => Type::list(inner, size),
                    })
            }
            Err(_) => return Err(SchemaError::UnrecognizedType(text.to_string())),
        };
        SchemaError::check_round_trip("type", ty.to_string(), text)?;
        Ok(ty)
    }

    /// True for `Tensor` and anything wrapping it
    pub fn is_tensor_like(&self) -> bool {
        match self {
            Type::Base(ty) => *ty == BaseTy::Tensor,
            Type::Optional(elem) => elem.is_tensor_like(),
            Type::List { elem, .. } => elem.is_tensor_like(),
        }
    }

    pub fn is_nullable(&self) -> bool {
        match self {
            Type::Base(_) => false,
            Type::Optional(_) => true,
            Type::List { elem, .. } => elem.is_nullable(),
        }
    }

    /// The list type underneath any optional wrapper, if there is one
    pub fn is_list_like(&self) -> Option<&Type> {
        match self {
            Type::Base(_) => None,
            Type::Optional(elem) => elem.is_list_like(),
            Type::List { .. } => Some(self),
        }
    }

    pub fn is_base_ty(&self, ty: BaseTy) -> bool {
        matches!(self, Type::Base(base) if *base == ty)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Base(ty) => write!(f, "{}", ty),
            Type::Optional(elem) => write!(f, "{}?", elem),
            // A zero size prints as an unsized list, so `int[0]` never round trips
            Type::List {
                elem,
                size: Some(size),
            } if *size > 0 => write!(f, "{}[{}]", elem, size),
            Type::List { elem, .. } => write!(f, "{}[]", elem),
        }
    }
}

impl FromStr for Type {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Type::parse(s)
    }
}

// ============================================================================
// Internal Parsers
// ============================================================================

enum Suffix {
    Optional,
    List(Option<usize>),
}

fn type_expr(input: &str) -> IResult<&str, (&str, Vec<Suffix>)> {
    pair(atom, many0(suffix))(input)
}

fn atom(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn suffix(input: &str) -> IResult<&str, Suffix> {
    alt((
        map(char('?'), |_| Suffix::Optional),
        map(
            delimited(
                char('['),
                opt(map_res(digit1, str::parse::<usize>)),
                char(']'),
            ),
            Suffix::List,
        ),
    ))(input)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_types() {
        for ty in BaseTy::ALL {
            assert_eq!(Type::parse(ty.as_str()).unwrap(), Type::Base(ty));
        }
    }

    #[test]
    fn test_suffixes_bind_outer_to_inner() {
        assert_eq!(
            Type::parse("int[]?").unwrap(),
            Type::optional(Type::list(Type::base(BaseTy::Int), None))
        );
        assert_eq!(
            Type::parse("Tensor?[]").unwrap(),
            Type::list(Type::optional(Type::base(BaseTy::Tensor)), None)
        );
        assert_eq!(
            Type::parse("bool[3]").unwrap(),
            Type::list(Type::base(BaseTy::Bool), Some(3))
        );
    }

    #[test]
    fn test_round_trip() {
        for text in ["SymInt[]", "int[2]?", "Tensor?[]", "Dimname[1]", "ScalarType?"] {
            assert_eq!(Type::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_non_canonical_sizes_rejected() {
        assert!(matches!(
            Type::parse("int[0]"),
            Err(SchemaError::RoundTrip { .. })
        ));
        assert!(matches!(
            Type::parse("int[01]"),
            Err(SchemaError::RoundTrip { .. })
        ));
    }

    #[test]
    fn test_unrecognized_types() {
        for text in ["Tensorr", "int[", "int]", "", "Tensor(a)", "int []", "?"] {
            assert!(
                matches!(Type::parse(text), Err(SchemaError::UnrecognizedType(_))),
                "{text} should not parse"
            );
        }
    }

    #[test]
    fn test_predicates() {
        let ty = Type::parse("Tensor?[]").unwrap();
        assert!(ty.is_tensor_like());
        assert!(ty.is_nullable());
        assert_eq!(ty.is_list_like(), Some(&ty));

        let ty = Type::parse("int[]?").unwrap();
        assert!(!ty.is_tensor_like());
        assert!(ty.is_nullable());
        assert_eq!(
            ty.is_list_like(),
            Some(&Type::list(Type::base(BaseTy::Int), None))
        );

        assert!(Type::parse("Tensor").unwrap().is_base_ty(BaseTy::Tensor));
        assert!(!Type::parse("Tensor?").unwrap().is_base_ty(BaseTy::Tensor));
    }
}
