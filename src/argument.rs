//! Arguments and returns
//!
//! Surface forms:
//!
//! ```text
//! argument ::= type-with-annotation ' ' name ('=' default)?
//! return   ::= type-with-annotation (' ' name)?
//! type-with-annotation ::= 'Tensor(' annotation ')' ('' | '?' | '[]') | type
//! ```

use std::fmt;
use std::str::FromStr;

use crate::annotation::Annotation;
use crate::error::SchemaError;
use crate::types::Type;

/// One formal parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Argument {
    pub name: String,
    pub ty: Type,
    pub default: Option<String>,
    pub annotation: Option<Annotation>,
}

impl Argument {
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let (type_and_annot, name_and_default) = text
            .rsplit_once(' ')
            .ok_or_else(|| SchemaError::InvalidArgument(text.to_string()))?;
        let (name, default) = match name_and_default.split_once('=') {
            Some((name, default)) => (name, Some(default.to_string())),
            None => (name_and_default, None),
        };
        let (ty, annotation) = parse_annotated_type(type_and_annot)?;
        let arg = Argument {
            name: name.to_string(),
            ty,
            default,
            annotation,
        };
        SchemaError::check_round_trip("argument", arg.to_string(), text)?;
        Ok(arg)
    }

    pub fn is_write(&self) -> bool {
        self.annotation.as_ref().is_some_and(|a| a.is_write)
    }

    /// Same argument with its alias annotation removed
    pub fn without_annotation(&self) -> Self {
        Argument {
            annotation: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_annotated_type(f, &self.ty, self.annotation.as_ref())?;
        write!(f, " {}", self.name)?;
        match &self.default {
            Some(default) if !default.is_empty() => write!(f, "={}", default),
            _ => Ok(()),
        }
    }
}

impl FromStr for Argument {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Argument::parse(s)
    }
}

/// One result slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Return {
    pub name: Option<String>,
    pub ty: Type,
    pub annotation: Option<Annotation>,
}

impl Return {
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        // A trailing word only counts as a name if it is an identifier;
        // otherwise `Tensor(a -> *)` would lose half its annotation.
        let (type_and_annot, name) = match text.rsplit_once(' ') {
            Some((ty, name)) if is_identifier(name) => (ty, Some(name.to_string())),
            _ => (text, None),
        };
        let (ty, annotation) = parse_annotated_type(type_and_annot)?;
        let ret = Return {
            name,
            ty,
            annotation,
        };
        SchemaError::check_round_trip("return", ret.to_string(), text)?;
        Ok(ret)
    }

    pub fn is_write(&self) -> bool {
        self.annotation.as_ref().is_some_and(|a| a.is_write)
    }
}

impl fmt::Display for Return {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_annotated_type(f, &self.ty, self.annotation.as_ref())?;
        if let Some(name) = &self.name {
            write!(f, " {}", name)?;
        }
        Ok(())
    }
}

impl FromStr for Return {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Return::parse(s)
    }
}

/// The positional argument literally named `self`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelfArgument {
    pub argument: Argument,
}

/// The `(dtype, layout, device, pin_memory)` keyword-only quad
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorOptionsArguments {
    pub dtype: Argument,
    pub layout: Argument,
    pub device: Argument,
    pub pin_memory: Argument,
}

impl TensorOptionsArguments {
    pub fn all(&self) -> [&Argument; 4] {
        [&self.dtype, &self.layout, &self.device, &self.pin_memory]
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Split `Tensor(a!)?` into the bare type `Tensor?` and its annotation
fn parse_annotated_type(text: &str) -> Result<(Type, Option<Annotation>), SchemaError> {
    if let Some(rest) = text.strip_prefix("Tensor(") {
        if let Some(close) = rest.rfind(')') {
            let (inner, suffix) = (&rest[..close], &rest[close + 1..]);
            if !inner.is_empty() {
                if !matches!(suffix, "" | "?" | "[]") {
                    return Err(SchemaError::InvalidAnnotatedType(text.to_string()));
                }
                let annotation = Annotation::parse(inner)?;
                let ty = Type::parse(&format!("Tensor{}", suffix))?;
                return Ok((ty, Some(annotation)));
            }
        }
    }
    Ok((Type::parse(text)?, None))
}

fn write_annotated_type(
    f: &mut fmt::Formatter<'_>,
    ty: &Type,
    annotation: Option<&Annotation>,
) -> fmt::Result {
    let ty = ty.to_string();
    match annotation {
        Some(ann) => f.write_str(&ty.replacen("Tensor", &format!("Tensor({})", ann), 1)),
        None => f.write_str(&ty),
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// Tests
// ============================================================================
