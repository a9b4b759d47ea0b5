//! Argument list classification
//!
//! A flat, comma-joined argument list is split into seven ordered buckets:
//!
//! ```text
//! pre_self_positional, self, post_self_positional,
//! * pre_tensor_options_kwarg_only, tensor_options, post_tensor_options_kwarg_only,
//!   out
//! ```
//!
//! Classification runs in two phases. The first scan routes each argument to
//! positional, kwarg-only or out, switching to out at the first mutable
//! kwarg-only argument. The second pass carves `self` out of the positional
//! list and collapses the `(dtype, layout, device, pin_memory)` quad out of
//! the kwarg-only list.

use std::fmt;
use std::str::FromStr;

use crate::argument::{Argument, SelfArgument, TensorOptionsArguments};
use crate::error::SchemaError;
use crate::types::{BaseTy, Type};

/// Classified parameter list of one schema
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct Arguments {
    /// Usually empty; non-empty for schemas like `where.self` whose
    /// condition comes before `self`
    pub pre_self_positional: Vec<Argument>,
    pub self_arg: Option<SelfArgument>,
    pub post_self_positional: Vec<Argument>,

    pub pre_tensor_options_kwarg_only: Vec<Argument>,
    pub tensor_options: Option<TensorOptionsArguments>,
    /// Typically `memory_format`, placed after the options quad
    pub post_tensor_options_kwarg_only: Vec<Argument>,

    /// Mutable keyword-only arguments; these are also kwarg-only
    pub out: Vec<Argument>,
}

/// One slot of the structured view over [`Arguments`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentItem<'a> {
    Argument(&'a Argument),
    SelfArg(&'a SelfArgument),
    TensorOptions(&'a TensorOptionsArguments),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Positional,
    KwargOnly,
    Out,
}

impl Arguments {
    /// Build from explicit buckets, checking the structural invariants
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pre_self_positional: Vec<Argument>,
        self_arg: Option<SelfArgument>,
        post_self_positional: Vec<Argument>,
        pre_tensor_options_kwarg_only: Vec<Argument>,
        tensor_options: Option<TensorOptionsArguments>,
        post_tensor_options_kwarg_only: Vec<Argument>,
        out: Vec<Argument>,
    ) -> Result<Self, SchemaError> {
        let args = Arguments {
            pre_self_positional,
            self_arg,
            post_self_positional,
            pre_tensor_options_kwarg_only,
            tensor_options,
            post_tensor_options_kwarg_only,
            out,
        };
        args.validate()?;
        Ok(args)
    }

    /// Parse the text between the parentheses of a schema,
    /// e.g. `Tensor self, Tensor other, *, Scalar alpha=1`
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let (positional, kwarg_only, out) = Self::preparse(text)?;

        // Split self argument
        let (pre_self_positional, self_arg, post_self_positional) =
            match positional.iter().position(|a| a.name == "self") {
                Some(ix) => {
                    let mut rest = positional;
                    let post = rest.split_off(ix + 1);
                    let self_arg = rest.pop().map(|argument| SelfArgument { argument });
                    (rest, self_arg, post)
                }
                None => (Vec::new(), None, positional),
            };

        // Group tensor options arguments
        let (pre_tensor_options_kwarg_only, tensor_options, post_tensor_options_kwarg_only) =
            match find_tensor_options(&kwarg_only) {
                Some(ix) => {
                    let mut pre = kwarg_only;
                    let post = pre.split_off(ix + TENSOR_OPTIONS_PATTERN.len());
                    let quad = pre.split_off(ix);
                    let tensor_options = <[Argument; 4]>::try_from(quad).ok().map(
                        |[dtype, layout, device, pin_memory]| TensorOptionsArguments {
                            dtype,
                            layout,
                            device,
                            pin_memory,
                        },
                    );
                    (pre, tensor_options, post)
                }
                None => (kwarg_only, None, Vec::new()),
            };

        let args = Arguments::new(
            pre_self_positional,
            self_arg,
            post_self_positional,
            pre_tensor_options_kwarg_only,
            tensor_options,
            post_tensor_options_kwarg_only,
            out,
        )?;
        SchemaError::check_round_trip("arguments", args.to_string(), text)?;
        Ok(args)
    }

    /// First phase: route every argument to positional, kwarg-only or out.
    ///
    /// A write-annotated argument seen while collecting kwarg-only arguments
    /// switches the target to out for the rest of the list; mutable
    /// positional arguments stay positional.
    fn preparse(text: &str) -> Result<(Vec<Argument>, Vec<Argument>, Vec<Argument>), SchemaError> {
        let mut positional = Vec::new();
        let mut kwarg_only = Vec::new();
        let mut out = Vec::new();
        let mut bucket = Bucket::Positional;

        for raw in text.split(", ") {
            if raw.is_empty() {
                continue;
            }
            if raw == "*" {
                if bucket != Bucket::Positional {
                    return Err(SchemaError::DuplicateKwargOnlyMarker(text.to_string()));
                }
                bucket = Bucket::KwargOnly;
                continue;
            }
            let arg = Argument::parse(raw)?;
            if arg.is_write() {
                if bucket == Bucket::KwargOnly {
                    bucket = Bucket::Out;
                }
            } else if bucket == Bucket::Out {
                return Err(SchemaError::NonMutableAfterOut {
                    argument: raw.to_string(),
                    arguments: text.to_string(),
                });
            }
            match bucket {
                Bucket::Positional => positional.push(arg),
                Bucket::KwargOnly => kwarg_only.push(arg),
                Bucket::Out => out.push(arg),
            }
        }

        Ok((positional, kwarg_only, out))
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.self_arg.is_none() && !self.pre_self_positional.is_empty() {
            return Err(SchemaError::invariant(
                self.to_string(),
                "arguments before self require a self argument",
            ));
        }
        if self.tensor_options.is_none() && !self.post_tensor_options_kwarg_only.is_empty() {
            return Err(SchemaError::invariant(
                self.to_string(),
                "arguments after tensor options require tensor options",
            ));
        }
        if self.pre_self_positional.iter().any(|a| a.annotation.is_some()) {
            return Err(SchemaError::invariant(
                self.to_string(),
                "annotated pre_self_positional arguments are not currently supported in the schema",
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Flat views
    // ------------------------------------------------------------------------

    pub fn flat_positional(&self) -> Vec<&Argument> {
        self.pre_self_positional
            .iter()
            .chain(self.self_arg.as_ref().map(|s| &s.argument))
            .chain(self.post_self_positional.iter())
            .collect()
    }

    /// Keyword-only arguments, not including out arguments
    pub fn flat_kwarg_only(&self) -> Vec<&Argument> {
        let mut ret: Vec<&Argument> = self.pre_tensor_options_kwarg_only.iter().collect();
        if let Some(opts) = &self.tensor_options {
            ret.extend(opts.all());
        }
        ret.extend(self.post_tensor_options_kwarg_only.iter());
        ret
    }

    pub fn flat_non_out(&self) -> Vec<&Argument> {
        let mut ret = self.flat_positional();
        ret.extend(self.flat_kwarg_only());
        ret
    }

    pub fn flat_all(&self) -> Vec<&Argument> {
        let mut ret = self.flat_non_out();
        ret.extend(self.out.iter());
        ret
    }

    pub fn post_self_positional_mutable(&self) -> Vec<&Argument> {
        self.post_self_positional
            .iter()
            .filter(|a| a.is_write())
            .collect()
    }

    pub fn mutable_arg_names(&self) -> Vec<&str> {
        self.flat_all()
            .into_iter()
            .filter(|a| a.is_write())
            .map(|a| a.name.as_str())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Structured views
    // ------------------------------------------------------------------------

    pub fn positional(&self) -> Vec<ArgumentItem<'_>> {
        self.pre_self_positional
            .iter()
            .map(ArgumentItem::Argument)
            .chain(self.self_arg.as_ref().map(ArgumentItem::SelfArg))
            .chain(self.post_self_positional.iter().map(ArgumentItem::Argument))
            .collect()
    }

    pub fn kwarg_only(&self) -> Vec<ArgumentItem<'_>> {
        self.pre_tensor_options_kwarg_only
            .iter()
            .map(ArgumentItem::Argument)
            .chain(self.tensor_options.as_ref().map(ArgumentItem::TensorOptions))
            .chain(
                self.post_tensor_options_kwarg_only
                    .iter()
                    .map(ArgumentItem::Argument),
            )
            .collect()
    }

    pub fn non_out(&self) -> Vec<ArgumentItem<'_>> {
        let mut ret = self.positional();
        ret.extend(self.kwarg_only());
        ret
    }

    pub fn all(&self) -> Vec<ArgumentItem<'_>> {
        let mut ret = self.non_out();
        ret.extend(self.out.iter().map(ArgumentItem::Argument));
        ret
    }

    // ------------------------------------------------------------------------
    // Transformations
    // ------------------------------------------------------------------------

    /// Annotation-free arguments shared by every mutability variant.
    ///
    /// Tensor options and out arguments are dropped; the post-options
    /// keyword arguments fold into the pre-options bucket.
    pub fn signature(&self, strip_default: bool) -> Arguments {
        let strip = |a: &Argument| Argument {
            name: a.name.clone(),
            ty: a.ty.clone(),
            default: if strip_default { None } else { a.default.clone() },
            annotation: None,
        };
        Arguments {
            pre_self_positional: self.pre_self_positional.iter().map(strip).collect(),
            self_arg: self.self_arg.as_ref().map(|s| SelfArgument {
                argument: strip(&s.argument),
            }),
            post_self_positional: self.post_self_positional.iter().map(strip).collect(),
            pre_tensor_options_kwarg_only: self
                .pre_tensor_options_kwarg_only
                .iter()
                .chain(self.post_tensor_options_kwarg_only.iter())
                .map(strip)
                .collect(),
            tensor_options: None,
            post_tensor_options_kwarg_only: Vec::new(),
            out: Vec::new(),
        }
    }

    pub fn remove_self_annotation(&self) -> Result<Arguments, SchemaError> {
        let self_arg = self.self_arg.as_ref().ok_or_else(|| {
            SchemaError::invariant(self.to_string(), "no self argument to strip")
        })?;
        Ok(Arguments {
            self_arg: Some(SelfArgument {
                argument: self_arg.argument.without_annotation(),
            }),
            ..self.clone()
        })
    }

    pub fn with_out_args(&self, outs: Vec<Argument>) -> Result<Arguments, SchemaError> {
        if !self.out.is_empty() {
            return Err(SchemaError::invariant(
                self.to_string(),
                "arguments already have out arguments",
            ));
        }
        Ok(Arguments {
            out: outs,
            ..self.clone()
        })
    }
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .flat_positional()
            .iter()
            .map(|a| a.to_string())
            .collect();
        let kwarg_only = self.flat_kwarg_only();
        if !kwarg_only.is_empty() || !self.out.is_empty() {
            parts.push("*".to_string());
        }
        parts.extend(kwarg_only.iter().map(|a| a.to_string()));
        parts.extend(self.out.iter().map(|a| a.to_string()));
        f.write_str(&parts.join(", "))
    }
}

impl FromStr for Arguments {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Arguments::parse(s)
    }
}

// ============================================================================
// Tensor options detection
// ============================================================================

/// Order matters
const TENSOR_OPTIONS_PATTERN: [(&str, BaseTy); 4] = [
    ("dtype", BaseTy::ScalarType),
    ("layout", BaseTy::Layout),
    ("device", BaseTy::Device),
    ("pin_memory", BaseTy::Bool),
];

fn matches_option(arg: &Argument, name: &str, ty: BaseTy) -> bool {
    arg.name == name
        && match &arg.ty {
            Type::Base(base) => *base == ty,
            Type::Optional(elem) => elem.is_base_ty(ty),
            Type::List { .. } => false,
        }
}

/// Start of the first window of kwarg-only arguments matching the quad
fn find_tensor_options(kwarg_only: &[Argument]) -> Option<usize> {
    kwarg_only
        .windows(TENSOR_OPTIONS_PATTERN.len())
        .position(|window| {
            window
                .iter()
                .zip(TENSOR_OPTIONS_PATTERN.iter())
                .all(|(arg, (name, ty))| matches_option(arg, name, *ty))
        })
}

// ============================================================================
// Tests
// ============================================================================
