//! Function schemas
//!
//! A schema is `name(args) -> returns`. Construction checks the cross-field
//! aliasing rules between out arguments, `self` and the returns; once built,
//! a schema can be classified with [`FunctionSchema::kind`] and reduced to
//! the identity shared by all its mutability variants with
//! [`FunctionSchema::signature`].

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::argument::{Argument, Return};
use crate::arguments::Arguments;
use crate::error::SchemaError;
use crate::operator_name::{BaseOperatorName, OperatorName};
use crate::types::{BaseTy, Type};

static DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>[^\(]+)\((?P<args>.*)\) -> (?P<returns>.*)$")
        .expect("schema declaration regex is valid")
});

/// Mutability classification of a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SchemaKind {
    Functional,
    Inplace,
    Out,
    Mutable,
}

impl SchemaKind {
    pub const ALL: [SchemaKind; 4] = [
        SchemaKind::Functional,
        SchemaKind::Inplace,
        SchemaKind::Out,
        SchemaKind::Mutable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::Functional => "functional",
            SchemaKind::Inplace => "inplace",
            SchemaKind::Out => "out",
            SchemaKind::Mutable => "mutable",
        }
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs for [`FunctionSchema::signature_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignatureOptions {
    pub strip_default: bool,
    /// Drop `_copy` from the base name so view_copy ops pair with their view
    pub strip_view_copy_name: bool,
    /// Keep return names; returns synthesized from mutable inputs are
    /// named `<arg>_out`
    pub keep_return_names: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct FunctionSchema {
    pub name: OperatorName,
    pub arguments: Arguments,
    pub returns: Vec<Return>,
}

impl FunctionSchema {
    pub fn new(
        name: OperatorName,
        arguments: Arguments,
        returns: Vec<Return>,
    ) -> Result<Self, SchemaError> {
        let schema = FunctionSchema {
            name,
            arguments,
            returns,
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn parse(func: &str) -> Result<Self, SchemaError> {
        let caps = DECL_RE
            .captures(func)
            .ok_or_else(|| SchemaError::InvalidSchema(func.to_string()))?;
        let name = OperatorName::parse(&caps["name"])?;
        let arguments = Arguments::parse(&caps["args"])?;
        let returns = parse_returns(&caps["returns"])?;
        let schema = FunctionSchema::new(name, arguments, returns)?;
        SchemaError::check_round_trip("function schema", schema.to_string(), func)?;
        Ok(schema)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let fail = |message: &str| Err(SchemaError::invariant(self.to_string(), message));
        let args = &self.arguments;

        for (arg, ret) in args.out.iter().zip(&self.returns) {
            if arg.annotation != ret.annotation {
                return fail(
                    "out arguments must have matching return Tensor; the ith argument \
                     needs to correspond to the ith return",
                );
            }
        }

        for a in args.post_self_positional_mutable() {
            if self.returns.iter().any(|r| r.annotation == a.annotation) {
                return fail(
                    "if you have a schema with mutable positional args, \
                     we expect them to not be returned",
                );
            }
        }

        let out_and_self: Vec<&Argument> = args
            .out
            .iter()
            .chain(args.self_arg.as_ref().map(|s| &s.argument))
            .collect();
        let (mutable_returns, immutable_returns): (Vec<&Return>, Vec<&Return>) =
            self.returns.iter().partition(|r| r.is_write());
        if !mutable_returns.is_empty() && !immutable_returns.is_empty() {
            return fail("functions must have either only mutable returns, or only immutable returns");
        }
        for ret in &mutable_returns {
            if !out_and_self.iter().any(|a| a.annotation == ret.annotation) {
                return fail(
                    "all mutable returns must be aliased either to a keyword argument, or to \
                     \"self\"; did you forget to mark an out argument as keyword-only?",
                );
            }
        }

        if !args.out.is_empty() {
            let tensor = Type::base(BaseTy::Tensor);
            if args.out.iter().any(|a| a.ty != tensor) {
                if !self.returns.is_empty() {
                    return fail(
                        "out= ops that accept tensor lists as out arguments \
                         are expected to have no return type",
                    );
                }
            } else if args.out.len() != self.returns.len() {
                return fail(
                    "must return as many arguments as there are out arguments, or no return at all",
                );
            }
        }

        if self.name.name.inplace {
            if !args.out.is_empty() {
                return fail("a schema cannot be both inplace and out");
            }
            let self_arg = match &args.self_arg {
                Some(s) if s.argument.is_write() => &s.argument,
                _ => return fail("inplace operators require a mutable self argument"),
            };
            if self_arg.ty == Type::base(BaseTy::Tensor) {
                if self.returns.len() != 1 || self.returns[0].annotation != self_arg.annotation {
                    return fail("inplace operators with a Tensor self must return self");
                }
            } else if !self.returns.is_empty() {
                return fail("inplace operators with a non-Tensor self must not return anything");
            }
        }

        if args.tensor_options.is_some() && self.kind() != SchemaKind::Functional {
            return fail(
                "found an operator that is not functional, but has tensor options arguments; \
                 tensor options arguments are only allowed for factory functions",
            );
        }
        if self.is_functional_fn() && self.kind() != SchemaKind::Functional {
            return fail(
                "found an operator that is not functional, but its overload contains \
                 the string 'functional'",
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------------

    pub fn kind(&self) -> SchemaKind {
        if self.is_out_fn() {
            SchemaKind::Out
        } else if self.name.name.inplace {
            SchemaKind::Inplace
        } else if !self.arguments.post_self_positional_mutable().is_empty() {
            SchemaKind::Mutable
        } else {
            SchemaKind::Functional
        }
    }

    /// Out functions are those with a mutable keyword-only argument
    pub fn is_out_fn(&self) -> bool {
        !self.arguments.out.is_empty()
    }

    pub fn is_functional_fn(&self) -> bool {
        self.name.overload_name.contains("functional")
    }

    pub fn modifies_arguments(&self) -> bool {
        matches!(
            self.kind(),
            SchemaKind::Inplace | SchemaKind::Out | SchemaKind::Mutable
        )
    }

    /// Mixed returns are rejected at construction, so any one decides
    pub fn returns_are_aliased(&self) -> bool {
        self.returns.iter().any(|r| r.is_write())
    }

    pub fn schema_order_arguments(&self) -> Vec<&Argument> {
        self.arguments.flat_all()
    }

    /// For each return, the name of the input it aliases, if any
    pub fn aliased_return_names(&self) -> Result<Vec<Option<String>>, SchemaError> {
        let mut outs = Vec::with_capacity(self.returns.len());
        for r in &self.returns {
            let aliased: Vec<&Argument> = self
                .arguments
                .flat_all()
                .into_iter()
                .filter(|a| a.annotation.is_some() && a.annotation == r.annotation)
                .collect();
            match aliased.as_slice() {
                [] => outs.push(None),
                [a] => outs.push(Some(a.name.clone())),
                many => {
                    let names: Vec<&str> = many.iter().map(|a| a.name.as_str()).collect();
                    return Err(SchemaError::invariant(
                        self.to_string(),
                        format!(
                            "found a return ({}) that aliases multiple inputs ({})",
                            r.name.as_deref().unwrap_or(""),
                            names.join(", ")
                        ),
                    ));
                }
            }
        }
        Ok(outs)
    }

    /// Name of the generated C++ kernel, e.g. `add_out` for `add.out`
    pub fn kernel_name(&self) -> String {
        let name = self.name.name.to_string();
        if self.is_out_fn() {
            format!("{name}_out")
        } else {
            name
        }
    }

    // ------------------------------------------------------------------------
    // Canonicalization
    // ------------------------------------------------------------------------

    pub fn signature(&self) -> FunctionSchema {
        self.signature_with(SignatureOptions::default())
    }

    pub fn view_signature(&self) -> FunctionSchema {
        self.signature_with(SignatureOptions {
            strip_view_copy_name: true,
            ..SignatureOptions::default()
        })
    }

    /// The "core" signature shared by the functional, inplace, out and
    /// mutable variants of one operator.
    ///
    /// Mutable inputs that are not already returned become returns, in the
    /// order self, out, post-self positional.
    pub fn signature_with(&self, opts: SignatureOptions) -> FunctionSchema {
        let base = &self.name.name.base;
        let base = match base.strip_suffix("_copy") {
            Some(stripped) if opts.strip_view_copy_name => stripped.to_string(),
            _ => base.clone(),
        };

        let args = &self.arguments;
        let returns_from_mutable_inputs = args
            .self_arg
            .as_ref()
            .map(|s| &s.argument)
            .into_iter()
            .chain(args.out.iter())
            .chain(args.post_self_positional.iter())
            .filter(|a| a.is_write() && !self.returns.iter().any(|r| r.annotation == a.annotation))
            .map(|a| Return {
                name: opts.keep_return_names.then(|| format!("{}_out", a.name)),
                ty: a.ty.clone(),
                annotation: None,
            });
        let returns = self
            .returns
            .iter()
            .map(|r| Return {
                name: if opts.keep_return_names {
                    r.name.clone()
                } else {
                    None
                },
                ty: r.ty.clone(),
                annotation: None,
            })
            .chain(returns_from_mutable_inputs)
            .collect();

        let mut arguments = args.signature(opts.strip_default);
        // Legacy schemas whose signature default differs from their out variant
        match self.name.to_string().as_str() {
            "arange.start_step" => restore_default(&mut arguments, "step", BaseTy::Scalar, "1"),
            "bernoulli.p" => restore_default(&mut arguments, "p", BaseTy::Float, "0.5"),
            _ => {}
        }

        FunctionSchema {
            name: OperatorName {
                name: BaseOperatorName {
                    base,
                    inplace: false,
                    dunder_method: self.name.name.dunder_method,
                },
                overload_name: String::new(),
            },
            arguments,
            returns,
        }
    }

    pub fn with_name(&self, name: OperatorName) -> Result<FunctionSchema, SchemaError> {
        FunctionSchema::new(name, self.arguments.clone(), self.returns.clone())
    }
}

fn restore_default(arguments: &mut Arguments, name: &str, ty: BaseTy, default: &str) {
    let arg = arguments
        .post_self_positional
        .iter_mut()
        .find(|a| a.name == name && a.ty.is_base_ty(ty) && a.default.is_none());
    if let Some(arg) = arg {
        arg.default = Some(default.to_string());
    }
}

/// `()`, a single bare return, or a parenthesized comma-separated list
pub fn parse_returns(return_decl: &str) -> Result<Vec<Return>, SchemaError> {
    if return_decl == "()" {
        return Ok(Vec::new());
    }
    let inner = return_decl
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .unwrap_or(return_decl);
    inner.split(", ").map(Return::parse).collect()
}

impl fmt::Display for FunctionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) -> ", self.name, self.arguments)?;
        match self.returns.as_slice() {
            [single] => write!(f, "{}", single),
            returns => {
                let parts: Vec<String> = returns.iter().map(|r| r.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

impl FromStr for FunctionSchema {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FunctionSchema::parse(s)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(text: &str) -> FunctionSchema {
        FunctionSchema::parse(text).unwrap()
    }

    fn violation(text: &str) -> bool {
        matches!(FunctionSchema::parse(text), Err(SchemaError::Invariant { .. }))
    }

    #[test]
    fn test_kinds() {
        let f = schema("add.Tensor(Tensor self, Tensor other, *, Scalar alpha=1) -> Tensor");
        assert_eq!(f.kind(), SchemaKind::Functional);
        assert!(!f.modifies_arguments());

        let f = schema("add_.Tensor(Tensor(a!) self, Tensor other, *, Scalar alpha=1) -> Tensor(a!)");
        assert_eq!(f.kind(), SchemaKind::Inplace);
        assert!(f.returns_are_aliased());

        let f = schema(
            "add.out(Tensor self, Tensor other, *, Scalar alpha=1, Tensor(a!) out) -> Tensor(a!)",
        );
        assert_eq!(f.kind(), SchemaKind::Out);
        assert_eq!(f.kernel_name(), "add_out");

        let f = schema("_amp_foreach_non_finite_check_and_unscale_(Tensor(a!)[] self, Tensor(b!) found_inf, Tensor inv_scale) -> ()");
        assert_eq!(f.kind(), SchemaKind::Inplace);

        let f = schema("_amp_foreach_non_finite_check_and_unscale(Tensor[] self, Tensor(b!) found_inf, Tensor inv_scale) -> Tensor[]");
        assert_eq!(f.kind(), SchemaKind::Mutable);
    }

    #[test]
    fn test_returns_forms() {
        assert!(parse_returns("()").unwrap().is_empty());
        assert_eq!(parse_returns("Tensor").unwrap().len(), 1);
        let rets = parse_returns("(Tensor values, Tensor indices)").unwrap();
        assert_eq!(rets[1].name.as_deref(), Some("indices"));

        let f = schema("max.dim(Tensor self, int dim, bool keepdim=False) -> (Tensor values, Tensor indices)");
        assert_eq!(f.returns.len(), 2);
        // A single return is printed without parentheses
        assert!(FunctionSchema::parse("relu(Tensor self) -> (Tensor)").is_err());
    }

    #[test]
    fn test_malformed_schema() {
        assert_eq!(
            FunctionSchema::parse("relu Tensor self"),
            Err(SchemaError::InvalidSchema("relu Tensor self".into()))
        );
    }

    #[test]
    fn test_out_return_mismatch() {
        assert!(violation("add.out(Tensor self, *, Tensor(a!) out) -> Tensor(b!)"));
        assert!(violation("add.out(Tensor self, *, Tensor(a!) out) -> Tensor"));
        assert!(violation("add.out(Tensor self, *, Tensor(a!) out, Tensor(b!) out2) -> Tensor(a!)"));
    }

    #[test]
    fn test_tensor_list_out_returns_nothing() {
        let f = schema("split_copy.Tensor_out(Tensor self, SymInt split_size, int dim=0, *, Tensor(a!)[] out) -> ()");
        assert_eq!(f.kind(), SchemaKind::Out);
        assert!(violation("split_copy.Tensor_out(Tensor self, SymInt split_size, int dim=0, *, Tensor(a!)[] out) -> Tensor(a!)[]"));
    }

    #[test]
    fn test_mutable_positional_not_returned() {
        assert!(violation("foo(Tensor self, Tensor(a!) buf) -> Tensor(a!)"));
    }

    #[test]
    fn test_mixed_returns_rejected() {
        assert!(violation("foo_(Tensor(a!) self) -> (Tensor(a!), Tensor)"));
    }

    #[test]
    fn test_mutable_return_must_alias_out_or_self() {
        // A mutable "out" that is positional rather than keyword-only
        assert!(violation("foo(Tensor self, Tensor(a!) out) -> Tensor(b!)"));
    }

    #[test]
    fn test_inplace_rules() {
        assert!(violation("add_(Tensor self, Tensor other) -> Tensor"));
        assert!(violation("add_(Tensor(a!) self, Tensor other) -> ()"));
        assert!(violation("add_(Tensor(a!) self, *, Tensor(b!) out) -> Tensor(b!)"));
        let f = schema("_foreach_add_.Scalar(Tensor(a!)[] self, Scalar scalar) -> ()");
        assert!(f.returns.is_empty());
    }

    #[test]
    fn test_tensor_options_only_on_functional() {
        let f = schema("_foo(Tensor self, *, ScalarType dtype, Layout layout, Device device, bool pin_memory) -> Tensor");
        let opts = f.arguments.tensor_options.as_ref().unwrap();
        assert_eq!(opts.layout.name, "layout");
        assert!(violation("_foo.out(Tensor self, *, ScalarType dtype, Layout layout, Device device, bool pin_memory, Tensor(a!) out) -> Tensor(a!)"));
    }

    #[test]
    fn test_functional_overload_name() {
        assert!(violation("foo.functional(Tensor self, Tensor(a!) buf) -> Tensor"));
        assert!(schema("foo.functional(Tensor self, Tensor buf) -> (Tensor, Tensor)").is_functional_fn());
    }

    #[test]
    fn test_signature_strips_variant_information() {
        let functional = schema("add.Tensor(Tensor self, Tensor other, *, Scalar alpha=1) -> Tensor");
        let inplace =
            schema("add_.Tensor(Tensor(a!) self, Tensor other, *, Scalar alpha=1) -> Tensor(a!)");
        let out = schema(
            "add.out(Tensor self, Tensor other, *, Scalar alpha=1, Tensor(a!) out) -> Tensor(a!)",
        );
        let expected = "add(Tensor self, Tensor other, *, Scalar alpha=1) -> Tensor";
        assert_eq!(functional.signature().to_string(), expected);
        assert_eq!(inplace.signature().to_string(), expected);
        assert_eq!(out.signature().to_string(), expected);
        assert_eq!(out.signature().signature(), out.signature());
    }

    #[test]
    fn test_signature_synthesizes_mutable_returns() {
        let mutable = schema("_fused(Tensor self, Tensor(a!) running_min, Tensor(b!) running_max, float c) -> (Tensor output, Tensor mask)");
        let functional = schema("_fused.functional(Tensor self, Tensor running_min, Tensor running_max, float c) -> (Tensor output, Tensor mask, Tensor running_min_out, Tensor running_max_out)");
        assert_eq!(mutable.signature(), functional.signature());
        assert_eq!(
            mutable.signature().to_string(),
            "_fused(Tensor self, Tensor running_min, Tensor running_max, float c) -> (Tensor, Tensor, Tensor, Tensor)"
        );

        let named = mutable.signature_with(SignatureOptions {
            keep_return_names: true,
            ..SignatureOptions::default()
        });
        let names: Vec<Option<&str>> = named.returns.iter().map(|r| r.name.as_deref()).collect();
        assert_eq!(
            names,
            [Some("output"), Some("mask"), Some("running_min_out"), Some("running_max_out")]
        );
    }

    #[test]
    fn test_signature_drops_tensor_options() {
        let factory = schema("arange.start(Scalar start, Scalar end, *, ScalarType? dtype=None, Layout? layout=None, Device? device=None, bool? pin_memory=None) -> Tensor");
        let out = schema("arange.start_out(Scalar start, Scalar end, *, Tensor(a!) out) -> Tensor(a!)");
        assert_eq!(factory.signature(), out.signature());
    }

    #[test]
    fn test_legacy_signature_defaults() {
        let f = schema("arange.start_step(Scalar start, Scalar end, Scalar step, *, ScalarType? dtype=None, Layout? layout=None, Device? device=None, bool? pin_memory=None) -> Tensor");
        assert_eq!(
            f.signature().to_string(),
            "arange(Scalar start, Scalar end, Scalar step=1) -> Tensor"
        );
        let f = schema("bernoulli.p(Tensor self, float p, *, Generator? generator=None) -> Tensor");
        assert_eq!(
            f.signature().to_string(),
            "bernoulli(Tensor self, float p=0.5, *, Generator? generator=None) -> Tensor"
        );
    }

    #[test]
    fn test_view_signature() {
        let view = schema("view(Tensor(a) self, SymInt[] size) -> Tensor(a)");
        let copy = schema("view_copy(Tensor self, SymInt[] size) -> Tensor");
        assert_ne!(view.signature(), copy.signature());
        assert_eq!(view.view_signature(), copy.view_signature());
    }

    #[test]
    fn test_aliased_return_names() {
        let f = schema("transpose.int(Tensor(a) self, int dim0, int dim1) -> Tensor(a)");
        assert_eq!(f.aliased_return_names().unwrap(), [Some("self".to_string())]);
        let f = schema("relu(Tensor self) -> Tensor");
        assert_eq!(f.aliased_return_names().unwrap(), [None]);
    }

    #[test]
    fn test_with_name_revalidates() {
        let f = schema("relu(Tensor self) -> Tensor");
        let renamed = f.with_name(OperatorName::parse("relu.functional").unwrap()).unwrap();
        assert_eq!(renamed.to_string(), "relu.functional(Tensor self) -> Tensor");
        assert!(f.with_name(OperatorName::parse("relu_").unwrap()).is_err());
    }
}
