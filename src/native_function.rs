//! Native function records
//!
//! One [`NativeFunction`] models a single entry of `native_functions.yaml`
//! after canonicalization: the parsed schema plus the flags that steer code
//! generation. Per-backend kernel names are not stored on the record; they
//! are returned alongside it as a partial [`BackendIndices`] table so other
//! backends can add entries after the fact.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::Deserialize;

use crate::argument::Argument;
use crate::backend::{BackendIndices, BackendMetadata};
use crate::error::{RecordError, RecordErrorKind};
use crate::keys::{
    DeviceCheckType, DispatchKey, ScalarType, UfuncKey, Variant, ViewSchemaKind,
    STRUCTURED_DISPATCH_KEYS, UFUNC_DISPATCH_KEYS,
};
use crate::operator_name::OperatorName;
use crate::schema::{FunctionSchema, SchemaKind};

/// Line-marker key some YAML loaders add to mappings; tolerated and ignored
pub const LINE_KEY: &str = "__line__";

// ============================================================================
// Location
// ============================================================================

/// Source position of a configuration entry, printed as `file:line`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub file: String,
    pub line: usize,
}

impl Location {
    pub fn new(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

// ============================================================================
// Raw configuration shape
// ============================================================================

/// The accepted key set of one entry. Anything not named here lands in
/// `extra` and is reported as leftover.
#[derive(Debug, Deserialize)]
struct RawNativeFunction {
    func: String,
    #[serde(default)]
    cpp_no_default_args: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_yaml_bool")]
    use_const_ref_for_mutable_tensors: bool,
    variants: Option<String>,
    #[serde(default, deserialize_with = "deserialize_yaml_bool")]
    manual_kernel_registration: bool,
    #[serde(default, deserialize_with = "deserialize_yaml_bool")]
    manual_cpp_binding: bool,
    #[serde(default = "default_true", deserialize_with = "deserialize_yaml_bool")]
    device_guard: bool,
    device_check: Option<String>,
    #[serde(default, deserialize_with = "deserialize_yaml_bool")]
    structured: bool,
    structured_delegate: Option<String>,
    structured_inherits: Option<String>,
    python_module: Option<String>,
    category_override: Option<String>,
    precomputed: Option<Vec<String>>,
    tags: Option<String>,
    dispatch: Option<BTreeMap<String, serde_yaml::Value>>,
    autogen: Option<String>,
    ufunc_inner_loop: Option<RawUfuncInnerLoop>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawUfuncInnerLoop {
    Generic(String),
    PerKey(BTreeMap<String, serde_yaml::Value>),
}

fn default_true() -> bool {
    true
}

/// Accept YAML 1.2 booleans as well as the `True`/`False` spelling used
/// throughout native_functions.yaml
fn deserialize_yaml_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct YamlBoolVisitor;

    impl<'de> de::Visitor<'de> for YamlBoolVisitor {
        type Value = bool;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a bool")
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            match v {
                "True" | "true" => Ok(true),
                "False" | "false" => Ok(false),
                other => Err(E::custom(format!("not a bool: {other}"))),
            }
        }
    }

    deserializer.deserialize_any(YamlBoolVisitor)
}

// ============================================================================
// Precomputed parameters and ufunc loops
// ============================================================================

/// Precomputed elements of a structured kernel: which kernel parameters
/// they replace, and which are added without replacement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precompute {
    /// Kernel parameter name and the elements that supersede it, in
    /// declaration order
    pub replace: Vec<(String, Vec<Argument>)>,
    pub add: Vec<Argument>,
}

impl Precompute {
    /// Lines are `param -> decl[, decl]*`; an optional final line without
    /// an arrow lists added parameters
    pub fn parse(src: &[String]) -> Result<Self, RecordErrorKind> {
        let invalid = |message: String| RecordErrorKind::InvalidField {
            field: "precomputed",
            message,
        };
        let parse_decls = |list: &str| -> Result<Vec<Argument>, RecordErrorKind> {
            list.split(',')
                .map(|decl| Argument::parse(decl.trim()).map_err(RecordErrorKind::from))
                .collect()
        };

        let (replace_lines, add) = match src.split_last() {
            Some((last, rest)) if !last.contains(" -> ") => (rest, parse_decls(last)?),
            _ => (src, Vec::new()),
        };

        let mut replace = Vec::with_capacity(replace_lines.len());
        for line in replace_lines {
            let (arg, with_list) = line.split_once(" -> ").ok_or_else(|| {
                invalid(
                    "precomputed parameters without replacement are allowed only in the last line"
                        .to_string(),
                )
            })?;
            replace.push((arg.to_string(), parse_decls(with_list)?));
        }

        let r = Precompute { replace, add };
        if r.to_list() != replace_lines {
            return Err(invalid(format!(
                "{:?} does not round trip to {:?}",
                replace_lines,
                r.to_list()
            )));
        }
        Ok(r)
    }

    /// The replacement lines in canonical form
    pub fn to_list(&self) -> Vec<String> {
        self.replace
            .iter()
            .map(|(param, replacements)| {
                let replacements: Vec<String> =
                    replacements.iter().map(|a| a.to_string()).collect();
                format!("{} -> {}", param, replacements.join(", "))
            })
            .collect()
    }
}

/// One `ufunc_inner_loop` entry: `name (Dtype, DtypeClass, ...)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UfuncInnerLoop {
    pub name: String,
    pub supported_dtypes: BTreeSet<ScalarType>,
    /// Kept with the loop since it changes what `name` means
    pub ufunc_key: UfuncKey,
}

impl UfuncInnerLoop {
    pub fn parse(value: &str, ufunc_key: UfuncKey) -> Result<Self, RecordErrorKind> {
        let invalid = |message: String| RecordErrorKind::InvalidField {
            field: "ufunc_inner_loop",
            message,
        };
        let (name, dtypes) = value
            .split_once(' ')
            .ok_or_else(|| invalid(format!("expected 'name (dtypes)', got '{value}'")))?;
        let dtypes = dtypes
            .strip_prefix('(')
            .and_then(|d| d.strip_suffix(')'))
            .ok_or_else(|| invalid(format!("dtypes must be parenthesized in '{value}'")))?;

        let mut supported_dtypes = BTreeSet::new();
        for k in dtypes.split(", ") {
            let set =
                ScalarType::parse_set(k).map_err(|dtype| invalid(format!("unknown dtype {dtype}")))?;
            supported_dtypes.extend(set);
        }
        Ok(UfuncInnerLoop {
            name: name.to_string(),
            supported_dtypes,
            ufunc_key,
        })
    }
}

// ============================================================================
// NativeFunction
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct NativeFunction {
    pub func: FunctionSchema,
    pub use_const_ref_for_mutable_tensors: bool,
    /// Whether to emit an automatic DeviceGuard
    pub device_guard: bool,
    pub device_check: DeviceCheckType,
    pub python_module: Option<String>,
    pub category_override: Option<String>,
    /// `{function}` unless specified
    pub variants: BTreeSet<Variant>,
    /// Skip generating registrations for this kernel
    pub manual_kernel_registration: bool,
    pub manual_cpp_binding: bool,
    pub loc: Location,
    /// Operators expected to be generated from this one. Only used to
    /// cross-check what grouping decides to generate.
    pub autogen: Vec<OperatorName>,
    pub ufunc_inner_loop: BTreeMap<UfuncKey, UfuncInnerLoop>,
    /// Only out functions can be structured; the other variants point at
    /// the out function with `structured_delegate`
    pub structured: bool,
    pub structured_delegate: Option<OperatorName>,
    pub structured_inherits: Option<String>,
    pub precomputed: Option<Precompute>,
    /// Arguments whose default is hidden from the C++ interface
    pub cpp_no_default_args: BTreeSet<String>,
    /// Dispatch differs between backends
    pub is_abstract: bool,
    pub has_composite_implicit_autograd_kernel: bool,
    pub has_composite_explicit_autograd_kernel: bool,
    pub tags: BTreeSet<String>,
}

impl NativeFunction {
    /// Build a record and its per-key kernel table from one YAML mapping
    pub fn from_yaml(
        entry: &serde_yaml::Value,
        loc: Location,
        valid_tags: &HashSet<String>,
        ignore_keys: Option<&HashSet<DispatchKey>>,
    ) -> Result<(NativeFunction, BackendIndices), RecordError> {
        let err = |kind: RecordErrorKind| RecordError::new(&loc, kind);

        let raw: RawNativeFunction =
            serde_yaml::from_value(entry.clone()).map_err(|e| err(e.into()))?;

        let func = FunctionSchema::parse(&raw.func).map_err(|e| err(e.into()))?;

        let mut variants = BTreeSet::new();
        for v in raw.variants.as_deref().unwrap_or("function").split(", ") {
            let variant =
                Variant::from_name(v).ok_or_else(|| err(RecordErrorKind::IllegalVariant(v.into())))?;
            variants.insert(variant);
        }

        let device_check = match raw.device_check.as_deref() {
            None => DeviceCheckType::ExactSame,
            Some(s) => DeviceCheckType::from_name(s).ok_or_else(|| {
                err(RecordErrorKind::InvalidField {
                    field: "device_check",
                    message: format!("unknown device check type {s}"),
                })
            })?,
        };

        let structured_delegate = raw
            .structured_delegate
            .as_deref()
            .map(OperatorName::parse)
            .transpose()
            .map_err(|e| err(e.into()))?;

        if raw.python_module.is_some() && variants.contains(&Variant::Method) {
            return Err(err(RecordErrorKind::Constraint(
                "functions in modules cannot be methods".into(),
            )));
        }

        let precomputed = match raw.precomputed.as_deref() {
            None | Some([]) => None,
            Some(lines) => {
                if !raw.structured {
                    return Err(err(RecordErrorKind::Constraint(
                        "precomputed is only allowed on structured kernels".into(),
                    )));
                }
                Some(Precompute::parse(lines).map_err(err)?)
            }
        };

        let mut tags = BTreeSet::new();
        if let Some(tags_s) = raw.tags.as_deref().filter(|t| !t.is_empty()) {
            if valid_tags.is_empty() {
                return Err(err(RecordErrorKind::Constraint(
                    "tags were given but no valid tags are known".into(),
                )));
            }
            for t in tags_s.split(", ") {
                if !valid_tags.contains(t) {
                    return Err(err(RecordErrorKind::IllegalTag(t.into())));
                }
                tags.insert(t.to_string());
            }
        }

        let cpp_name = func.kernel_name();
        let mut dispatch: BTreeMap<DispatchKey, BackendMetadata> = BTreeMap::new();
        match &raw.dispatch {
            Some(raw_dispatch) => {
                if raw.manual_kernel_registration {
                    return Err(err(RecordErrorKind::Constraint(
                        "cannot specify both manual_kernel_registration and dispatch; with \
                         manual registration, dispatch has no effect!"
                            .into(),
                    )));
                }
                let mut redundant_composite_implicit_autograd = false;
                for (ks, v) in raw_dispatch {
                    if ks == LINE_KEY {
                        continue;
                    }
                    let kernel = v.as_str().ok_or_else(|| {
                        err(RecordErrorKind::InvalidField {
                            field: "dispatch",
                            message: format!("kernel for {ks} is not a string"),
                        })
                    })?;
                    for k in ks.split(',') {
                        let key = DispatchKey::parse(k.trim()).ok_or_else(|| {
                            err(RecordErrorKind::UnknownDispatchKey(k.trim().into()))
                        })?;
                        if ignore_keys.is_some_and(|ignore| ignore.contains(&key)) {
                            continue;
                        }
                        if !key.is_supported() {
                            return Err(err(RecordErrorKind::UnsupportedDispatchKey {
                                key,
                                kernel: kernel.to_string(),
                            }));
                        }
                        // External backends opt into structured kernels on
                        // their own, so this is tracked per key
                        dispatch.insert(
                            key,
                            BackendMetadata {
                                kernel: kernel.to_string(),
                                structured: raw.structured && key.is_structured(),
                            },
                        );
                        if key == DispatchKey::CompositeImplicitAutograd && kernel == cpp_name {
                            redundant_composite_implicit_autograd = true;
                        }
                    }
                }

                if dispatch.len() == 1 && redundant_composite_implicit_autograd {
                    return Err(err(RecordErrorKind::Constraint(
                        "unnecessary dispatch table for this function; just delete the \
                         dispatch key entirely"
                            .into(),
                    )));
                }
                // Deleting the table of a structured delegate would change semantics
                if structured_delegate.is_none()
                    && dispatch.len() == 1
                    && dispatch.contains_key(&DispatchKey::CompositeImplicitAutograd)
                {
                    let got = dispatch
                        .get(&DispatchKey::CompositeImplicitAutograd)
                        .map(|m| m.kernel.as_str())
                        .unwrap_or_default();
                    return Err(err(RecordErrorKind::Constraint(format!(
                        "unexpected name for singleton CompositeImplicitAutograd dispatch entry: \
                         expected {cpp_name} but got {got}. Rename your implementation to the \
                         expected name, then delete the dispatch table"
                    ))));
                }
            }
            None if !raw.structured && structured_delegate.is_none() => {
                dispatch.insert(
                    DispatchKey::CompositeImplicitAutograd,
                    BackendMetadata {
                        kernel: cpp_name.clone(),
                        structured: false,
                    },
                );
            }
            None => {}
        }

        if dispatch.contains_key(&DispatchKey::CompositeExplicitAutograd)
            && dispatch.contains_key(&DispatchKey::CompositeImplicitAutograd)
        {
            return Err(err(RecordErrorKind::Constraint(
                "cannot specify both CompositeExplicitAutograd and CompositeImplicitAutograd \
                 on a single kernel; each strictly subsumes the other"
                    .into(),
            )));
        }

        let autogen = match raw.autogen.as_deref() {
            None | Some("") => Vec::new(),
            Some(s) => s
                .split(", ")
                .map(OperatorName::parse)
                .collect::<Result<_, _>>()
                .map_err(|e| err(e.into()))?,
        };

        let mut ufunc_inner_loop = BTreeMap::new();
        match &raw.ufunc_inner_loop {
            None => {}
            Some(RawUfuncInnerLoop::Generic(value)) => {
                let inner = UfuncInnerLoop::parse(value, UfuncKey::Generic).map_err(err)?;
                ufunc_inner_loop.insert(UfuncKey::Generic, inner);
            }
            Some(RawUfuncInnerLoop::PerKey(map)) => {
                for (k, v) in map {
                    if k == LINE_KEY {
                        continue;
                    }
                    let invalid = |message: String| {
                        err(RecordErrorKind::InvalidField {
                            field: "ufunc_inner_loop",
                            message,
                        })
                    };
                    let ufunc_key = UfuncKey::from_name(k)
                        .ok_or_else(|| invalid(format!("unknown ufunc key {k}")))?;
                    let value = v
                        .as_str()
                        .ok_or_else(|| invalid(format!("value for {k} is not a string")))?;
                    let inner = UfuncInnerLoop::parse(value, ufunc_key).map_err(err)?;
                    ufunc_inner_loop.insert(ufunc_key, inner);
                }
            }
        }
        // Program the implicit ufunc kernels
        if !ufunc_inner_loop.is_empty() {
            if !raw.structured {
                return Err(err(RecordErrorKind::Constraint("ufunc must be structured".into())));
            }
            for key in UFUNC_DISPATCH_KEYS {
                if dispatch.contains_key(&key) {
                    return Err(err(RecordErrorKind::Constraint(format!(
                        "ufunc should not have explicit dispatch entry for {key}"
                    ))));
                }
                dispatch.insert(
                    key,
                    BackendMetadata {
                        kernel: format!("{}_{}", func.name.name, key),
                        structured: true,
                    },
                );
            }
        }

        let is_abstract = structured_delegate.is_some()
            || !(dispatch.len() == 1
                && dispatch.contains_key(&DispatchKey::CompositeImplicitAutograd));
        let has_composite_implicit_autograd_kernel =
            dispatch.contains_key(&DispatchKey::CompositeImplicitAutograd);
        let has_composite_explicit_autograd_kernel =
            dispatch.contains_key(&DispatchKey::CompositeExplicitAutograd);

        let leftover: Vec<String> = raw
            .extra
            .keys()
            .filter(|k| k.as_str() != LINE_KEY)
            .cloned()
            .collect();
        if !leftover.is_empty() {
            return Err(err(RecordErrorKind::LeftoverEntries(leftover)));
        }

        if structured_delegate.is_some() {
            if let Some(key) = STRUCTURED_DISPATCH_KEYS
                .iter()
                .find(|k| dispatch.contains_key(*k))
            {
                return Err(err(RecordErrorKind::Constraint(format!(
                    "if structured_delegate, then must not have {key} in dispatch dictionary \
                     (it is delegated!)"
                ))));
            }
        }

        let backend_metadata: BackendIndices = dispatch
            .into_iter()
            .map(|(k, m)| (k, BTreeMap::from([(func.name.clone(), m)])))
            .collect();

        let f = NativeFunction {
            func,
            use_const_ref_for_mutable_tensors: raw.use_const_ref_for_mutable_tensors,
            device_guard: raw.device_guard,
            device_check,
            python_module: raw.python_module,
            category_override: raw.category_override,
            variants,
            manual_kernel_registration: raw.manual_kernel_registration,
            manual_cpp_binding: raw.manual_cpp_binding,
            loc: loc.clone(),
            autogen,
            ufunc_inner_loop,
            structured: raw.structured,
            structured_delegate,
            structured_inherits: raw.structured_inherits,
            precomputed,
            cpp_no_default_args: raw.cpp_no_default_args.into_iter().collect(),
            is_abstract,
            has_composite_implicit_autograd_kernel,
            has_composite_explicit_autograd_kernel,
            tags,
        };
        f.validate().map_err(err)?;
        Ok((f, backend_metadata))
    }

    /// Record-level invariants that do not depend on backend information
    fn validate(&self) -> Result<(), RecordErrorKind> {
        let fail = |message: &str| Err(RecordErrorKind::Constraint(message.to_string()));
        let kind = self.func.kind();

        if self.func.is_out_fn()
            && self.variants != BTreeSet::from([Variant::Function])
        {
            return fail(
                "native functions with out arguments MUST be declared with only \
                 function variant; e.g., variants: function",
            );
        }
        if self.structured {
            if kind != SchemaKind::Out {
                return fail(
                    "put structured field on the out= variant of a function; \
                     did you mean structured_delegate?",
                );
            }
            if !self.device_guard {
                return fail("device_guard: False is not respected by structured kernels");
            }
        }
        if self.structured_delegate.is_some() {
            if kind == SchemaKind::Out {
                return fail(
                    "structured_delegate field not allowed on out= functions; \
                     did you mean structured?",
                );
            }
            if !self.device_guard {
                return fail("device_guard: False is not respected by structured kernels");
            }
        }

        let defaulted: BTreeSet<&str> = self
            .func
            .schema_order_arguments()
            .into_iter()
            .filter(|a| a.default.is_some())
            .map(|a| a.name.as_str())
            .collect();
        let invalid: Vec<&str> = self
            .cpp_no_default_args
            .iter()
            .map(String::as_str)
            .filter(|a| !defaulted.contains(a))
            .collect();
        if !invalid.is_empty() {
            return Err(RecordErrorKind::Constraint(format!(
                "invalid cpp_no_default_args: {}",
                invalid.join(", ")
            )));
        }

        if self.structured_inherits.is_some() && !self.structured {
            return fail("structured_inherits must also imply structured: True");
        }
        if self.func.name.to_string().starts_with("_foreach")
            && self.device_check != DeviceCheckType::NoCheck
        {
            return fail(
                "foreach kernels fall back to slow path when tensor are on different devices, \
                 device_check not allowed to be enabled",
            );
        }
        Ok(())
    }

    pub fn has_composite_kernel(&self) -> bool {
        self.has_composite_implicit_autograd_kernel || self.has_composite_explicit_autograd_kernel
    }

    pub fn is_view_op(&self) -> bool {
        let rets = &self.func.returns;
        let is_non_mutating_view = rets
            .iter()
            .any(|r| r.annotation.as_ref().is_some_and(|a| !a.is_write));
        let is_inplace_view = self.tags.contains("inplace_view");
        let is_wildcard_view = self
            .func
            .schema_order_arguments()
            .iter()
            .any(|a| a.annotation.as_ref().is_some_and(|a| a.becomes_wildcard));
        is_non_mutating_view || is_inplace_view || is_wildcard_view
    }

    pub fn view_schema_kind(&self) -> Result<ViewSchemaKind, RecordError> {
        if !self.is_view_op() {
            return Ok(ViewSchemaKind::NonAliasing);
        }
        if self.func.name.name.inplace {
            if !self.tags.contains("inplace_view") {
                return Err(RecordError::new(
                    &self.loc,
                    RecordErrorKind::Constraint(format!(
                        "{} is an inplace view but is not tagged inplace_view",
                        self.func.name
                    )),
                ));
            }
            return Ok(ViewSchemaKind::AliasingInplace);
        }
        Ok(ViewSchemaKind::Aliasing)
    }

    pub fn root_name(&self) -> &str {
        &self.func.name.name.base
    }

    /// Called on functions that did not make it into a group
    pub fn validate_unstructured(&self) -> Result<(), RecordError> {
        if self.structured {
            return Err(RecordError::new(
                &self.loc,
                RecordErrorKind::Constraint(
                    "this function is structured, but there was no valid functional variant of it"
                        .into(),
                ),
            ));
        }
        if self.structured_delegate.is_some() {
            return Err(RecordError::new(
                &self.loc,
                RecordErrorKind::Constraint(
                    "this function delegates to another structured out function, but no valid \
                     function was found (the delegate may not exist, or it has the wrong type)"
                        .into(),
                ),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn load(yaml: &str) -> Result<(NativeFunction, BackendIndices), RecordError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        NativeFunction::from_yaml(
            &value,
            Location::new("test.yaml", 1),
            &tags(&["pointwise", "inplace_view", "view_copy", "generated", "core"]),
            None,
        )
    }

    fn constraint(yaml: &str) -> bool {
        matches!(
            load(yaml),
            Err(RecordError {
                kind: RecordErrorKind::Constraint(_),
                ..
            })
        )
    }

    #[test]
    fn test_defaults() {
        let (f, index) = load("func: relu(Tensor self) -> Tensor").unwrap();
        assert_eq!(f.variants, BTreeSet::from([Variant::Function]));
        assert!(f.device_guard);
        assert_eq!(f.device_check, DeviceCheckType::ExactSame);
        assert!(!f.is_abstract);
        assert!(f.has_composite_implicit_autograd_kernel);
        assert_eq!(f.root_name(), "relu");

        let meta = &index[&DispatchKey::CompositeImplicitAutograd][&f.func.name];
        assert_eq!(meta.kernel, "relu");
        assert!(!meta.structured);
    }

    #[test]
    fn test_dispatch_table() {
        let (f, index) = load(
            r#"
func: add.out(Tensor self, Tensor other, *, Scalar alpha=1, Tensor(a!) out) -> Tensor(a!)
structured: True
structured_inherits: TensorIteratorBase
dispatch:
  CPU, CUDA: add_out
  SparseCPU: add_out_sparse_cpu
  MPS: add_out_mps
"#,
        )
        .unwrap();
        assert!(f.structured);
        assert!(f.is_abstract);
        assert_eq!(index.len(), 4);
        assert!(index[&DispatchKey::CPU][&f.func.name].structured);
        assert!(index[&DispatchKey::MPS][&f.func.name].structured);
        assert!(!index[&DispatchKey::SparseCPU][&f.func.name].structured);
        assert_eq!(index[&DispatchKey::CUDA][&f.func.name].kernel, "add_out");
    }

    #[test]
    fn test_dispatch_key_alias_and_ignore() {
        let value: serde_yaml::Value = serde_yaml::from_str(
            "func: foo(Tensor self) -> Tensor\ndispatch:\n  CPUTensorId: foo_cpu\n  CUDA: foo_cuda\n",
        )
        .unwrap();
        let ignore = HashSet::from([DispatchKey::CUDA]);
        let (_, index) = NativeFunction::from_yaml(
            &value,
            Location::new("test.yaml", 1),
            &HashSet::new(),
            Some(&ignore),
        )
        .unwrap();
        assert_eq!(index.keys().copied().collect::<Vec<_>>(), [DispatchKey::CPU]);
    }

    #[test]
    fn test_unknown_and_unsupported_keys() {
        assert!(matches!(
            load("func: foo(Tensor self) -> Tensor\ndispatch:\n  Bogus: foo\n"),
            Err(RecordError {
                kind: RecordErrorKind::UnknownDispatchKey(_),
                ..
            })
        ));
        assert!(matches!(
            load("func: foo(Tensor self) -> Tensor\ndispatch:\n  XLA: foo_xla\n"),
            Err(RecordError {
                kind: RecordErrorKind::UnsupportedDispatchKey {
                    key: DispatchKey::XLA,
                    ..
                },
                ..
            })
        ));
    }

    #[test]
    fn test_leftover_entries() {
        let err = load("func: foo(Tensor self) -> Tensor\nbogus_key: 1\n__line__: 7\n").unwrap_err();
        match err.kind {
            RecordErrorKind::LeftoverEntries(keys) => assert_eq!(keys, ["bogus_key"]),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_line_markers_are_ignored() {
        let (f, index) =
            load("func: foo(Tensor self) -> Tensor\n__line__: 3\ndispatch:\n  __line__: 4\n  CPU: foo\n")
                .unwrap();
        assert_eq!(f.loc.line, 1);
        assert_eq!(index.len(), 1);
        assert!(index.contains_key(&DispatchKey::CPU));
    }

    #[test]
    fn test_illegal_variant_and_tag() {
        assert!(matches!(
            load("func: foo(Tensor self) -> Tensor\nvariants: function, static\n"),
            Err(RecordError {
                kind: RecordErrorKind::IllegalVariant(_),
                ..
            })
        ));
        let err = load("func: foo(Tensor self) -> Tensor\ntags: pointwise, bogus\n").unwrap_err();
        assert_eq!(err.to_string(), "test.yaml:1: illegal tag bogus");
    }

    #[test]
    fn test_schema_errors_carry_location() {
        let err = load("func: foo(Tensor self) -> Tensor(a!)").unwrap_err();
        assert!(matches!(err.kind, RecordErrorKind::Schema(_)));
        assert!(err.to_string().starts_with("test.yaml:1: "));
    }

    #[test]
    fn test_redundant_dispatch_tables() {
        assert!(constraint(
            "func: foo(Tensor self) -> Tensor\ndispatch:\n  CompositeImplicitAutograd: foo\n"
        ));
        assert!(constraint(
            "func: foo(Tensor self) -> Tensor\ndispatch:\n  CompositeImplicitAutograd: foo_impl\n"
        ));
        assert!(constraint(
            "func: foo(Tensor self) -> Tensor\ndispatch:\n  CompositeImplicitAutograd: foo\n  CompositeExplicitAutograd: foo\n"
        ));
        assert!(constraint(
            "func: foo(Tensor self) -> Tensor\nmanual_kernel_registration: True\ndispatch:\n  CPU: foo\n"
        ));
    }

    #[test]
    fn test_structured_rules() {
        assert!(constraint(
            "func: foo(Tensor self) -> Tensor\nstructured: True\n"
        ));
        assert!(constraint(
            "func: foo.out(Tensor self, *, Tensor(a!) out) -> Tensor(a!)\nstructured: True\ndevice_guard: False\n"
        ));
        assert!(constraint(
            "func: foo.out(Tensor self, *, Tensor(a!) out) -> Tensor(a!)\nstructured_delegate: foo.out\n"
        ));
        assert!(constraint(
            "func: foo(Tensor self) -> Tensor\nstructured_delegate: foo.out\ndispatch:\n  CPU: foo_cpu\n"
        ));
        assert!(constraint(
            "func: foo(Tensor self) -> Tensor\nstructured_inherits: TensorIteratorBase\ndispatch:\n  CPU: foo_cpu\n"
        ));

        let (f, index) =
            load("func: foo(Tensor self) -> Tensor\nstructured_delegate: foo.out\n").unwrap();
        assert!(f.is_abstract);
        assert!(index.is_empty());
    }

    #[test]
    fn test_out_functions_are_function_only() {
        assert!(constraint(
            "func: foo.out(Tensor self, *, Tensor(a!) out) -> Tensor(a!)\nvariants: function, method\n"
        ));
    }

    #[test]
    fn test_cpp_no_default_args() {
        assert!(load(
            "func: foo(Tensor self, int dim=0) -> Tensor\ncpp_no_default_args: ['dim']\n"
        )
        .is_ok());
        assert!(constraint(
            "func: foo(Tensor self, int dim) -> Tensor\ncpp_no_default_args: ['dim']\n"
        ));
    }

    #[test]
    fn test_foreach_requires_no_check() {
        assert!(constraint("func: _foreach_abs(Tensor[] self) -> Tensor[]\n"));
        assert!(load("func: _foreach_abs(Tensor[] self) -> Tensor[]\ndevice_check: NoCheck\n").is_ok());
    }

    #[test]
    fn test_python_module_excludes_method() {
        assert!(constraint(
            "func: foo(Tensor self) -> Tensor\npython_module: nn\nvariants: function, method\n"
        ));
    }

    #[test]
    fn test_ufunc_inner_loop() {
        let (f, index) = load(
            r#"
func: add.out(Tensor self, Tensor other, *, Scalar alpha=1, Tensor(a!) out) -> Tensor(a!)
structured: True
ufunc_inner_loop:
  Generic: add (AllAndComplex, BFloat16, Half, ComplexHalf)
  ScalarOnly: add (Bool)
dispatch:
  SparseCPU: add_out_sparse_cpu
"#,
        )
        .unwrap();
        assert_eq!(f.ufunc_inner_loop.len(), 2);
        let generic = &f.ufunc_inner_loop[&UfuncKey::Generic];
        assert_eq!(generic.name, "add");
        assert_eq!(generic.supported_dtypes.len(), 12);
        assert_eq!(index[&DispatchKey::CPU][&f.func.name].kernel, "add_CPU");
        assert_eq!(index[&DispatchKey::CUDA][&f.func.name].kernel, "add_CUDA");

        assert!(constraint(
            "func: foo(Tensor self) -> Tensor\nufunc_inner_loop: foo (Float)\ndispatch:\n  CPU: foo\n"
        ));
    }

    #[test]
    fn test_precomputed() {
        let lines = vec![
            "kernel_size -> int kH, int kW".to_string(),
            "stride -> int dH, int dW".to_string(),
            "int numBatch, int numPlanes".to_string(),
        ];
        let p = Precompute::parse(&lines).unwrap();
        assert_eq!(p.replace.len(), 2);
        assert_eq!(p.replace[0].0, "kernel_size");
        assert_eq!(p.replace[1].1[1].name, "dW");
        assert_eq!(p.add.len(), 2);
        assert_eq!(p.to_list(), lines[..2]);

        let misplaced = vec!["int numBatch".to_string(), "stride -> int dH".to_string()];
        assert!(Precompute::parse(&misplaced).is_err());
    }

    #[test]
    fn test_view_kinds() {
        let (f, _) = load("func: transpose.int(Tensor(a) self, int dim0, int dim1) -> Tensor(a)\ndispatch:\n  CompositeExplicitAutograd: transpose\n").unwrap();
        assert!(f.is_view_op());
        assert_eq!(f.view_schema_kind().unwrap(), ViewSchemaKind::Aliasing);

        let (f, _) = load("func: transpose_(Tensor(a!) self, int dim0, int dim1) -> Tensor(a!)\ntags: inplace_view\ndispatch:\n  CompositeExplicitAutograd: transpose_\n").unwrap();
        assert_eq!(f.view_schema_kind().unwrap(), ViewSchemaKind::AliasingInplace);

        let (f, _) = load("func: relu(Tensor self) -> Tensor").unwrap();
        assert_eq!(f.view_schema_kind().unwrap(), ViewSchemaKind::NonAliasing);
    }

    #[test]
    fn test_validate_unstructured() {
        let (f, _) = load("func: relu(Tensor self) -> Tensor").unwrap();
        assert!(f.validate_unstructured().is_ok());
        let (f, _) = load("func: foo(Tensor self) -> Tensor\nstructured_delegate: foo.out\n").unwrap();
        assert!(f.validate_unstructured().is_err());
    }
}
