//! Function families
//!
//! [`NativeFunctionsGroup`] ties together the functional, inplace, mutable
//! and out variants of one operator. [`NativeFunctionsViewGroup`] pairs a
//! view op with its optional `_copy` and inplace counterparts.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::GroupError;
use crate::native_function::NativeFunction;
use crate::operator_name::{BaseOperatorName, OperatorName};
use crate::schema::{FunctionSchema, SchemaKind, SignatureOptions};

// ============================================================================
// NativeFunctionsGroup
// ============================================================================

/// Functional and out variants, plus the optional inplace and mutable ones.
///
/// Groups exist even when the operator is not structured; check
/// [`NativeFunctionsGroup::structured`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct NativeFunctionsGroup {
    pub functional: NativeFunction,
    pub inplace: Option<NativeFunction>,
    pub mutable: Option<NativeFunction>,
    pub out: NativeFunction,
}

impl NativeFunctionsGroup {
    pub fn new(
        functional: NativeFunction,
        inplace: Option<NativeFunction>,
        mutable: Option<NativeFunction>,
        out: NativeFunction,
    ) -> Result<Self, GroupError> {
        let g = NativeFunctionsGroup {
            functional,
            inplace,
            mutable,
            out,
        };
        g.validate()?;
        Ok(g)
    }

    /// Build a group from variants keyed by kind.
    ///
    /// Returns `None` for a singleton or for a family without an out
    /// variant; a few operators only have functional/inplace variants and
    /// those are not grouped.
    pub fn from_dict(
        mut d: BTreeMap<SchemaKind, NativeFunction>,
    ) -> Result<Option<Self>, GroupError> {
        if d.is_empty() {
            return Err(GroupError::Empty);
        }
        if d.len() == 1 {
            return Ok(None);
        }
        let functional = match d.remove(&SchemaKind::Functional) {
            Some(f) => f,
            None => {
                let name = d
                    .values()
                    .next()
                    .map(|f| f.func.name.to_string())
                    .unwrap_or_default();
                return Err(GroupError::MissingFunctional(name));
            }
        };
        let inplace = d.remove(&SchemaKind::Inplace);
        let mutable = d.remove(&SchemaKind::Mutable);
        match d.remove(&SchemaKind::Out) {
            Some(out) => Self::new(functional, inplace, mutable, out).map(Some),
            None => Ok(None),
        }
    }

    fn validate(&self) -> Result<(), GroupError> {
        let test_sig = self.functional.func.signature();
        for f in self.functions() {
            let sig = f.func.signature();
            if sig != test_sig {
                return Err(GroupError::SignatureMismatch {
                    expected: test_sig.to_string(),
                    found: sig.to_string(),
                });
            }
        }

        let members = [
            (Some(&self.functional), SchemaKind::Functional),
            (Some(&self.out), SchemaKind::Out),
            (self.inplace.as_ref(), SchemaKind::Inplace),
            (self.mutable.as_ref(), SchemaKind::Mutable),
        ];
        for (f, expected) in members {
            if let Some(f) = f {
                let found = f.func.kind();
                if found != expected {
                    return Err(GroupError::KindMismatch {
                        name: f.func.name.to_string(),
                        expected: expected.to_string(),
                        found: found.to_string(),
                    });
                }
            }
        }

        if self
            .functions()
            .any(|f| f.structured || f.structured_delegate.is_some())
        {
            if !self.out.structured {
                return Err(GroupError::Structured {
                    name: self.out.func.name.to_string(),
                    message: "members delegate to an out variant that is not structured".into(),
                });
            }
            // Structured composite kernels are not supported
            if self.out.has_composite_implicit_autograd_kernel {
                return Err(GroupError::Structured {
                    name: self.out.func.name.to_string(),
                    message: "structured out kernels cannot be CompositeImplicitAutograd".into(),
                });
            }
            let delegates = std::iter::once(&self.functional).chain(self.inplace.as_ref());
            for f in delegates {
                if f.structured_delegate.as_ref() != Some(&self.out.func.name) {
                    return Err(GroupError::WrongDelegate {
                        name: f.func.name.to_string(),
                        delegate: f
                            .structured_delegate
                            .as_ref()
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "nothing".to_string()),
                        actual: self.out.func.name.to_string(),
                    });
                }
            }
        }

        let generated: BTreeSet<String> = self
            .functions()
            .filter(|f| f.tags.contains("generated"))
            .map(|f| f.func.name.to_string())
            .collect();
        let declared: BTreeSet<String> = self
            .functions()
            .flat_map(|f| f.autogen.iter().map(|n| n.to_string()))
            .collect();
        if declared != generated {
            let join = |s: &BTreeSet<String>| s.iter().cloned().collect::<Vec<_>>().join(", ");
            return Err(GroupError::AutogenMismatch {
                generated: join(&generated),
                declared: join(&declared),
            });
        }
        Ok(())
    }

    /// Whether the operator has a meta function; backend agnostic
    pub fn structured(&self) -> bool {
        self.out.structured
    }

    pub fn signature(&self) -> FunctionSchema {
        self.out.func.signature()
    }

    /// Functional, out, then inplace and mutable when present
    pub fn functions(&self) -> impl Iterator<Item = &NativeFunction> {
        [Some(&self.functional), Some(&self.out)]
            .into_iter()
            .chain([self.inplace.as_ref(), self.mutable.as_ref()])
            .flatten()
    }

    pub fn root_name(&self) -> &str {
        self.functional.root_name()
    }
}

// ============================================================================
// NativeFunctionsViewGroup
// ============================================================================

/// A view op with its `{view}_copy` and inplace variants.
///
/// The aliasing op must exist for a group to form; a lone `narrow_copy.out`
/// does not produce a view group.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct NativeFunctionsViewGroup {
    pub view: NativeFunction,
    /// Not generated for CompositeImplicitAutograd views, which decompose
    pub view_copy: Option<NativeFunction>,
    pub view_inplace: Option<NativeFunction>,
}

impl NativeFunctionsViewGroup {
    pub fn new(
        view: NativeFunction,
        view_copy: Option<NativeFunction>,
        view_inplace: Option<NativeFunction>,
    ) -> Result<Self, GroupError> {
        let fail = |message: String| {
            Err(GroupError::View {
                name: view.func.name.to_string(),
                message,
            })
        };

        if !view.is_view_op() {
            return fail("the primary member of a view group must be a view operator".into());
        }
        match &view_copy {
            None => {
                if gets_generated_view_copy(&view) {
                    return fail(format!(
                        "appears to be a new operator that aliases its inputs; add a \
                         corresponding operator to native_functions.yaml: {}",
                        view_copy_name(&view)
                    ));
                }
            }
            Some(copy) => {
                if !copy.func.name.name.base.ends_with("_copy") {
                    return fail(format!("{} is not named like a view_copy operator", copy.func.name));
                }
                let stripped = copy.func.signature_with(SignatureOptions {
                    strip_view_copy_name: true,
                    ..SignatureOptions::default()
                });
                if view.func.signature() != stripped {
                    return fail(format!(
                        "signature of {} does not match the view: {} != {}",
                        copy.func.name,
                        stripped,
                        view.func.signature()
                    ));
                }
                if !copy.tags.contains("view_copy") {
                    return fail(format!(
                        "{} appears to be a view_copy operator; it must be tagged view_copy",
                        copy.func.name
                    ));
                }
            }
        }
        if let Some(inplace) = &view_inplace {
            if view.func.signature() != inplace.func.signature() {
                return fail(format!(
                    "signature of {} does not match the view",
                    inplace.func.name
                ));
            }
            if view.has_composite_implicit_autograd_kernel
                != inplace.has_composite_implicit_autograd_kernel
            {
                return fail(format!(
                    "{} and {} must either both have CompositeImplicitAutograd kernels, \
                     or both not have composite kernels",
                    view.func.name, inplace.func.name
                ));
            }
        }

        Ok(NativeFunctionsViewGroup {
            view,
            view_copy,
            view_inplace,
        })
    }

    pub fn functions(&self, include_copy: bool) -> impl Iterator<Item = &NativeFunction> {
        let copy = self.view_copy.as_ref().filter(|_| include_copy);
        [Some(&self.view), self.view_inplace.as_ref(), copy]
            .into_iter()
            .flatten()
    }

    pub fn root_name(&self) -> &str {
        self.view.root_name()
    }

    /// Consistency with the inplace variant is checked at construction
    pub fn composite(&self) -> bool {
        self.view.has_composite_implicit_autograd_kernel
    }
}

/// Only aliasing ops get a generated copy variant, and not composite
/// implicit ones (they decompose) or inplace views
pub fn gets_generated_view_copy(f: &NativeFunction) -> bool {
    f.is_view_op() && !f.has_composite_implicit_autograd_kernel && !f.tags.contains("inplace_view")
}

/// Ops whose copy variant is declared by hand
const EXPLICIT_VIEW_COPY_OPERATORS: [&str; 1] = ["narrow"];

/// Name of the `_copy` variant of a view op
pub fn get_view_copy_name(f: &NativeFunction) -> Result<OperatorName, GroupError> {
    let name = f.func.name.to_string();
    if !EXPLICIT_VIEW_COPY_OPERATORS.contains(&name.as_str()) && !gets_generated_view_copy(f) {
        return Err(GroupError::View {
            name,
            message: "does not get a generated view_copy variant".into(),
        });
    }
    Ok(view_copy_name(f))
}

fn view_copy_name(f: &NativeFunction) -> OperatorName {
    OperatorName {
        name: BaseOperatorName {
            base: format!("{}_copy", f.func.name.name.base),
            inplace: false,
            dunder_method: f.func.name.name.dunder_method,
        },
        overload_name: f.func.name.overload_name.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================
