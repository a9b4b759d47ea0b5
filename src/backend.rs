//! Per-backend kernel tables
//!
//! A [`BackendIndex`] holds what differs per dispatch key for each operator,
//! most obviously the kernel name from the `dispatch` table. External
//! backends can toggle structured kernels independently of in-tree ones, so
//! structured-ness is tracked here too.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::BackendError;
use crate::groups::NativeFunctionsGroup;
use crate::keys::DispatchKey;
use crate::native_function::NativeFunction;
use crate::operator_name::OperatorName;
use crate::schema::SchemaKind;

/// Kernel binding for one (operator, dispatch key) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendMetadata {
    pub kernel: String,
    pub structured: bool,
}

/// Dispatch key -> operator -> kernel
pub type BackendIndices = BTreeMap<DispatchKey, BTreeMap<OperatorName, BackendMetadata>>;

/// Either a single function or a group resolved through its primary member
#[derive(Debug, Clone, Copy)]
pub enum NativeFunctionOrGroup<'a> {
    Function(&'a NativeFunction),
    Group(&'a NativeFunctionsGroup),
}

impl<'a> From<&'a NativeFunction> for NativeFunctionOrGroup<'a> {
    fn from(f: &'a NativeFunction) -> Self {
        NativeFunctionOrGroup::Function(f)
    }
}

impl<'a> From<&'a NativeFunctionsGroup> for NativeFunctionOrGroup<'a> {
    fn from(g: &'a NativeFunctionsGroup) -> Self {
        NativeFunctionOrGroup::Group(g)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendIndex {
    pub dispatch_key: DispatchKey,
    /// Which member of a group implements the others. In-tree backends use
    /// the out kernel; external ones typically use the functional kernel.
    pub use_out_as_primary: bool,
    /// Whether the backend needs a device guard and device checks
    pub device_guard: bool,
    /// Out of tree (e.g. XLA)
    pub external: bool,
    pub index: BTreeMap<OperatorName, BackendMetadata>,
}

impl BackendIndex {
    /// Merge `child` into `parent`; an operator may be registered only once
    /// per dispatch key
    pub fn grow_index(
        parent: &mut BackendIndices,
        child: BackendIndices,
    ) -> Result<(), BackendError> {
        for (key, ops) in child {
            let table = parent.entry(key).or_default();
            for (op, metadata) in ops {
                if table.contains_key(&op) {
                    return Err(BackendError::DuplicateOperator { op, key });
                }
                table.insert(op, metadata);
            }
        }
        Ok(())
    }

    pub fn primary<'g>(&self, g: &'g NativeFunctionsGroup) -> &'g NativeFunction {
        if self.use_out_as_primary {
            &g.out
        } else {
            &g.functional
        }
    }

    pub fn get_kernel<'a>(&self, g: impl Into<NativeFunctionOrGroup<'a>>) -> Option<&BackendMetadata> {
        let f = match g.into() {
            NativeFunctionOrGroup::Function(f) => f,
            NativeFunctionOrGroup::Group(g) => self.primary(g),
        };
        self.index.get(&f.func.name)
    }

    pub fn has_kernel<'a>(&self, g: impl Into<NativeFunctionOrGroup<'a>>) -> bool {
        self.get_kernel(g).is_some()
    }

    /// Name of the generated kernel class; in-tree kernels have none
    pub fn native_function_class_name(&self) -> Option<String> {
        self.external
            .then(|| format!("{}NativeFunctions", self.dispatch_key))
    }
}

/// True when `f` is a non-functional member of `g` that this backend does
/// not implement itself but can wrap around the functional kernel
pub fn gets_generated_out_inplace_wrapper(
    f: &NativeFunction,
    g: &NativeFunctionsGroup,
    b: &BackendIndex,
) -> bool {
    f.func.kind() != SchemaKind::Functional && !b.has_kernel(f) && b.has_kernel(&g.functional)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native_function::Location;
    use std::collections::HashSet;

    fn op(name: &str) -> OperatorName {
        OperatorName::parse(name).unwrap()
    }

    fn metadata(kernel: &str) -> BackendMetadata {
        BackendMetadata {
            kernel: kernel.to_string(),
            structured: false,
        }
    }

    #[test]
    fn test_grow_index() {
        let mut parent = BackendIndices::new();
        let child = BTreeMap::from([(
            DispatchKey::CPU,
            BTreeMap::from([(op("add.Tensor"), metadata("add_cpu"))]),
        )]);
        BackendIndex::grow_index(&mut parent, child).unwrap();

        let child = BTreeMap::from([(
            DispatchKey::CPU,
            BTreeMap::from([(op("mul.Tensor"), metadata("mul_cpu"))]),
        )]);
        BackendIndex::grow_index(&mut parent, child).unwrap();
        assert_eq!(parent[&DispatchKey::CPU].len(), 2);
    }

    #[test]
    fn test_grow_index_rejects_duplicates() {
        let entry = || {
            BTreeMap::from([(
                DispatchKey::CUDA,
                BTreeMap::from([(op("add.Tensor"), metadata("add_cuda"))]),
            )])
        };
        let mut parent = entry();
        let err = BackendIndex::grow_index(&mut parent, entry()).unwrap_err();
        assert_eq!(
            err,
            BackendError::DuplicateOperator {
                op: op("add.Tensor"),
                key: DispatchKey::CUDA
            }
        );
        assert_eq!(
            err.to_string(),
            "duplicate operator add.Tensor for dispatch key CUDA"
        );
    }

    fn nf(yaml: &str) -> NativeFunction {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        NativeFunction::from_yaml(
            &value,
            Location::new("test.yaml", 1),
            &HashSet::new(),
            None,
        )
        .unwrap()
        .0
    }

    #[test]
    fn test_primary_and_wrappers() {
        let functional = nf("func: abs(Tensor self) -> Tensor\ndispatch:\n  CPU: abs\n");
        let inplace = nf("func: abs_(Tensor(a!) self) -> Tensor(a!)\ndispatch:\n  CPU: abs_\n");
        let out = nf("func: abs.out(Tensor self, *, Tensor(a!) out) -> Tensor(a!)\ndispatch:\n  CPU: abs_out\n");
        let g = NativeFunctionsGroup::new(functional, Some(inplace), None, out).unwrap();

        let mut index = BackendIndex {
            dispatch_key: DispatchKey::XLA,
            use_out_as_primary: true,
            device_guard: false,
            external: true,
            index: BTreeMap::from([(op("abs"), metadata("abs_xla"))]),
        };
        assert_eq!(index.primary(&g).func.name, op("abs.out"));
        assert!(!index.has_kernel(&g));

        index.use_out_as_primary = false;
        assert_eq!(index.primary(&g).func.name, op("abs"));
        assert_eq!(index.get_kernel(&g).map(|m| m.kernel.as_str()), Some("abs_xla"));

        let inplace = g.inplace.as_ref().unwrap();
        assert!(gets_generated_out_inplace_wrapper(inplace, &g, &index));
        assert!(gets_generated_out_inplace_wrapper(&g.out, &g, &index));
        assert!(!gets_generated_out_inplace_wrapper(&g.functional, &g, &index));
    }

    #[test]
    fn test_class_name() {
        let mut index = BackendIndex {
            dispatch_key: DispatchKey::XLA,
            use_out_as_primary: false,
            device_guard: false,
            external: true,
            index: BTreeMap::new(),
        };
        assert_eq!(
            index.native_function_class_name().as_deref(),
            Some("XLANativeFunctions")
        );
        index.external = false;
        assert_eq!(index.native_function_class_name(), None);
    }
}
