//! Closed vocabularies used by native function records
//!
//! Dispatch keys, scalar types, ufunc keys and the small enums that go with
//! them. Names that are aliases of other keys are resolved through an
//! explicit table at parse time.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::LazyLock;

/// Declare a closed enum whose variants have fixed surface spellings
macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name { $($variant),+ }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self { $($name::$variant => $text),+ }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|v| v.as_str() == name)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ============================================================================
// Dispatch keys
// ============================================================================

named_enum! {
    /// Backend / execution-mode identifiers a kernel can be registered for
    pub enum DispatchKey {
        Undefined => "Undefined",

        Dense => "Dense",
        FPGA => "FPGA",
        ORT => "ORT",
        MPS => "MPS",
        Vulkan => "Vulkan",
        Metal => "Metal",
        MKLDNN => "MKLDNN",
        OpenGL => "OpenGL",
        OpenCL => "OpenCL",
        IDEEP => "IDEEP",
        Quantized => "Quantized",
        CustomRNGKeyId => "CustomRNGKeyId",
        MkldnnCPU => "MkldnnCPU",
        Sparse => "Sparse",
        SparseCsrCPU => "SparseCsrCPU",
        SparseCsrCUDA => "SparseCsrCUDA",

        ZeroTensor => "ZeroTensor",
        Meta => "Meta",
        BackendSelect => "BackendSelect",
        Named => "Named",
        AutogradOther => "AutogradOther",
        AutogradFunctionality => "AutogradFunctionality",
        AutogradNestedTensor => "AutogradNestedTensor",
        Tracer => "Tracer",
        Autocast => "Autocast",
        Batched => "Batched",
        VmapMode => "VmapMode",
        TestingOnlyGenericWrapper => "TESTING_ONLY_GenericWrapper",
        TestingOnlyGenericMode => "TESTING_ONLY_GenericMode",

        CPU => "CPU",
        CUDA => "CUDA",
        HIP => "HIP",
        XLA => "XLA",
        Lazy => "Lazy",
        IPU => "IPU",
        XPU => "XPU",
        NestedTensor => "NestedTensor",
        PrivateUse1 => "PrivateUse1",
        PrivateUse2 => "PrivateUse2",
        PrivateUse3 => "PrivateUse3",

        QuantizedCPU => "QuantizedCPU",
        QuantizedCUDA => "QuantizedCUDA",
        QuantizedXPU => "QuantizedXPU",

        SparseCPU => "SparseCPU",
        SparseCUDA => "SparseCUDA",
        SparseHIP => "SparseHIP",
        SparseXPU => "SparseXPU",

        NestedTensorCPU => "NestedTensorCPU",
        NestedTensorCUDA => "NestedTensorCUDA",

        AutogradCPU => "AutogradCPU",
        AutogradCUDA => "AutogradCUDA",
        AutogradXLA => "AutogradXLA",
        AutogradLazy => "AutogradLazy",
        AutogradIPU => "AutogradIPU",
        AutogradMPS => "AutogradMPS",
        AutogradXPU => "AutogradXPU",
        AutogradPrivateUse1 => "AutogradPrivateUse1",
        AutogradPrivateUse2 => "AutogradPrivateUse2",
        AutogradPrivateUse3 => "AutogradPrivateUse3",

        Autograd => "Autograd",
        CompositeImplicitAutograd => "CompositeImplicitAutograd",
        CompositeExplicitAutograd => "CompositeExplicitAutograd",
    }
}

/// Spellings that name another key
static DISPATCH_KEY_ALIASES: LazyLock<HashMap<&'static str, DispatchKey>> = LazyLock::new(|| {
    HashMap::from([
        ("CatchAll", DispatchKey::Undefined),
        ("EndOfFunctionalityKeys", DispatchKey::TestingOnlyGenericMode),
        ("EndOfAliasKeys", DispatchKey::CompositeExplicitAutograd),
        ("CPUTensorId", DispatchKey::CPU),
        ("CUDATensorId", DispatchKey::CUDA),
        ("PrivateUse1_PreAutograd", DispatchKey::AutogradPrivateUse1),
        ("PrivateUse2_PreAutograd", DispatchKey::AutogradPrivateUse2),
        ("PrivateUse3_PreAutograd", DispatchKey::AutogradPrivateUse3),
    ])
});

/// Keys with structured kernel codegen
pub const STRUCTURED_DISPATCH_KEYS: [DispatchKey; 3] =
    [DispatchKey::MPS, DispatchKey::CUDA, DispatchKey::CPU];

/// Keys with ufunc codegen; currently the same as the structured CPU/CUDA keys
pub const UFUNC_DISPATCH_KEYS: [DispatchKey; 2] = [DispatchKey::CUDA, DispatchKey::CPU];

/// Keys a `dispatch:` table may name
pub const SUPPORTED_DISPATCH_KEYS: [DispatchKey; 16] = [
    DispatchKey::CPU,
    DispatchKey::SparseCPU,
    DispatchKey::SparseCsrCPU,
    DispatchKey::MkldnnCPU,
    DispatchKey::CUDA,
    DispatchKey::MPS,
    DispatchKey::SparseCUDA,
    DispatchKey::SparseCsrCUDA,
    DispatchKey::QuantizedCPU,
    DispatchKey::QuantizedCUDA,
    DispatchKey::CompositeImplicitAutograd,
    DispatchKey::CompositeExplicitAutograd,
    DispatchKey::NestedTensorCPU,
    DispatchKey::NestedTensorCUDA,
    // Generated automatically for structured kernels
    DispatchKey::Meta,
    DispatchKey::ZeroTensor,
];

impl DispatchKey {
    /// Resolve a key name, including alias spellings
    pub fn parse(name: &str) -> Option<Self> {
        Self::from_name(name).or_else(|| DISPATCH_KEY_ALIASES.get(name).copied())
    }

    pub fn lower(&self) -> String {
        self.as_str().to_lowercase()
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_DISPATCH_KEYS.contains(self)
    }

    /// Keys that "support all backends"
    pub fn is_generic(&self) -> bool {
        matches!(
            self,
            DispatchKey::CompositeExplicitAutograd | DispatchKey::CompositeImplicitAutograd
        )
    }

    pub fn is_cuda(&self) -> bool {
        matches!(
            self,
            DispatchKey::CUDA
                | DispatchKey::QuantizedCUDA
                | DispatchKey::SparseCUDA
                | DispatchKey::SparseCsrCUDA
                | DispatchKey::NestedTensorCUDA
                | DispatchKey::AutogradCUDA
        )
    }

    pub fn is_structured(&self) -> bool {
        STRUCTURED_DISPATCH_KEYS.contains(self)
    }

    pub fn is_ufunc(&self) -> bool {
        UFUNC_DISPATCH_KEYS.contains(self)
    }
}

// ============================================================================
// Scalar types
// ============================================================================

named_enum! {
    /// Element dtype; named ScalarType for symmetry with the C++ side
    pub enum ScalarType {
        Byte => "Byte",
        Char => "Char",
        Short => "Short",
        Int => "Int",
        Long => "Long",
        Half => "Half",
        Float => "Float",
        Double => "Double",
        ComplexHalf => "ComplexHalf",
        ComplexFloat => "ComplexFloat",
        ComplexDouble => "ComplexDouble",
        Bool => "Bool",
        BFloat16 => "BFloat16",
    }
}

impl ScalarType {
    /// Expand a dtype class name; Integral excludes Bool and Floating
    /// excludes the low precision types
    pub fn class(name: &str) -> Option<BTreeSet<ScalarType>> {
        use ScalarType::*;
        let integral = [Byte, Char, Int, Long, Short];
        let floating = [Float, Double];
        let complex = [ComplexFloat, ComplexDouble];
        let members: Vec<ScalarType> = match name {
            "Integral" => integral.to_vec(),
            "Floating" => floating.to_vec(),
            "Complex" => complex.to_vec(),
            "All" => [&integral[..], &floating[..]].concat(),
            "AllAndComplex" => [&integral[..], &floating[..], &complex[..]].concat(),
            "FloatingAndComplex" => [&floating[..], &complex[..]].concat(),
            _ => return None,
        };
        Some(members.into_iter().collect())
    }

    /// Parse `Float, Double, Integral`-style lists; the first unknown name
    /// is returned as the error
    pub fn parse_set(values: &str) -> Result<BTreeSet<ScalarType>, String> {
        let mut dtypes = BTreeSet::new();
        for value in values.split(", ") {
            match Self::class(value) {
                Some(class) => dtypes.extend(class),
                None => {
                    dtypes.insert(Self::from_name(value).ok_or_else(|| value.to_string())?);
                }
            }
        }
        Ok(dtypes)
    }
}

// ============================================================================
// Ufunc keys, device checks, variants
// ============================================================================

named_enum! {
    /// Entries of `ufunc_inner_loop`. The low level keys name one
    /// instantiation each; ScalarOnly and Generic fill in the rest.
    pub enum UfuncKey {
        CUDAFunctor => "CUDAFunctor",
        CUDAFunctorOnOther => "CUDAFunctorOnOther",
        CUDAFunctorOnSelf => "CUDAFunctorOnSelf",
        CPUScalar => "CPUScalar",
        CPUVector => "CPUVector",
        ScalarOnly => "ScalarOnly",
        Generic => "Generic",
    }
}

named_enum! {
    pub enum DeviceCheckType {
        NoCheck => "NoCheck",
        ExactSame => "ExactSame",
    }
}

named_enum! {
    /// Values of the `variants` field
    pub enum Variant {
        Function => "function",
        Method => "method",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewSchemaKind {
    Aliasing,
    AliasingInplace,
    NonAliasing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_key_names() {
        assert_eq!(DispatchKey::parse("CPU"), Some(DispatchKey::CPU));
        assert_eq!(
            DispatchKey::parse("TESTING_ONLY_GenericMode"),
            Some(DispatchKey::TestingOnlyGenericMode)
        );
        assert_eq!(DispatchKey::parse("Bogus"), None);
        assert_eq!(DispatchKey::CompositeImplicitAutograd.lower(), "compositeimplicitautograd");
    }

    #[test]
    fn test_dispatch_key_aliases() {
        assert_eq!(DispatchKey::parse("CatchAll"), Some(DispatchKey::Undefined));
        assert_eq!(DispatchKey::parse("CUDATensorId"), Some(DispatchKey::CUDA));
        assert_eq!(
            DispatchKey::parse("EndOfAliasKeys"),
            Some(DispatchKey::CompositeExplicitAutograd)
        );
        // Aliases print as the key they name
        assert_eq!(DispatchKey::parse("CPUTensorId").unwrap().to_string(), "CPU");
    }

    #[test]
    fn test_dispatch_key_predicates() {
        assert!(DispatchKey::CPU.is_structured());
        assert!(!DispatchKey::SparseCPU.is_structured());
        assert!(DispatchKey::CUDA.is_ufunc());
        assert!(!DispatchKey::MPS.is_ufunc());
        assert!(DispatchKey::SparseCsrCUDA.is_cuda());
        assert!(DispatchKey::CompositeExplicitAutograd.is_generic());
        assert!(DispatchKey::Meta.is_supported());
        assert!(!DispatchKey::XLA.is_supported());
    }

    #[test]
    fn test_scalar_type_sets() {
        let set = ScalarType::parse_set("Float, Bool").unwrap();
        assert_eq!(set.len(), 2);

        let set = ScalarType::parse_set("AllAndComplex, BFloat16, Half").unwrap();
        assert_eq!(set.len(), 11);
        assert!(set.contains(&ScalarType::ComplexDouble));
        assert!(!set.contains(&ScalarType::Bool));

        assert_eq!(ScalarType::parse_set("Float, Quux"), Err("Quux".to_string()));
    }

    #[test]
    fn test_variant_names() {
        assert_eq!(Variant::from_name("method"), Some(Variant::Method));
        assert_eq!(Variant::from_name("Method"), None);
    }
}
