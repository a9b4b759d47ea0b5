//! opschema: operator schema model
//!
//! Parses and validates declarations of tensor operators, the way they are
//! written in a `native_functions.yaml` style registry:
//! - Type, annotation, argument and operator name grammars (nom)
//! - Argument classification (self, out, kwarg-only, tensor options)
//! - Function schemas with their kind and core signature
//! - Native function records with dispatch tables
//! - Functional/inplace/mutable/out families and view families
//! - Per dispatch key backend kernel index
//!
//! Every value prints back to exactly the text it was parsed from.

pub mod annotation;
pub mod argument;
pub mod arguments;
pub mod backend;
pub mod error;
pub mod groups;
pub mod keys;
pub mod native_function;
pub mod operator_name;
pub mod registry;
pub mod schema;
pub mod types;

pub use annotation::Annotation;
pub use argument::{Argument, Return, SelfArgument, TensorOptionsArguments};
pub use arguments::{ArgumentItem, Arguments};
pub use backend::{
    gets_generated_out_inplace_wrapper, BackendIndex, BackendIndices, BackendMetadata,
    NativeFunctionOrGroup,
};
pub use error::{
    BackendError, GroupError, ModelError, RecordError, RecordErrorKind, SchemaError,
};
pub use groups::{
    get_view_copy_name, gets_generated_view_copy, NativeFunctionsGroup, NativeFunctionsViewGroup,
};
pub use keys::{DeviceCheckType, DispatchKey, ScalarType, UfuncKey, Variant, ViewSchemaKind};
pub use native_function::{Location, NativeFunction, Precompute, UfuncInnerLoop};
pub use operator_name::{BaseOperatorName, OperatorName};
pub use registry::{NativeFunctionsRegistry, RegistrySummary};
pub use schema::{FunctionSchema, SchemaKind, SignatureOptions};
pub use types::{BaseTy, Type};

/// Serialize as the printed form, deserialize through the parser
macro_rules! serde_as_text {
    ($($ty:ty),* $(,)?) => {
        $(
            impl serde::Serialize for $ty {
                fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.collect_str(self)
                }
            }

            impl<'de> serde::Deserialize<'de> for $ty {
                fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                    let s = String::deserialize(deserializer)?;
                    s.parse().map_err(serde::de::Error::custom)
                }
            }
        )*
    };
}

serde_as_text!(Type, Annotation, Argument, Return, OperatorName, FunctionSchema);
