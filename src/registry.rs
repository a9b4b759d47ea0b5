//! Batch loader for native function declarations
//!
//! Reads a YAML list of entries, builds a [`NativeFunction`] per entry,
//! merges every per-key kernel table into one [`BackendIndex`] per dispatch
//! key, and then assembles the operator and view families.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::{BackendIndex, BackendIndices};
use crate::error::{GroupError, ModelError};
use crate::groups::{NativeFunctionsGroup, NativeFunctionsViewGroup};
use crate::keys::{DispatchKey, ViewSchemaKind};
use crate::native_function::{Location, NativeFunction};
use crate::operator_name::OperatorName;
use crate::schema::{FunctionSchema, SchemaKind};

/// Everything loaded from one declaration file
#[derive(Debug, Clone)]
pub struct NativeFunctionsRegistry {
    /// In declaration order
    pub functions: Vec<NativeFunction>,
    pub groups: Vec<NativeFunctionsGroup>,
    /// Functions that did not form a group
    pub ungrouped: Vec<NativeFunction>,
    pub view_groups: Vec<NativeFunctionsViewGroup>,
    pub backend_indices: BTreeMap<DispatchKey, BackendIndex>,
}

impl NativeFunctionsRegistry {
    /// Load a declaration file from disk
    pub fn load_file(
        path: impl AsRef<Path>,
        valid_tags: &HashSet<String>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let registry = Self::from_yaml_str(&source, &path.display().to_string(), valid_tags)
            .with_context(|| format!("Failed to load native functions from {}", path.display()))?;
        Ok(registry)
    }

    pub fn from_yaml_str(
        source: &str,
        file_name: &str,
        valid_tags: &HashSet<String>,
    ) -> Result<Self, ModelError> {
        Self::from_yaml_str_with(source, file_name, valid_tags, None)
    }

    /// Like [`Self::from_yaml_str`], dropping kernels registered for any of
    /// `ignore_keys`
    pub fn from_yaml_str_with(
        source: &str,
        file_name: &str,
        valid_tags: &HashSet<String>,
        ignore_keys: Option<&HashSet<DispatchKey>>,
    ) -> Result<Self, ModelError> {
        let entries: Vec<serde_yaml::Value> = serde_yaml::from_str(source)?;
        let lines = entry_lines(source);

        let mut functions = Vec::with_capacity(entries.len());
        let mut indices = BackendIndices::new();
        for (i, entry) in entries.iter().enumerate() {
            let line = lines.get(i).copied().unwrap_or(0);
            let loc = Location::new(file_name, line);
            let (f, metadata) = NativeFunction::from_yaml(entry, loc, valid_tags, ignore_keys)?;
            debug!(op = %f.func.name, kind = %f.func.kind(), line, "parsed native function");
            BackendIndex::grow_index(&mut indices, metadata)?;
            functions.push(f);
        }

        let backend_indices = indices
            .into_iter()
            .map(|(key, index)| {
                (
                    key,
                    BackendIndex {
                        dispatch_key: key,
                        use_out_as_primary: true,
                        device_guard: key.is_cuda(),
                        external: false,
                        index,
                    },
                )
            })
            .collect();

        let (groups, ungrouped) = group_by_signature(&functions)?;
        for f in &ungrouped {
            f.validate_unstructured()?;
        }
        let view_groups = group_by_view(&functions)?;

        info!(
            file = file_name,
            functions = functions.len(),
            groups = groups.len(),
            view_groups = view_groups.len(),
            "Loaded native functions"
        );

        Ok(Self {
            functions,
            groups,
            ungrouped,
            view_groups,
            backend_indices,
        })
    }

    pub fn get(&self, name: &OperatorName) -> Option<&NativeFunction> {
        self.functions.iter().find(|f| &f.func.name == name)
    }

    pub fn backend_index(&self, key: DispatchKey) -> Option<&BackendIndex> {
        self.backend_indices.get(&key)
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut by_kind = BTreeMap::new();
        for kind in SchemaKind::ALL {
            by_kind.insert(kind.as_str().to_string(), 0);
        }
        for f in &self.functions {
            *by_kind.entry(f.func.kind().as_str().to_string()).or_insert(0) += 1;
        }
        RegistrySummary {
            functions: self.functions.len(),
            by_kind,
            structured: self.functions.iter().filter(|f| f.structured).count(),
            groups: self.groups.len(),
            structured_groups: self.groups.iter().filter(|g| g.structured()).count(),
            view_groups: self.view_groups.len(),
            kernels: self
                .backend_indices
                .iter()
                .map(|(k, b)| (k.to_string(), b.index.len()))
                .collect(),
        }
    }
}

/// Counts reported by the lint binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub functions: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub structured: usize,
    pub groups: usize,
    pub structured_groups: usize,
    pub view_groups: usize,
    /// Kernel count per dispatch key
    pub kernels: BTreeMap<String, usize>,
}

impl fmt::Display for RegistrySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "functions: {} ({} structured)", self.functions, self.structured)?;
        for (kind, n) in &self.by_kind {
            writeln!(f, "  {kind}: {n}")?;
        }
        writeln!(
            f,
            "groups: {} ({} structured)",
            self.groups, self.structured_groups
        )?;
        writeln!(f, "view groups: {}", self.view_groups)?;
        writeln!(f, "kernels:")?;
        for (key, n) in &self.kernels {
            writeln!(f, "  {key}: {n}")?;
        }
        Ok(())
    }
}

/// 1-based line opening each item of the top-level sequence
///
/// The sequence indent is taken from its first `-` line; nested sequences and
/// block scalars sit deeper than that and are skipped.
fn entry_lines(source: &str) -> Vec<usize> {
    let mut indent = None;
    let mut lines = Vec::new();
    for (i, line) in source.lines().enumerate() {
        let body = line.trim_start_matches(' ');
        if body.is_empty() || body.starts_with('#') || body.starts_with("---") {
            continue;
        }
        if !is_item(body) {
            continue;
        }
        let depth = line.len() - body.len();
        if *indent.get_or_insert(depth) == depth {
            lines.push(i + 1);
        }
    }
    lines
}

fn is_item(body: &str) -> bool {
    body == "-" || body.starts_with("- ")
}

/// Buckets keyed by a schema, kept in order of first appearance
struct Buckets<K> {
    order: Vec<FunctionSchema>,
    slots: HashMap<FunctionSchema, BTreeMap<K, NativeFunction>>,
}

impl<K: Ord + fmt::Display> Buckets<K> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            slots: HashMap::new(),
        }
    }

    fn insert(&mut self, sig: FunctionSchema, key: K, f: &NativeFunction) -> Result<(), GroupError> {
        if !self.slots.contains_key(&sig) {
            self.order.push(sig.clone());
        }
        let bucket = self.slots.entry(sig.clone()).or_default();
        if let Some(first) = bucket.get(&key) {
            return Err(GroupError::DuplicateKind {
                signature: sig.to_string(),
                kind: key.to_string(),
                first: first.func.name.to_string(),
                second: f.func.name.to_string(),
            });
        }
        bucket.insert(key, f.clone());
        Ok(())
    }

    fn into_buckets(mut self) -> impl Iterator<Item = BTreeMap<K, NativeFunction>> {
        self.order
            .into_iter()
            .filter_map(move |sig| self.slots.remove(&sig))
    }
}

/// Collect functional/inplace/mutable/out families sharing a signature
fn group_by_signature(
    functions: &[NativeFunction],
) -> Result<(Vec<NativeFunctionsGroup>, Vec<NativeFunction>), GroupError> {
    let mut buckets = Buckets::new();
    for f in functions {
        buckets.insert(f.func.signature(), f.func.kind(), f)?;
    }

    let mut groups = Vec::new();
    let mut ungrouped = Vec::new();
    for d in buckets.into_buckets() {
        match NativeFunctionsGroup::from_dict(d.clone())? {
            Some(g) => {
                debug!(root = g.root_name(), structured = g.structured(), "grouped");
                groups.push(g);
            }
            None => ungrouped.extend(d.into_values()),
        }
    }
    Ok((groups, ungrouped))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ViewSlot {
    View(ViewSchemaKind),
    Schema(SchemaKind),
}

impl fmt::Display for ViewSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewSlot::View(ViewSchemaKind::Aliasing) => write!(f, "aliasing"),
            ViewSlot::View(ViewSchemaKind::AliasingInplace) => write!(f, "aliasing_inplace"),
            ViewSlot::View(ViewSchemaKind::NonAliasing) => write!(f, "non_aliasing"),
            ViewSlot::Schema(kind) => write!(f, "{kind}"),
        }
    }
}

/// Pair each view with its inplace and `_copy` counterparts. Non-aliasing
/// functions share buckets under their kind, so the functional member of a
/// view bucket is the copy variant.
fn group_by_view(functions: &[NativeFunction]) -> Result<Vec<NativeFunctionsViewGroup>, ModelError> {
    let mut buckets = Buckets::new();
    for f in functions {
        let slot = match f.view_schema_kind()? {
            ViewSchemaKind::NonAliasing => ViewSlot::Schema(f.func.kind()),
            view_kind => ViewSlot::View(view_kind),
        };
        buckets.insert(f.func.view_signature(), slot, f)?;
    }

    let mut view_groups = Vec::new();
    for mut d in buckets.into_buckets() {
        let Some(view) = d.remove(&ViewSlot::View(ViewSchemaKind::Aliasing)) else {
            continue;
        };
        let view_inplace = d.remove(&ViewSlot::View(ViewSchemaKind::AliasingInplace));
        let view_copy = d.remove(&ViewSlot::Schema(SchemaKind::Functional));
        let g = NativeFunctionsViewGroup::new(view, view_copy, view_inplace)?;
        debug!(root = g.root_name(), copy = g.view_copy.is_some(), "view grouped");
        view_groups.push(g);
    }
    Ok(view_groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABS: &str = r#"
- func: abs(Tensor self) -> Tensor
  dispatch:
    CPU: abs_cpu

- func: abs_(Tensor(a!) self) -> Tensor(a!)
  dispatch:
    CPU: abs_cpu_

- func: abs.out(Tensor self, *, Tensor(a!) out) -> Tensor(a!)
  dispatch:
    CPU, CUDA: abs_out
"#;

    #[test]
    fn test_entry_lines() {
        assert_eq!(entry_lines(ABS), vec![2, 6, 10]);

        let any_first_key = "\
# header
- variants: function
  func: foo(Tensor self) -> Tensor
  tags:
  - core
- func: bar(Tensor self) -> Tensor
";
        assert_eq!(entry_lines(any_first_key), vec![2, 6]);

        let indented = "---\n  - func: foo(Tensor self) -> Tensor\n    variants:\n    - function\n  -\n    func: bar(Tensor self) -> Tensor\n";
        assert_eq!(entry_lines(indented), vec![2, 5]);
    }

    #[test]
    fn test_load_family() {
        let r = NativeFunctionsRegistry::from_yaml_str(ABS, "abs.yaml", &HashSet::new()).unwrap();
        assert_eq!(r.functions.len(), 3);
        assert_eq!(r.groups.len(), 1);
        assert!(r.ungrouped.is_empty());
        assert!(r.view_groups.is_empty());

        let g = &r.groups[0];
        assert_eq!(g.functional.func.name.to_string(), "abs");
        assert_eq!(g.out.loc, Location::new("abs.yaml", 10));

        let cuda = r.backend_index(DispatchKey::CUDA).unwrap();
        assert!(cuda.device_guard);
        assert!(cuda.use_out_as_primary);
        assert_eq!(cuda.get_kernel(g).map(|m| m.kernel.as_str()), Some("abs_out"));
        assert!(!r.backend_index(DispatchKey::CPU).unwrap().device_guard);
    }

    #[test]
    fn test_summary() {
        let r = NativeFunctionsRegistry::from_yaml_str(ABS, "abs.yaml", &HashSet::new()).unwrap();
        let s = r.summary();
        assert_eq!(s.functions, 3);
        assert_eq!(s.by_kind["functional"], 1);
        assert_eq!(s.by_kind["mutable"], 0);
        assert_eq!(s.groups, 1);
        assert_eq!(s.structured_groups, 0);
        assert_eq!(s.kernels["CPU"], 3);
        assert_eq!(s.kernels["CUDA"], 1);
    }

    #[test]
    fn test_ignore_keys() {
        let ignore = HashSet::from([DispatchKey::CUDA]);
        let r = NativeFunctionsRegistry::from_yaml_str_with(
            ABS,
            "abs.yaml",
            &HashSet::new(),
            Some(&ignore),
        )
        .unwrap();
        assert!(r.backend_index(DispatchKey::CUDA).is_none());
    }

    #[test]
    fn test_duplicate_kind() {
        // Overload names are not part of the signature
        let src = r#"
- func: neg(Tensor self) -> Tensor
  dispatch:
    CPU: neg
- func: neg.other(Tensor self) -> Tensor
  dispatch:
    CPU: neg_other
"#;
        let err = NativeFunctionsRegistry::from_yaml_str(src, "neg.yaml", &HashSet::new())
            .unwrap_err();
        match err {
            ModelError::Group(GroupError::DuplicateKind {
                kind, first, second, ..
            }) => {
                assert_eq!(kind, "functional");
                assert_eq!(first, "neg");
                assert_eq!(second, "neg.other");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_registration() {
        let src = r#"
- func: neg(Tensor self) -> Tensor
  dispatch:
    CPU: neg
- func: neg(Tensor self, int x) -> Tensor
  dispatch:
    CPU: neg_x
"#;
        let err = NativeFunctionsRegistry::from_yaml_str(src, "neg.yaml", &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, ModelError::Backend(_)));
    }

    #[test]
    fn test_not_a_list() {
        let err = NativeFunctionsRegistry::from_yaml_str("func: abs", "x.yaml", &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, ModelError::Yaml(_)));
    }
}
