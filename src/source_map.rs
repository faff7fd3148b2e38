use std::collections::BTreeMap;
use std::path::{Component, Path};

use crate::errors::{CollageError, Result};
use crate::types::NodeId;

/// Source files of a commit, grouped by the participant that holds them.
///
/// Built from `<participantId>:<fileName>` specifications. Files keep the
/// order of their first occurrence; repeated entries are collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceMap {
    nodes: BTreeMap<NodeId, Vec<String>>,
}

impl SourceMap {
    /// Parses a list of `<participantId>:<fileName>` specifications.
    ///
    /// The specification is split on its first `:`. File names must not
    /// contain `:` or `,` because both are separators in the wire format,
    /// and must be plain names (see [`is_plain_file_name`]).
    ///
    /// # Errors
    ///
    /// Returns [`CollageError::InvalidSource`] if the list is empty or an
    /// entry has an empty participant, an empty file name, a reserved
    /// character in its file name or a file name that is a path.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        if specs.is_empty() {
            return Err(CollageError::InvalidSource(
                "at least one source is required".to_string(),
            ));
        }

        let mut nodes: BTreeMap<NodeId, Vec<String>> = BTreeMap::new();
        for spec in specs {
            let spec = spec.as_ref();
            let (node, file) = spec.split_once(':').ok_or_else(|| {
                CollageError::InvalidSource(format!("{spec:?} is not of the form <node>:<file>"))
            })?;
            if node.is_empty() || file.is_empty() {
                return Err(CollageError::InvalidSource(format!(
                    "{spec:?} has an empty node or file name"
                )));
            }
            if file.contains([':', ',']) {
                return Err(CollageError::InvalidSource(format!(
                    "file name {file:?} contains a reserved character"
                )));
            }
            if !is_plain_file_name(file) {
                return Err(CollageError::InvalidSource(format!(
                    "file name {file:?} is not a plain file name"
                )));
            }

            let files = nodes.entry(node.to_string()).or_default();
            if !files.iter().any(|f| f == file) {
                files.push(file.to_string());
            }
        }

        Ok(Self { nodes })
    }

    /// Participants involved in the transaction, in a stable order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn files_for(&self, node: &str) -> Option<&[String]> {
        self.nodes.get(node).map(Vec::as_slice)
    }

    pub fn contains_node(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &[String])> {
        self.nodes.iter().map(|(node, files)| (node, files.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Flattens the map back into `<participantId>:<fileName>` specifications.
    pub fn to_specs(&self) -> Vec<String> {
        self.iter()
            .flat_map(|(node, files)| files.iter().map(move |file| format!("{node}:{file}")))
            .collect()
    }
}

/// Whether `name` names an entry directly inside a directory: not empty,
/// not `.` or `..`, not absolute and free of path separators.
pub fn is_plain_file_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}
