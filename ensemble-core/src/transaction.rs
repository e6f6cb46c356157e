//! Transaction events: one logical user edit over a set of objects.
//!
//! A transaction is sent either as a best-effort *snapshot* (preview while
//! the edit is still in progress) or as a reliable *finalized* event that the
//! server admits into the ledger. Both carry the same [`TransactionEvent`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Property holding an object's user-facing label. Edits touching only this
/// property are cosmetic renames, never structural changes.
pub const LABEL_PROPERTY: &str = "label";

/// Identity of a replicated object.
///
/// Objects live inside a package. `outer_path` is the dotted path of the
/// enclosing object inside that package (empty for top-level objects).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub class_path: String,
    pub package_name: String,
    pub outer_path: String,
    pub object_name: String,
    pub flags: u32,
}

impl ObjectId {
    pub fn new(
        class_path: impl Into<String>,
        package_name: impl Into<String>,
        outer_path: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            class_path: class_path.into(),
            package_name: package_name.into(),
            outer_path: outer_path.into(),
            object_name: object_name.into(),
            flags: 0,
        }
    }

    /// Full path: `Package:Outer.Name`, or `Package:Name` for top-level objects.
    pub fn object_path(&self) -> String {
        if self.outer_path.is_empty() {
            format!("{}:{}", self.package_name, self.object_name)
        } else {
            format!("{}:{}.{}", self.package_name, self.outer_path, self.object_name)
        }
    }

    /// Path of the enclosing object, `None` when the outer is the package itself.
    pub fn outer_object_path(&self) -> Option<String> {
        if self.outer_path.is_empty() {
            None
        } else {
            Some(format!("{}:{}", self.package_name, self.outer_path))
        }
    }

    /// Number of path segments below the package. Top-level objects have depth 1.
    pub fn path_depth(&self) -> u32 {
        if self.outer_path.is_empty() {
            1
        } else {
            self.outer_path.split('.').count() as u32 + 1
        }
    }

    /// The same object re-homed into another package.
    pub fn with_package(&self, package_name: &str) -> Self {
        Self {
            package_name: package_name.to_string(),
            ..self.clone()
        }
    }
}

/// One changed root property of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDelta {
    pub name: String,
    pub data: Vec<u8>,
}

/// Serialized object state carried by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectPayload {
    /// Full object serialization
    Full(Vec<u8>),
    /// Only the changed root properties
    Delta(Vec<PropertyDelta>),
}

impl ObjectPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            ObjectPayload::Full(data) => data.is_empty(),
            ObjectPayload::Delta(properties) => properties.is_empty(),
        }
    }
}

/// One object touched by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedObject {
    pub object_id: ObjectId,
    /// Depth used to create outers before their children
    pub object_path_depth: u32,
    pub payload: ObjectPayload,
    /// The object came into existence in this transaction
    pub is_new: bool,
    /// The object was destroyed by this transaction
    pub is_pending_kill: bool,
    /// Opaque annotation data; snapshots without one take a cheaper apply path
    pub annotation: Option<Vec<u8>>,
}

impl ExportedObject {
    pub fn new(object_id: ObjectId, payload: ObjectPayload) -> Self {
        let object_path_depth = object_id.path_depth();
        Self {
            object_id,
            object_path_depth,
            payload,
            is_new: false,
            is_pending_kill: false,
            annotation: None,
        }
    }
}

/// A logical edit, identified by `transaction_id`. `operation_id` is fresh
/// for every send of that edit and correlates snapshots with the finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: Uuid,
    pub operation_id: Uuid,
    pub title: String,
    pub exported_objects: Vec<ExportedObject>,
    pub modified_packages: BTreeSet<String>,
    /// The edit was canceled; objects carry their restored state
    pub canceled: bool,
}

impl TransactionEvent {
    pub fn new(transaction_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            transaction_id,
            operation_id: Uuid::new_v4(),
            title: title.into(),
            exported_objects: Vec::new(),
            modified_packages: BTreeSet::new(),
            canceled: false,
        }
    }

    /// Add an object, recording its package as modified.
    pub fn push_object(&mut self, object: ExportedObject) {
        self.modified_packages
            .insert(object.object_id.package_name.clone());
        self.exported_objects.push(object);
    }

    /// Lock resource names covering every exported object, deduplicated.
    pub fn resource_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .exported_objects
            .iter()
            .map(|o| o.object_id.object_path())
            .collect();
        names.into_iter().collect()
    }
}
