use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::signature::DocumentSignature;

/// Field name → resolved value (`None` = resolved as absent from the document).
pub type FieldMap = BTreeMap<String, Option<String>>;

/// Whether a document has been inserted into the similarity index.
///
/// One-way: `Unregistered → Registered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    #[default]
    Unregistered,
    Registered,
}

/// Authoritative cached state for one (label, filename, signature) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub label: String,
    pub pdf_filename: String,
    pub signature: DocumentSignature,
    fields: FieldMap,
    index_state: IndexState,
}

impl CacheEntry {
    pub fn new(label: &str, pdf_filename: &str, signature: DocumentSignature) -> Self {
        Self {
            label: label.to_string(),
            pdf_filename: pdf_filename.to_string(),
            signature,
            fields: FieldMap::new(),
            index_state: IndexState::Unregistered,
        }
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Merge newly resolved fields. Incoming values win on collision;
    /// existing keys are never dropped.
    pub fn merge_fields(&mut self, new_fields: FieldMap) {
        self.fields.extend(new_fields);
    }

    pub fn index_state(&self) -> IndexState {
        self.index_state
    }

    pub fn is_registered(&self) -> bool {
        self.index_state == IndexState::Registered
    }

    /// Record registration in the similarity index.
    /// Returns true only on the `Unregistered → Registered` transition.
    pub fn mark_registered(&mut self) -> bool {
        match self.index_state {
            IndexState::Unregistered => {
                self.index_state = IndexState::Registered;
                true
            }
            IndexState::Registered => false,
        }
    }
}
