use std::path::{Path, PathBuf};

use super::error::{BatchError, ItemError};
use super::types::{DatasetItem, FilledItem};
use crate::pipeline::cache::FieldMap;
use crate::pipeline::processor::ResultPayload;

/// Read a dataset file: a JSON array of items.
pub fn load_dataset(path: &Path) -> Result<Vec<DatasetItem>, BatchError> {
    let raw = std::fs::read_to_string(path)?;
    let items: Vec<DatasetItem> = serde_json::from_str(&raw)?;
    tracing::info!(path = %path.display(), items = items.len(), "Loaded dataset");
    Ok(items)
}

/// Resolve an item's PDF reference. Relative references are joined to `root`.
///
/// Returns the resolved path and the reference as written.
pub fn resolve_pdf_path(item: &DatasetItem, root: &Path) -> Result<(PathBuf, String), ItemError> {
    let reference = path_reference(item).ok_or(ItemError::MissingPathReference)?;

    let path = Path::new(reference);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    Ok((resolved, reference.to_string()))
}

/// Display name for an item, even when it has no usable reference.
pub fn file_name_for(item: &DatasetItem, index: usize) -> String {
    path_reference(item)
        .and_then(|r| r.rsplit(['/', '\\']).next())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("item_{index}.pdf"))
}

fn path_reference(item: &DatasetItem) -> Option<&str> {
    [item.pdf_path.as_deref(), item.pdf_filename.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|r| !r.is_empty())
}

/// Map every input schema key to the extracted value.
pub fn materialize_filled_item(item: &DatasetItem, payload: &ResultPayload) -> FilledItem {
    let schema: FieldMap = item
        .extraction_schema
        .keys()
        .map(|k| (k.clone(), payload.requested_fields.get(k).cloned().flatten()))
        .collect();
    filled_with(item, schema)
}

/// Every input schema key mapped to null.
pub fn empty_filled_item(item: &DatasetItem) -> FilledItem {
    let schema: FieldMap = item
        .extraction_schema
        .keys()
        .map(|k| (k.clone(), None))
        .collect();
    filled_with(item, schema)
}

fn filled_with(item: &DatasetItem, extraction_schema: FieldMap) -> FilledItem {
    // pdf_path wins when both references are present
    let (pdf_path, pdf_filename) = match &item.pdf_path {
        Some(p) => (Some(p.clone()), None),
        None => (None, item.pdf_filename.clone()),
    };
    FilledItem {
        label: item.label.clone(),
        extraction_schema,
        pdf_path,
        pdf_filename,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(json: &str) -> DatasetItem {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn relative_reference_joins_root() {
        let it = item(r#"{"label": "invoice", "pdf_filename": "a.pdf"}"#);
        let (path, reference) = resolve_pdf_path(&it, Path::new("/data/pdfs")).unwrap();
        assert_eq!(path, PathBuf::from("/data/pdfs/a.pdf"));
        assert_eq!(reference, "a.pdf");
    }

    #[test]
    fn absolute_reference_ignores_root() {
        let it = item(r#"{"pdf_path": "/elsewhere/b.pdf"}"#);
        let (path, _) = resolve_pdf_path(&it, Path::new("/data/pdfs")).unwrap();
        assert_eq!(path, PathBuf::from("/elsewhere/b.pdf"));
    }

    #[test]
    fn pdf_path_preferred_over_filename() {
        let it = item(r#"{"pdf_path": "sub/c.pdf", "pdf_filename": "other.pdf"}"#);
        let (path, reference) = resolve_pdf_path(&it, Path::new("/r")).unwrap();
        assert_eq!(path, PathBuf::from("/r/sub/c.pdf"));
        assert_eq!(reference, "sub/c.pdf");
        assert_eq!(file_name_for(&it, 0), "c.pdf");
    }

    #[test]
    fn blank_reference_is_missing() {
        let it = item(r#"{"pdf_path": "  "}"#);
        assert_eq!(
            resolve_pdf_path(&it, Path::new("/r")),
            Err(ItemError::MissingPathReference)
        );
        assert_eq!(file_name_for(&it, 4), "item_4.pdf");
    }

    #[test]
    fn filled_item_follows_input_schema() {
        let it = item(r#"{"label": "invoice", "extraction_schema": {"total": "", "date": ""}, "pdf_filename": "a.pdf"}"#);
        let payload = ResultPayload {
            label: "invoice".into(),
            pdf_filename: "a.pdf".into(),
            requested_fields: [("total".to_string(), Some("100".to_string()))]
                .into_iter()
                .collect(),
        };

        let filled = materialize_filled_item(&it, &payload);
        assert_eq!(filled.extraction_schema.len(), 2);
        assert_eq!(filled.extraction_schema["total"], Some("100".into()));
        assert_eq!(filled.extraction_schema["date"], None);
        assert_eq!(filled.pdf_filename.as_deref(), Some("a.pdf"));
        assert!(filled.pdf_path.is_none());

        let empty = empty_filled_item(&it);
        assert!(empty.extraction_schema.values().all(Option::is_none));
    }

    #[test]
    fn load_dataset_reads_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(
            &path,
            r#"[{"label": "invoice", "extraction_schema": {"total": ""}, "pdf_filename": "a.pdf"}]"#,
        )
        .unwrap();

        let items = load_dataset(&path).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].label, "invoice");
    }

    #[test]
    fn load_dataset_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(&path, "{not an array").unwrap();

        assert!(matches!(load_dataset(&path), Err(BatchError::Json(_))));
        assert!(matches!(
            load_dataset(&dir.path().join("absent.json")),
            Err(BatchError::Io(_))
        ));
    }
}
