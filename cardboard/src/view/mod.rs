use crate::error::Result;
use crate::filter::FilterMap;
use crate::schema::{DisplayKind, FieldId};
use crate::sort::SortRule;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ViewId = Uuid;

/// Current version of the persisted filter and sort blobs.
pub const BLOB_VERSION: u32 = 1;

/// A named, persisted bundle of filters, sort rule, grouping field and
/// display kind. Filters and sort are held as encoded blobs and only
/// turned back into live structures when the view is activated.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewMode {
    pub id: ViewId,
    pub name: String,
    pub display: DisplayKind,
    pub grouping_field: Option<FieldId>,
    pub filters_blob: Option<String>,
    pub sort_blob: Option<String>,
}

impl ViewMode {
    pub fn new(name: impl Into<String>, display: DisplayKind, grouping_field: Option<FieldId>) -> Self {
        ViewMode {
            id: Uuid::new_v4(),
            name: name.into(),
            display,
            grouping_field,
            filters_blob: None,
            sort_blob: None,
        }
    }

    /// Live filter mapping. Missing or unreadable blobs yield no filters.
    pub fn filters(&self) -> FilterMap {
        decode_filters(self.filters_blob.as_deref()).or_default(&self.name, "filters")
    }

    /// Live sort rule. Missing or unreadable blobs yield no sort.
    pub fn sort_rule(&self) -> Option<SortRule> {
        decode_sort(self.sort_blob.as_deref()).into_option(&self.name, "sort")
    }

    pub fn set_filters(&mut self, filters: &FilterMap) -> Result<()> {
        self.filters_blob = Some(encode_filters(filters)?);
        Ok(())
    }

    pub fn set_sort_rule(&mut self, rule: Option<&SortRule>) -> Result<()> {
        self.sort_blob = encode_sort(rule)?;
        Ok(())
    }
}

/// Outcome of reading a persisted blob. Keeps "never written" apart from
/// "written but unreadable" so callers can report the latter.
#[derive(Debug, Clone, PartialEq)]
pub enum BlobDecode<T> {
    Absent,
    Decoded(T),
    Corrupt(String),
}

impl<T> BlobDecode<T> {
    fn into_option(self, view: &str, slot: &str) -> Option<T> {
        match self {
            BlobDecode::Decoded(value) => Some(value),
            BlobDecode::Absent => None,
            BlobDecode::Corrupt(reason) => {
                log::warn!("View '{view}' has an unreadable {slot} blob, using none: {reason}");
                None
            }
        }
    }

    fn or_default(self, view: &str, slot: &str) -> T
    where
        T: Default,
    {
        self.into_option(view, slot).unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize)]
struct FilterBlob {
    version: u32,
    filters: FilterMap,
}

#[derive(Serialize, Deserialize)]
struct SortBlob {
    version: u32,
    sort: SortRule,
}

pub fn encode_filters(filters: &FilterMap) -> Result<String> {
    Ok(serde_json::to_string(&FilterBlob {
        version: BLOB_VERSION,
        filters: filters.clone(),
    })?)
}

pub fn decode_filters(blob: Option<&str>) -> BlobDecode<FilterMap> {
    let Some(blob) = blob else {
        return BlobDecode::Absent;
    };
    match serde_json::from_str::<FilterBlob>(blob) {
        Ok(decoded) if decoded.version == BLOB_VERSION => BlobDecode::Decoded(decoded.filters),
        Ok(decoded) => BlobDecode::Corrupt(format!("unsupported version {}", decoded.version)),
        Err(e) => BlobDecode::Corrupt(e.to_string()),
    }
}

/// Encode a sort rule. No rule encodes to no blob.
pub fn encode_sort(rule: Option<&SortRule>) -> Result<Option<String>> {
    match rule {
        Some(rule) => Ok(Some(serde_json::to_string(&SortBlob {
            version: BLOB_VERSION,
            sort: *rule,
        })?)),
        None => Ok(None),
    }
}

pub fn decode_sort(blob: Option<&str>) -> BlobDecode<SortRule> {
    let Some(blob) = blob else {
        return BlobDecode::Absent;
    };
    match serde_json::from_str::<SortBlob>(blob) {
        Ok(decoded) if decoded.version == BLOB_VERSION => BlobDecode::Decoded(decoded.sort),
        Ok(decoded) => BlobDecode::Corrupt(format!("unsupported version {}", decoded.version)),
        Err(e) => BlobDecode::Corrupt(e.to_string()),
    }
}
