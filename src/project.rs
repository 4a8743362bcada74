//! Turns retrieved session data into the rows shown to the user.
//!
//! Two layouts are supported. Cross-sectional gives one row per session-data key
//! and one column per field. Longitudinal gives one row per subject and one column
//! per (visit, field) pair the field selection asks for. Missing documents and
//! missing values show up as `.`; they never fail a projection.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use url::{Url, form_urlencoded};

use crate::error::Result;
use crate::retrieve::SessionData;
use crate::selection::FieldSelection;
use crate::services::{FieldRef, FileLinkResolver, InstrumentDocument};

pub const MISSING: &str = ".";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayMode {
    #[default]
    CrossSectional,
    Longitudinal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Value(String),
    Link { text: String, href: String },
    Missing,
}

impl Cell {
    pub fn text(&self) -> &str {
        match self {
            Cell::Value(text) | Cell::Link { text, .. } => text,
            Cell::Missing => MISSING,
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Cell::Value(text) => serializer.serialize_str(text),
            Cell::Missing => serializer.serialize_str(MISSING),
            Cell::Link { text, href } => {
                let mut link = serializer.serialize_struct("Link", 2)?;
                link.serialize_field("text", text)?;
                link.serialize_field("href", href)?;
                link.end()
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowProjection {
    pub rows: Vec<Vec<Cell>>,
    pub row_identifiers: Vec<String>,
    pub column_headers: Vec<String>,
    pub download_links: Vec<String>,
}

impl RowProjection {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// `file/<document id>/<url encoded reference>`
pub fn download_path(document_id: &str, file: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(file.as_bytes()).collect();
    format!("file/{}/{}", document_id, encoded)
}

// ------------- Links -------------
/// Resolves file references through the `get_file.php` endpoint under a base url.
#[derive(Debug, Clone)]
pub struct BaseUrlLinks {
    endpoint: Url,
}

impl BaseUrlLinks {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{}/", base_url))?
        };
        Ok(Self { endpoint: base.join("mri/jiv/get_file.php")? })
    }
}

impl FileLinkResolver for BaseUrlLinks {
    fn href(&self, file: &str) -> String {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("file", file);
        url.to_string()
    }
}

// ------------- Projection -------------
pub struct RowProjector {
    links: Arc<dyn FileLinkResolver>,
    // longitudinal columns follow the study's visit order
    visit_order: Vec<String>,
}

impl RowProjector {
    pub fn new(links: Arc<dyn FileLinkResolver>, visit_order: Vec<String>) -> Self {
        Self { links, visit_order }
    }
    pub fn set_visit_order(&mut self, visit_order: Vec<String>) {
        self.visit_order = visit_order;
    }

    pub fn project(
        &self,
        data: &SessionData,
        fields: &[FieldRef],
        selection: &FieldSelection,
        mode: DisplayMode,
    ) -> RowProjection {
        let mut fields = fields.to_vec();
        fields.sort_by_key(|field| field.to_string());
        fields.dedup();
        match mode {
            DisplayMode::CrossSectional => self.cross_sectional(data, &fields, selection),
            DisplayMode::Longitudinal => self.longitudinal(data, &fields, selection),
        }
    }

    fn cross_sectional(&self, data: &SessionData, fields: &[FieldRef], selection: &FieldSelection) -> RowProjection {
        let mut projection = RowProjection {
            column_headers: fields.iter().map(FieldRef::to_string).collect(),
            ..RowProjection::default()
        };
        for (session, documents) in data {
            let row = fields
                .iter()
                .map(|field| {
                    self.cell(
                        documents.get(&field.instrument),
                        field,
                        selection.is_downloadable(field),
                        &mut projection.download_links,
                    )
                })
                .collect();
            projection.rows.push(row);
            projection.row_identifiers.push(session.clone());
        }
        projection
    }

    fn longitudinal(&self, data: &SessionData, fields: &[FieldRef], selection: &FieldSelection) -> RowProjection {
        let mut visits: Vec<&str> = data
            .keys()
            .filter_map(|key| key.split_once(',').map(|(_, visit)| visit))
            .collect::<BTreeSet<&str>>()
            .into_iter()
            .collect();
        visits.sort_by_key(|visit| {
            (self.visit_order.iter().position(|known| known == visit).unwrap_or(usize::MAX), *visit)
        });
        let mut subjects: Vec<&str> = Vec::new();
        for key in data.keys() {
            let subject = key.split_once(',').map_or(key.as_str(), |(subject, _)| subject);
            if !subjects.contains(&subject) {
                subjects.push(subject);
            }
        }
        let columns: Vec<(&str, &FieldRef)> = fields
            .iter()
            .flat_map(|field| visits.iter().map(move |visit| (*visit, field)))
            .filter(|(visit, field)| selection.has_visit(field, visit))
            .collect();

        let mut projection = RowProjection {
            column_headers: columns.iter().map(|(visit, field)| format!("{} {}", visit, field)).collect(),
            ..RowProjection::default()
        };
        for subject in subjects {
            let mut row = Vec::with_capacity(columns.len());
            for (visit, field) in &columns {
                let document = data
                    .get(&format!("{},{}", subject, visit))
                    .and_then(|documents| documents.get(&field.instrument));
                row.push(self.cell(document, field, selection.is_downloadable(field), &mut projection.download_links));
            }
            projection.rows.push(row);
            projection.row_identifiers.push(subject.to_owned());
        }
        projection
    }

    fn cell(
        &self,
        document: Option<&InstrumentDocument>,
        field: &FieldRef,
        downloadable: bool,
        download_links: &mut Vec<String>,
    ) -> Cell {
        let Some(document) = document else {
            return Cell::Missing;
        };
        let Some(text) = document.text(&field.field) else {
            return Cell::Missing;
        };
        if downloadable && !text.is_empty() {
            download_links.push(download_path(&document.id, &text));
            Cell::Link { href: self.links.href(&text), text }
        } else {
            Cell::Value(text)
        }
    }
}
