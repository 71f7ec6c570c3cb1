//! Askama-backed KML rendering for fireperim.
//!
//! Templates are rendered with escaping disabled: the description blocks are
//! literal HTML inside CDATA, and element text that is not CDATA is escaped
//! here before it reaches a template.

use askama::Template;
use fireperim_core::{
    format_pacific, RawFeature, ReducedFeatureSet, Ring, ATTR_AREA_ACRES, ATTR_DATE_CURRENT,
    ATTR_DESCRIPTION, ATTR_INCIDENT_NAME, ATTR_INCIDENT_NUMBER, ATTR_OBJECT_ID, ATTR_SOURCE,
};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "fireperim-kml";

pub const DEFAULT_DOCUMENT_NAME: &str = "Cal_Fire_Intel_Boundary.kml";

pub const VIEWER_URL: &str =
    "https://www.arcgis.com/apps/mapviewer/index.html?layers=025fb2ea05f14890b2b11573341b5b18";

pub const PERIMETER_STYLE_ID: &str = "-1073741762";
pub const PLACEHOLDER_STYLE_ID: &str = "-728573378";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template rendering failed: {0}")]
    Template(#[from] askama::Error),
}

/// Line/label styling shared by every perimeter placemark in a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolygonStyle {
    pub id: &'static str,
    pub line_color: &'static str,
    pub line_width: u32,
    pub fill: bool,
    pub outline: bool,
    pub label_color: &'static str,
}

pub const PERIMETER_STYLE: PolygonStyle = PolygonStyle {
    id: PERIMETER_STYLE_ID,
    line_color: "ffa9e600",
    line_width: 2,
    fill: false,
    outline: true,
    label_color: "ffa9e600",
};

/// The eight values shown in a placemark's description table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataFields {
    pub source: String,
    pub mission: String,
    pub incident_name: String,
    pub incident_number: String,
    pub area_acres: String,
    pub description: String,
    pub date: String,
    pub object_id: String,
}

impl MetadataFields {
    pub fn from_feature(feature: &RawFeature) -> Self {
        Self {
            source: feature.attribute_text(ATTR_SOURCE),
            mission: feature.mission().unwrap_or_default(),
            incident_name: feature.attribute_text(ATTR_INCIDENT_NAME),
            incident_number: feature.attribute_text(ATTR_INCIDENT_NUMBER),
            area_acres: feature.attribute_text(ATTR_AREA_ACRES),
            description: feature.attribute_text(ATTR_DESCRIPTION),
            date: format_pacific(feature.attribute(ATTR_DATE_CURRENT)),
            object_id: feature.attribute_text(ATTR_OBJECT_ID),
        }
    }

    pub fn placeholder() -> Self {
        Self {
            source: "CAL FIRE INTEL FLIGHT DATA".into(),
            mission: "N/A".into(),
            incident_name: "N/A".into(),
            incident_number: "NULL".into(),
            area_acres: "NULL".into(),
            description: "N/A".into(),
            date: "NULL".into(),
            object_id: "NULL".into(),
        }
    }

    fn cdata_safe(&self) -> Self {
        Self {
            source: cdata_safe(&self.source),
            mission: cdata_safe(&self.mission),
            incident_name: cdata_safe(&self.incident_name),
            incident_number: cdata_safe(&self.incident_number),
            area_acres: cdata_safe(&self.area_acres),
            description: cdata_safe(&self.description),
            date: cdata_safe(&self.date),
            object_id: cdata_safe(&self.object_id),
        }
    }
}

/// One placemark: the outer ring of a feature or one of its inner rings
/// drawn as a separate filled shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderableShape {
    pub id: String,
    pub name: String,
    pub visible: bool,
    pub style_id: String,
    pub description: String,
    pub coordinates: String,
}

#[derive(Template)]
#[template(path = "description.html", escape = "none")]
struct DescriptionTemplate<'a> {
    fields: &'a MetadataFields,
    viewer_url: &'a str,
}

#[derive(Template)]
#[template(path = "document.kml", escape = "none")]
struct DocumentTemplate<'a> {
    name: &'a str,
    style: &'a PolygonStyle,
    shapes: &'a [RenderableShape],
}

#[derive(Template)]
#[template(path = "placeholder.kml", escape = "none")]
struct PlaceholderTemplate<'a> {
    name: &'a str,
    style_id: &'a str,
    description: &'a str,
}

/// A fully assembled document for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmlDocument {
    pub name: String,
    pub style: PolygonStyle,
    pub shapes: Vec<RenderableShape>,
}

impl KmlDocument {
    pub fn render(&self) -> Result<String, RenderError> {
        let name = xml_escape(&self.name);
        Ok(DocumentTemplate {
            name: &name,
            style: &self.style,
            shapes: &self.shapes,
        }
        .render()?)
    }
}

pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Split any `]]>` so a substituted value cannot close the CDATA section.
fn cdata_safe(text: &str) -> String {
    text.replace("]]>", "]]]]><![CDATA[>")
}

/// `x,y,0` triples, space separated, in ring order. Integral values keep
/// their `.0`.
pub fn ring_coordinates(ring: &Ring) -> String {
    ring.iter()
        .filter(|p| p.len() >= 2)
        .map(|p| format!("{:?},{:?},0", p[0], p[1]))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct KmlRenderer {
    document_name: String,
}

impl Default for KmlRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_DOCUMENT_NAME)
    }
}

impl KmlRenderer {
    pub fn new(document_name: impl Into<String>) -> Self {
        Self {
            document_name: document_name.into(),
        }
    }

    pub fn description_block(&self, fields: &MetadataFields) -> Result<String, RenderError> {
        let fields = fields.cdata_safe();
        let html = DescriptionTemplate {
            fields: &fields,
            viewer_url: VIEWER_URL,
        }
        .render()?;
        Ok(html.trim_end().to_string())
    }

    /// Decompose a feature's polygon: ring 0 becomes the outer shape keyed by
    /// `OBJECTID`, ring `i >= 1` becomes `{OBJECTID}_{i}` named
    /// `{mission}_ring_{i}`. Features without an id or rings yield nothing.
    pub fn shapes_for(&self, feature: &RawFeature) -> Result<Vec<RenderableShape>, RenderError> {
        let Some(object_id) = feature.object_id() else {
            warn!(mission = ?feature.mission(), "feature without OBJECTID not rendered");
            return Ok(Vec::new());
        };
        let rings = feature.rings();
        if rings.is_empty() {
            warn!(object_id, "feature has no polygon rings; not rendered");
            return Ok(Vec::new());
        }

        let mission = xml_escape(&feature.mission().unwrap_or_default());
        let description = self.description_block(&MetadataFields::from_feature(feature))?;

        Ok(rings
            .iter()
            .enumerate()
            .map(|(index, ring)| {
                let (id, name) = if index == 0 {
                    (object_id.to_string(), mission.clone())
                } else {
                    (
                        format!("{object_id}_{index}"),
                        format!("{mission}_ring_{index}"),
                    )
                };
                RenderableShape {
                    id,
                    name,
                    visible: true,
                    style_id: PERIMETER_STYLE.id.to_string(),
                    description: description.clone(),
                    coordinates: ring_coordinates(ring),
                }
            })
            .collect())
    }

    pub fn build(&self, features: &ReducedFeatureSet) -> Result<KmlDocument, RenderError> {
        let mut shapes = Vec::new();
        for (_mission, feature) in features.iter() {
            shapes.extend(self.shapes_for(feature)?);
        }
        Ok(KmlDocument {
            name: self.document_name.clone(),
            style: PERIMETER_STYLE,
            shapes,
        })
    }

    /// Render the cycle's document; an empty set renders the placeholder.
    pub fn render(&self, features: &ReducedFeatureSet) -> Result<String, RenderError> {
        if features.is_empty() {
            return self.render_placeholder();
        }
        self.build(features)?.render()
    }

    pub fn render_placeholder(&self) -> Result<String, RenderError> {
        let description = self.description_block(&MetadataFields::placeholder())?;
        let name = xml_escape(&self.document_name);
        Ok(PlaceholderTemplate {
            name: &name,
            style_id: PLACEHOLDER_STYLE_ID,
            description: &description,
        }
        .render()?)
    }
}
