//! Readium Web Publication manifest

use serde::Serialize;

use crate::error::PublicationError;

pub const WEBPUB_CONTEXT: &str = "https://readium.org/webpub-manifest/context.jsonld";
pub const WEBPUB_MEDIA_TYPE: &str = "application/webpub+json";
pub const MANIFEST_HREF: &str = "manifest.json";

/// A link to a resource, relative to the manifest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub href: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel: Option<String>,
}

impl Link {
    pub fn new(href: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            media_type: Some(media_type.into()),
            rel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conforms_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(rename = "@context")]
    pub context: String,
    pub metadata: Metadata,
    pub links: Vec<Link>,
    pub reading_order: Vec<Link>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Link>,
}

impl Manifest {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            context: WEBPUB_CONTEXT.to_string(),
            metadata: Metadata {
                title: title.into(),
                conforms_to: None,
            },
            links: vec![Link {
                href: MANIFEST_HREF.to_string(),
                media_type: Some(WEBPUB_MEDIA_TYPE.to_string()),
                rel: Some("self".to_string()),
            }],
            reading_order: Vec::new(),
            resources: Vec::new(),
        }
    }

    pub fn conforms_to(mut self, profile: &str) -> Self {
        self.metadata.conforms_to = Some(profile.to_string());
        self
    }

    /// Serialize, indenting with `indent` when given
    pub fn to_json(&self, indent: Option<&str>) -> Result<Vec<u8>, PublicationError> {
        let result = match indent {
            Some(indent) => {
                let mut out = Vec::new();
                let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
                let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
                self.serialize(&mut serializer).map(|_| out)
            }
            None => serde_json::to_vec(self),
        };
        result.map_err(|e| PublicationError::Internal(format!("failed to serialize manifest: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_shape() {
        let mut manifest = Manifest::new("Moby Dick");
        manifest.reading_order.push(Link::new("ch1.xhtml", "application/xhtml+xml"));

        let json: serde_json::Value = serde_json::from_slice(&manifest.to_json(None).unwrap()).unwrap();
        assert_eq!(json["@context"], WEBPUB_CONTEXT);
        assert_eq!(json["metadata"]["title"], "Moby Dick");
        assert_eq!(json["links"][0]["rel"], "self");
        assert_eq!(json["links"][0]["type"], WEBPUB_MEDIA_TYPE);
        assert_eq!(json["readingOrder"][0]["href"], "ch1.xhtml");
        assert!(json.get("resources").is_none());
        assert!(json["metadata"].get("conformsTo").is_none());
    }

    #[test]
    fn test_indent() {
        let manifest = Manifest::new("A");
        let compact = String::from_utf8(manifest.to_json(None).unwrap()).unwrap();
        assert!(!compact.contains('\n'));

        let pretty = String::from_utf8(manifest.to_json(Some("\t")).unwrap()).unwrap();
        assert!(pretty.contains("\n\t\"metadata\""));
    }
}
