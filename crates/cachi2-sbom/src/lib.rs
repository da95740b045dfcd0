//! SBOM assembly (§4.4).
//!
//! The Dispatcher collects one [`cachi2_types::Component`] set per resolved
//! package and hands them all to [`SbomBuilder`], which is the one place
//! that:
//! - merges components sharing the same `(name, version, purl)` key,
//!   unioning their property sets (the same dependency can be discovered
//!   by more than one resolver, e.g. a `file:` npm dependency that is also
//!   a gomod replace target),
//! - canonicalizes every purl through the `packageurl` crate so two
//!   differently-percent-encoded spellings of the same coordinate collapse
//!   to one component,
//! - sorts the result deterministically (by purl, then name, then version)
//!   so the emitted document doesn't depend on resolver scheduling order,
//! - renders the merged set as CycloneDX 1.5 or SPDX 2.3 JSON.

use std::collections::BTreeMap;
use std::str::FromStr;

use cachi2_types::{Component, ComponentType, SbomFormat};
use chrono::{DateTime, Utc};
use packageurl::PackageUrl;
use serde::Serialize;

type ComponentKey = (String, Option<String>, String);

/// Accumulates components across every resolved package and produces a
/// deduplicated, deterministically ordered SBOM document.
#[derive(Debug, Default)]
pub struct SbomBuilder {
    components: BTreeMap<ComponentKey, Component>,
}

impl SbomBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a component, merging it with any existing component sharing
    /// the same `(name, version, purl)` key by unioning their properties.
    pub fn add(&mut self, mut component: Component) {
        component.purl = canonicalize_purl(&component.purl);
        let key = component.key();
        match self.components.get_mut(&key) {
            Some(existing) => {
                existing.properties.extend(component.properties);
            }
            None => {
                self.components.insert(key, component);
            }
        }
    }

    pub fn extend(&mut self, components: impl IntoIterator<Item = Component>) {
        for component in components {
            self.add(component);
        }
    }

    /// Deterministically sorted components: by purl, then name, then
    /// version. `BTreeMap` keyed on `(name, version, purl)` does not sort
    /// this way, hence the explicit re-sort here.
    pub fn components(&self) -> Vec<&Component> {
        let mut components: Vec<&Component> = self.components.values().collect();
        components.sort_by(|a, b| {
            a.purl
                .cmp(&b.purl)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.version.cmp(&b.version))
        });
        components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Renders the accumulated components in the requested format.
    pub fn render(&self, format: SbomFormat, generated_at: DateTime<Utc>) -> String {
        match format {
            SbomFormat::CycloneDx => {
                serde_json::to_string_pretty(&self.to_cyclonedx(generated_at))
                    .expect("cyclonedx document is always serializable")
            }
            SbomFormat::Spdx => serde_json::to_string_pretty(&self.to_spdx(generated_at))
                .expect("spdx document is always serializable"),
        }
    }

    pub fn to_cyclonedx(&self, generated_at: DateTime<Utc>) -> CycloneDxDocument {
        CycloneDxDocument {
            bom_format: "CycloneDX",
            spec_version: "1.5",
            version: 1,
            metadata: CycloneDxMetadata {
                timestamp: generated_at,
                tools: vec![CycloneDxTool {
                    name: "cachi2",
                    version: env!("CARGO_PKG_VERSION"),
                }],
            },
            components: self.components().into_iter().map(CycloneDxComponent::from).collect(),
        }
    }

    pub fn to_spdx(&self, generated_at: DateTime<Utc>) -> SpdxDocument {
        let packages = self
            .components()
            .into_iter()
            .enumerate()
            .map(|(index, component)| SpdxPackage::from_component(component, index))
            .collect();

        SpdxDocument {
            spdx_version: "SPDX-2.3",
            data_license: "CC0-1.0",
            spdx_id: "SPDXRef-DOCUMENT",
            name: "cachi2-sbom",
            document_namespace: format!("https://cachi2.local/sbom-{}", generated_at.timestamp()),
            creation_info: SpdxCreationInfo {
                created: generated_at,
                creators: vec![format!("Tool: cachi2-{}", env!("CARGO_PKG_VERSION"))],
            },
            packages,
        }
    }
}

/// Canonicalizes a purl through `packageurl`'s parser. Falls back to the
/// input unchanged if it doesn't parse (a malformed purl is still useful
/// for debugging; silently dropping the component would hide a bug).
fn canonicalize_purl(purl: &str) -> String {
    PackageUrl::from_str(purl)
        .map(|parsed| parsed.to_string())
        .unwrap_or_else(|_| purl.to_string())
}

#[derive(Debug, Serialize)]
pub struct CycloneDxDocument {
    #[serde(rename = "bomFormat")]
    pub bom_format: &'static str,
    #[serde(rename = "specVersion")]
    pub spec_version: &'static str,
    pub version: u32,
    pub metadata: CycloneDxMetadata,
    pub components: Vec<CycloneDxComponent>,
}

#[derive(Debug, Serialize)]
pub struct CycloneDxMetadata {
    pub timestamp: DateTime<Utc>,
    pub tools: Vec<CycloneDxTool>,
}

#[derive(Debug, Serialize)]
pub struct CycloneDxTool {
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CycloneDxComponent {
    #[serde(rename = "type")]
    pub component_type: &'static str,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub purl: String,
    #[serde(rename = "bom-ref")]
    pub bom_ref: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<CycloneDxProperty>,
    #[serde(rename = "externalReferences", skip_serializing_if = "Vec::is_empty")]
    pub external_references: Vec<CycloneDxExternalReference>,
}

#[derive(Debug, Serialize)]
pub struct CycloneDxProperty {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct CycloneDxExternalReference {
    #[serde(rename = "type")]
    pub reference_type: &'static str,
    pub url: String,
}

/// A component carries this property (see `cachi2-core`'s generic resolver)
/// when the download it was produced from should appear as an
/// `externalReferences[type=distribution]` entry.
const DISTRIBUTION_URL_PROPERTY: &str = "cachi2:distribution_url";

impl From<&Component> for CycloneDxComponent {
    fn from(component: &Component) -> Self {
        let external_references = component
            .properties
            .iter()
            .filter(|(name, _)| name == DISTRIBUTION_URL_PROPERTY)
            .map(|(_, url)| CycloneDxExternalReference { reference_type: "distribution", url: url.clone() })
            .collect();

        Self {
            component_type: match component.component_type {
                ComponentType::Library => "library",
                ComponentType::File => "file",
                ComponentType::Container => "container",
            },
            name: component.name.clone(),
            version: component.version.clone(),
            purl: component.purl.clone(),
            bom_ref: component.purl.clone(),
            properties: component
                .properties
                .iter()
                .map(|(name, value)| CycloneDxProperty {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            external_references,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SpdxDocument {
    #[serde(rename = "spdxVersion")]
    pub spdx_version: &'static str,
    #[serde(rename = "dataLicense")]
    pub data_license: &'static str,
    #[serde(rename = "SPDXID")]
    pub spdx_id: &'static str,
    pub name: &'static str,
    #[serde(rename = "documentNamespace")]
    pub document_namespace: String,
    #[serde(rename = "creationInfo")]
    pub creation_info: SpdxCreationInfo,
    pub packages: Vec<SpdxPackage>,
}

#[derive(Debug, Serialize)]
pub struct SpdxCreationInfo {
    pub created: DateTime<Utc>,
    pub creators: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SpdxPackage {
    #[serde(rename = "SPDXID")]
    pub spdx_id: String,
    pub name: String,
    #[serde(rename = "versionInfo", skip_serializing_if = "Option::is_none")]
    pub version_info: Option<String>,
    #[serde(rename = "downloadLocation")]
    pub download_location: &'static str,
    #[serde(rename = "externalRefs")]
    pub external_refs: Vec<SpdxExternalRef>,
}

#[derive(Debug, Serialize)]
pub struct SpdxExternalRef {
    #[serde(rename = "referenceCategory")]
    pub reference_category: &'static str,
    #[serde(rename = "referenceType")]
    pub reference_type: &'static str,
    #[serde(rename = "referenceLocator")]
    pub reference_locator: String,
}

impl SpdxPackage {
    fn from_component(component: &Component, index: usize) -> Self {
        Self {
            spdx_id: format!("SPDXRef-Package-{index}"),
            name: component.name.clone(),
            version_info: component.version.clone(),
            download_location: "NOASSERTION",
            external_refs: vec![SpdxExternalRef {
                reference_category: "PACKAGE-MANAGER",
                reference_type: "purl",
                reference_locator: component.purl.clone(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachi2_types::FoundBy;
    use std::collections::BTreeSet;

    fn component(name: &str, version: &str, purl: &str) -> Component {
        Component::new(name, Some(version.into()), purl, ComponentType::Library, FoundBy::Cachi2)
    }

    #[test]
    fn merges_components_sharing_the_same_key() {
        let mut builder = SbomBuilder::new();
        builder.add(
            component("foo", "1.0.0", "pkg:pypi/foo@1.0.0")
                .with_property("cachi2:found_by", "cachi2:pip"),
        );
        builder.add(
            component("foo", "1.0.0", "pkg:pypi/foo@1.0.0")
                .with_property("cachi2:missing_hash:in_file", "requirements.txt"),
        );

        assert_eq!(builder.len(), 1);
        let merged = &builder.components()[0];
        assert_eq!(merged.properties.len(), 2);
    }

    #[test]
    fn keeps_distinct_versions_separate() {
        let mut builder = SbomBuilder::new();
        builder.add(component("foo", "1.0.0", "pkg:pypi/foo@1.0.0"));
        builder.add(component("foo", "2.0.0", "pkg:pypi/foo@2.0.0"));
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn components_are_sorted_by_purl() {
        let mut builder = SbomBuilder::new();
        builder.add(component("zeta", "1.0.0", "pkg:npm/zeta@1.0.0"));
        builder.add(component("alpha", "1.0.0", "pkg:npm/alpha@1.0.0"));
        let sorted = builder.components();
        assert_eq!(sorted[0].name, "alpha");
        assert_eq!(sorted[1].name, "zeta");
    }

    #[test]
    fn cyclonedx_render_includes_purl_and_tool() {
        let mut builder = SbomBuilder::new();
        builder.add(component("foo", "1.0.0", "pkg:pypi/foo@1.0.0"));
        let doc = builder.to_cyclonedx(Utc::now());
        assert_eq!(doc.bom_format, "CycloneDX");
        assert_eq!(doc.components.len(), 1);
        assert_eq!(doc.components[0].purl, "pkg:pypi/foo@1.0.0");
    }

    #[test]
    fn spdx_render_includes_purl_external_ref() {
        let mut builder = SbomBuilder::new();
        builder.add(component("foo", "1.0.0", "pkg:pypi/foo@1.0.0"));
        let doc = builder.to_spdx(Utc::now());
        assert_eq!(doc.packages.len(), 1);
        assert_eq!(doc.packages[0].external_refs[0].reference_locator, "pkg:pypi/foo@1.0.0");
    }

    #[test]
    fn distribution_url_property_becomes_external_reference() {
        let mut builder = SbomBuilder::new();
        builder.add(
            component("foo", "1.0.0", "pkg:generic/foo.tar.gz")
                .with_property("cachi2:distribution_url", "https://example.com/foo.tar.gz"),
        );
        let doc = builder.to_cyclonedx(Utc::now());
        assert_eq!(doc.components[0].external_references.len(), 1);
        assert_eq!(doc.components[0].external_references[0].url, "https://example.com/foo.tar.gz");
    }

    #[test]
    fn empty_properties_set_is_empty() {
        let c = component("foo", "1.0.0", "pkg:pypi/foo@1.0.0");
        assert_eq!(c.properties, BTreeSet::new());
    }
}
