//! The Dispatcher (§4.13).
//!
//! Resolves every package in a [`Request`] concurrently, under a bounded
//! rayon thread pool sized by `flags.fetch_concurrency` (mirroring the
//! fetch primitive's own pool sizing in `cachi2-checksum`), then merges the
//! results: one [`SbomBuilder`] across every resolver's components, one
//! flat env list, one flat file-edit list.
//!
//! Merge is commutative (§8 testable property 3): two resolvers naming the
//! same `(name, version, purl)` union their properties; two resolvers
//! naming the same purl with a *different* version or component type are a
//! genuine conflict and fail the request rather than silently picking one.

use std::collections::HashMap;

use cachi2_sbom::SbomBuilder;
use cachi2_types::{Component, EnvVar, FileEdit, PackageManager, ResolverResult};
use std::path::PathBuf;

use crate::diagnostics::EventLog;
use crate::error::Cachi2Error;
use crate::resolvers::{self, ResolveContext};
use cachi2_types::Request;

/// Everything the Dispatcher produced for a [`Request`], before rendering.
pub struct DispatchResult {
    pub sbom: SbomBuilder,
    pub env: Vec<EnvVar>,
    pub file_edits: Vec<FileEdit>,
    pub package_summaries: Vec<(PackageManager, PathBuf, usize)>,
}

pub fn dispatch_all(request: &Request, events: &EventLog) -> Result<DispatchResult, Cachi2Error> {
    let ctx = ResolveContext::new(request, events);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(request.flags.fetch_concurrency.max(1))
        .build()
        .expect("building a bounded rayon pool should never fail");

    let results: Vec<Result<ResolverResult, Cachi2Error>> = pool.install(|| {
        use rayon::prelude::*;
        request.packages.par_iter().map(|input| resolvers::dispatch(&ctx, input)).collect()
    });

    let mut all_components: Vec<Component> = Vec::new();
    let mut env = Vec::new();
    let mut file_edits = Vec::new();
    let mut package_summaries = Vec::new();

    for (input, result) in request.packages.iter().zip(results) {
        let resolved = result?;
        package_summaries.push((input.manager(), input.path().as_path().to_path_buf(), resolved.components.len()));
        all_components.extend(resolved.components);
        env.extend(resolved.env);
        file_edits.extend(resolved.file_edits);
    }

    detect_conflicts(&all_components)?;

    let mut sbom = SbomBuilder::new();
    sbom.extend(all_components);

    Ok(DispatchResult { sbom, env, file_edits, package_summaries })
}

/// Two components sharing a purl but disagreeing on version or component
/// type can't be merged into one SBOM entry; `SbomBuilder::add` would
/// silently keep whichever arrived first, which hides a real resolution
/// conflict, so this runs before components ever reach the builder.
fn detect_conflicts(components: &[Component]) -> Result<(), Cachi2Error> {
    let mut seen: HashMap<&str, &Component> = HashMap::new();
    for component in components {
        match seen.get(component.purl.as_str()) {
            Some(existing) if existing.version != component.version || existing.component_type != component.component_type => {
                return Err(Cachi2Error::Input {
                    message: format!(
                        "conflicting resolution for `{}`: {:?}/{:?} vs {:?}/{:?}",
                        component.purl, existing.version, existing.component_type, component.version, component.component_type
                    ),
                    value: component.purl.clone(),
                });
            }
            _ => {
                seen.insert(&component.purl, component);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachi2_types::{ComponentType, FoundBy};

    fn component(version: &str, purl: &str) -> Component {
        Component::new("foo", Some(version.to_string()), purl, ComponentType::Library, FoundBy::Cachi2)
    }

    #[test]
    fn no_conflict_for_identical_components() {
        let components = vec![component("1.0.0", "pkg:pypi/foo@1.0.0"), component("1.0.0", "pkg:pypi/foo@1.0.0")];
        assert!(detect_conflicts(&components).is_ok());
    }

    #[test]
    fn conflict_for_differing_versions_sharing_a_purl() {
        let mut a = component("1.0.0", "pkg:pypi/foo@1.0.0");
        let b = component("2.0.0", "pkg:pypi/foo@1.0.0");
        a.purl = "pkg:pypi/foo@1.0.0".to_string();
        let components = vec![a, b];
        assert!(detect_conflicts(&components).is_err());
    }

    #[test]
    fn merge_is_commutative_over_property_sets() {
        let a = component("1.0.0", "pkg:pypi/foo@1.0.0").with_property("x", "1");
        let b = component("1.0.0", "pkg:pypi/foo@1.0.0").with_property("y", "2");

        let mut forward = SbomBuilder::new();
        forward.add(a.clone());
        forward.add(b.clone());

        let mut backward = SbomBuilder::new();
        backward.add(b);
        backward.add(a);

        assert_eq!(forward.components()[0].properties, backward.components()[0].properties);
    }
}
