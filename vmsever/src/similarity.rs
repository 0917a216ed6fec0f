//! Weighted set similarity between two package profiles.
//!
//! Packages are weighted by install size, normalized by the largest package
//! in the comparison, so agreeing on one large service counts for more than
//! agreeing on a handful of tiny libraries.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info};

use crate::descriptor::{arch_compatible, MasterDescriptor, VmiDescriptor};
use crate::graph::PackageInfo;

/// Anything with a package graph and a set of main-service roots can take
/// part in a similarity comparison.
pub(crate) trait PackageProfile {
    fn label(&self) -> &str;
    fn node_data(&self) -> HashMap<&str, &PackageInfo>;
    fn main_service_closure(&self) -> HashMap<String, PackageInfo>;
}

impl PackageProfile for VmiDescriptor {
    fn label(&self) -> &str {
        &self.name
    }

    fn node_data(&self) -> HashMap<&str, &PackageInfo> {
        self.base.graph.node_data()
    }

    fn main_service_closure(&self) -> HashMap<String, PackageInfo> {
        self.base.graph.closure(&self.main_services)
    }
}

impl PackageProfile for MasterDescriptor {
    fn label(&self) -> &str {
        self.base.image_path.to_str().unwrap_or("master")
    }

    fn node_data(&self) -> HashMap<&str, &PackageInfo> {
        self.base.graph.node_data()
    }

    fn main_service_closure(&self) -> HashMap<String, PackageInfo> {
        let roots: Vec<String> = self.main_services.iter().cloned().collect();
        self.base.graph.closure(&roots)
    }
}

/// Similarity in `[0, 1]`. With `main_services_only` the comparison is
/// restricted to the union of both main-service closures; otherwise the full
/// package sets are compared. An empty comparison yields 0.
pub(crate) fn weighted_similarity(
    a: &dyn PackageProfile,
    b: &dyn PackageProfile,
    main_services_only: bool,
) -> f64 {
    let a_nodes = a.node_data();
    let b_nodes = b.node_data();

    let candidates: BTreeSet<String> = if main_services_only {
        a.main_service_closure()
            .into_keys()
            .chain(b.main_service_closure().into_keys())
            .collect()
    } else {
        a_nodes
            .keys()
            .chain(b_nodes.keys())
            .map(|name| name.to_string())
            .collect()
    };

    // the largest package in the comparison normalizes all weights
    let mut max_size = 0u64;
    for name in &candidates {
        if let Some(info) = a_nodes.get(name.as_str()) {
            max_size = max_size.max(info.size);
        }
        if let Some(info) = b_nodes.get(name.as_str()) {
            max_size = max_size.max(info.size);
        }
    }
    if max_size == 0 {
        return 0.0;
    }
    let scale = max_size as f64;

    let mut denominator = 0.0;
    for name in &candidates {
        let size = match (a_nodes.get(name.as_str()), b_nodes.get(name.as_str())) {
            (Some(x), Some(y)) => x.size.max(y.size),
            (Some(x), None) => x.size,
            (None, Some(y)) => y.size,
            (None, None) => 0,
        };
        denominator += size as f64 / scale;
    }
    if denominator == 0.0 {
        return 0.0;
    }

    let mut matches = 0usize;
    let mut numerator = 0.0;
    for name in &candidates {
        let (Some(x), Some(y)) = (a_nodes.get(name.as_str()), b_nodes.get(name.as_str())) else {
            continue;
        };
        if x.version == y.version && arch_compatible(&x.architecture, &y.architecture) {
            matches += 1;
            numerator += x.size.max(y.size) as f64 / scale;
        }
    }

    let similarity = numerator / denominator;
    debug!(
        "weighted comparison of '{}' ({} packages) and '{}' ({} packages): \
         {} of {} candidates match, similarity = {:.3}/{:.3} = {:.3}",
        a.label(),
        a_nodes.len(),
        b.label(),
        b_nodes.len(),
        matches,
        candidates.len(),
        numerator,
        denominator,
        similarity,
    );
    similarity
}

/// Pairwise similarities between a set of VMIs. The relation is symmetric
/// and a VMI's similarity to itself is undefined rather than 1, so averages
/// over a row exclude the self-pair.
#[derive(Debug)]
pub(crate) struct SimilarityMatrix {
    pub(crate) names: Vec<String>,
    pub(crate) values: BTreeMap<String, BTreeMap<String, Option<f64>>>,
}

pub(crate) fn many_to_many(
    descriptors: &[VmiDescriptor],
    main_services_only: bool,
) -> SimilarityMatrix {
    info!(
        "calculating similarities between each of {} VMIs{}",
        descriptors.len(),
        if main_services_only {
            " with respect to main services"
        } else {
            ""
        }
    );
    let mut values: BTreeMap<String, BTreeMap<String, Option<f64>>> = BTreeMap::new();
    for (i, a) in descriptors.iter().enumerate() {
        info!("similarities for VMI '{}':", a.name);
        for (j, b) in descriptors.iter().enumerate() {
            let similarity = if i == j {
                None
            } else {
                let similarity = weighted_similarity(a, b, main_services_only);
                info!("\t{:0.2} similarity to VMI '{}'", similarity, b.name);
                Some(similarity)
            };
            values
                .entry(a.name.clone())
                .or_default()
                .insert(b.name.clone(), similarity);
        }
    }
    SimilarityMatrix {
        names: descriptors.iter().map(|d| d.name.clone()).collect(),
        values,
    }
}
