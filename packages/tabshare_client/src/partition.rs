//! Partitions of a tab set into clusters.
//!
//! Every function here returns a full partition: each input tab lands in
//! exactly one cluster, unplaceable tabs go to [`OTHER_CLUSTER`].

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tabshare_protocol::{Cluster, SharedTab};

pub const OTHER_CLUSTER: &str = "Other";
const OTHER_THEME: &str = "Tabs that did not fit any other group";

/// One tab as submitted to the classification service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabDescriptor {
    pub index: usize,
    pub title: String,
    pub url: String,
}

pub fn describe(tabs: &[SharedTab]) -> Vec<TabDescriptor> {
    tabs.iter()
        .enumerate()
        .map(|(index, t)| TabDescriptor {
            index,
            title: t.title.clone(),
            url: t.url.clone(),
        })
        .collect()
}

/// Raw classification response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassificationResponse {
    #[serde(default)]
    pub clusters: Vec<RawCluster>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCluster {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub theme: String,
    /// Indices into the submitted tab list. Kept loose: anything that is not
    /// an in-range integer is routed to the default cluster.
    #[serde(default)]
    pub tabs: Vec<serde_json::Value>,
}

fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

/// Deterministic grouping by URL host, in first-seen order.
pub fn fallback_partition(tabs: &[SharedTab]) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = Vec::new();
    let mut by_host: HashMap<String, usize> = HashMap::new();
    let mut other = Vec::new();

    for tab in tabs {
        let Some(host) = host_of(&tab.url) else {
            other.push(tab.clone());
            continue;
        };
        let slot = *by_host.entry(host.clone()).or_insert_with(|| {
            clusters.push(Cluster {
                theme: format!("Pages from {host}"),
                name: host,
                tabs: Vec::new(),
            });
            clusters.len() - 1
        });
        clusters[slot].tabs.push(tab.clone());
    }

    if !other.is_empty() {
        clusters.push(other_cluster(other));
    }
    clusters
}

fn other_cluster(tabs: Vec<SharedTab>) -> Cluster {
    Cluster {
        name: OTHER_CLUSTER.to_string(),
        theme: OTHER_THEME.to_string(),
        tabs,
    }
}

/// Turn a classification response into a full partition of `tabs`.
///
/// Out-of-range or non-integer indices are ignored, a tab claimed by several
/// clusters stays in the first, and unclaimed tabs are collected into
/// [`OTHER_CLUSTER`]. An empty response puts every tab in [`OTHER_CLUSTER`].
pub fn validate_partition(tabs: &[SharedTab], response: ClassificationResponse) -> Vec<Cluster> {
    let mut claimed = BTreeSet::new();
    let mut clusters: Vec<Cluster> = Vec::new();
    for raw in response.clusters {
        let members: Vec<SharedTab> = raw
            .tabs
            .iter()
            .filter_map(|v| v.as_u64())
            .filter_map(|i| usize::try_from(i).ok())
            .filter(|&i| i < tabs.len() && claimed.insert(i))
            .map(|i| tabs[i].clone())
            .collect();
        if members.is_empty() {
            continue;
        }
        let name = match raw.name.trim() {
            "" => OTHER_CLUSTER.to_string(),
            n => n.to_string(),
        };
        // The service may itself return an "Other" cluster.
        if let Some(existing) = clusters.iter_mut().find(|c| c.name == name) {
            existing.tabs.extend(members);
        } else {
            clusters.push(Cluster {
                name,
                theme: raw.theme,
                tabs: members,
            });
        }
    }

    let leftover: Vec<SharedTab> = (0..tabs.len())
        .filter(|i| !claimed.contains(i))
        .map(|i| tabs[i].clone())
        .collect();
    if !leftover.is_empty() {
        match clusters.iter_mut().find(|c| c.name == OTHER_CLUSTER) {
            Some(other) => other.tabs.extend(leftover),
            None => clusters.push(other_cluster(leftover)),
        }
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabshare_protocol::TabPayload;

    fn tabs(urls: &[&str]) -> Vec<SharedTab> {
        urls.iter()
            .enumerate()
            .map(|(i, url)| {
                SharedTab::local(
                    &TabPayload {
                        title: format!("tab {i}"),
                        url: url.to_string(),
                        summary: None,
                        timestamp: i as i64,
                    },
                    "g1",
                )
            })
            .collect()
    }

    fn response(value: serde_json::Value) -> ClassificationResponse {
        serde_json::from_value(value).unwrap()
    }

    /// Every tab appears exactly once across all clusters.
    fn assert_full_coverage(input: &[SharedTab], clusters: &[Cluster]) {
        let mut seen: Vec<&str> = clusters
            .iter()
            .flat_map(|c| c.tabs.iter().map(|t| t.title.as_str()))
            .collect();
        seen.sort();
        let mut expected: Vec<&str> = input.iter().map(|t| t.title.as_str()).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_fallback_groups_by_host() {
        let input = tabs(&[
            "https://www.rust-lang.org/learn",
            "https://docs.rs/tokio",
            "https://rust-lang.org/tools",
        ]);
        let clusters = fallback_partition(&input);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].name, "rust-lang.org");
        assert_eq!(clusters[0].tabs.len(), 2);
        assert_eq!(clusters[0].theme, "Pages from rust-lang.org");
        assert_eq!(clusters[1].name, "docs.rs");
    }

    #[test]
    fn test_fallback_single_tab() {
        let input = tabs(&["https://example.com/"]);
        let clusters = fallback_partition(&input);
        assert_eq!(clusters.len(), 1);
        assert_full_coverage(&input, &clusters);
    }

    #[test]
    fn test_fallback_unparsable_url_goes_to_other() {
        let input = tabs(&["not a url", "https://example.com/", "about:blank"]);
        let clusters = fallback_partition(&input);
        assert_eq!(clusters.last().unwrap().name, OTHER_CLUSTER);
        assert_eq!(clusters.last().unwrap().tabs.len(), 2);
        assert_full_coverage(&input, &clusters);
    }

    #[test]
    fn test_fallback_empty_set() {
        assert!(fallback_partition(&[]).is_empty());
    }

    #[test]
    fn test_validate_well_formed_response() {
        let input = tabs(&["https://a.test/", "https://b.test/", "https://c.test/"]);
        let clusters = validate_partition(
            &input,
            response(json!({"clusters": [
                {"name": "Reading", "theme": "Articles", "tabs": [0, 2]},
                {"name": "Tools", "theme": "Utilities", "tabs": [1]}
            ]})),
        );
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].tabs.len(), 2);
        assert_full_coverage(&input, &clusters);
    }

    #[test]
    fn test_validate_out_of_range_index() {
        let input = tabs(&["https://a.test/", "https://b.test/"]);
        let clusters = validate_partition(
            &input,
            response(json!({"clusters": [
                {"name": "Reading", "theme": "Articles", "tabs": [0, 7, -1, "x"]}
            ]})),
        );
        assert_full_coverage(&input, &clusters);
        assert_eq!(clusters[1].name, OTHER_CLUSTER);
        assert_eq!(clusters[1].tabs[0].url, "https://b.test/");
    }

    #[test]
    fn test_validate_omitted_index() {
        let input = tabs(&["https://a.test/", "https://b.test/", "https://c.test/"]);
        let clusters = validate_partition(
            &input,
            response(json!({"clusters": [
                {"name": "Reading", "theme": "Articles", "tabs": [0, 1]}
            ]})),
        );
        assert_full_coverage(&input, &clusters);
        assert_eq!(clusters.iter().find(|c| c.name == OTHER_CLUSTER).unwrap().tabs.len(), 1);
    }

    #[test]
    fn test_validate_empty_clusters_covers_everything() {
        let input = tabs(&["https://a.test/", "https://b.test/"]);
        let clusters = validate_partition(&input, response(json!({"clusters": []})));
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, OTHER_CLUSTER);
        assert_full_coverage(&input, &clusters);

        assert!(validate_partition(&[], response(json!({"clusters": []}))).is_empty());
    }

    #[test]
    fn test_validate_clusters_with_only_bad_indices() {
        let input = tabs(&["https://a.test/", "https://b.test/"]);
        let clusters = validate_partition(
            &input,
            response(json!({"clusters": [{"name": "Ghost", "theme": "", "tabs": [5]}]})),
        );
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, OTHER_CLUSTER);
        assert_full_coverage(&input, &clusters);
    }

    #[test]
    fn test_validate_first_claim_wins() {
        let input = tabs(&["https://a.test/", "https://b.test/"]);
        let clusters = validate_partition(
            &input,
            response(json!({"clusters": [
                {"name": "One", "theme": "", "tabs": [0, 1]},
                {"name": "Two", "theme": "", "tabs": [1]}
            ]})),
        );
        assert_eq!(clusters.len(), 1);
        assert_full_coverage(&input, &clusters);
    }

    #[test]
    fn test_describe_indexes_in_order() {
        let input = tabs(&["https://a.test/", "https://b.test/"]);
        let described = describe(&input);
        assert_eq!(described[1].index, 1);
        assert_eq!(described[1].url, "https://b.test/");
    }
}
