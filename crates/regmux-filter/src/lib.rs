//! Include/exclude filtering for regmux catalogs.
//!
//! [`apply_filters`] is a pure function: a server survives iff it passes the
//! name rules (include globs, exclude globs) and the tag rules (include set,
//! exclude set). Output order is input order, and an empty filter is the
//! identity.
//!
//! [`filter_hash`] produces the canonical content hash of a filter config,
//! used by the sync decision to detect filter changes between syncs.

use anyhow::{Context, Result};
use glob::Pattern;
use sha2::{Digest, Sha256};

use regmux_types::{Catalog, FilterConfig, ServerEntry};

/// Compile-check every glob in a filter config.
///
/// Called at config-validation time so that filter application itself never
/// sees an invalid pattern.
pub fn validate_filter(filter: &FilterConfig) -> Result<()> {
    if let Some(names) = &filter.names {
        for pat in names.include.iter().chain(names.exclude.iter()) {
            Pattern::new(pat).with_context(|| format!("invalid name glob {pat:?}"))?;
        }
    }
    Ok(())
}

/// Apply a filter to a catalog, preserving order and the content hash.
///
/// `None` and an empty filter both return the catalog unchanged.
pub fn apply_filters(catalog: &Catalog, filter: Option<&FilterConfig>) -> Result<Catalog> {
    let filter = match filter {
        Some(f) if !f.is_empty() => f,
        _ => return Ok(catalog.clone()),
    };

    let name_rules = match &filter.names {
        Some(names) => Some(NameRules::compile(&names.include, &names.exclude)?),
        None => None,
    };

    let servers = catalog
        .servers
        .iter()
        .filter(|server| {
            let name_ok = name_rules
                .as_ref()
                .map(|r| r.matches(&server.name))
                .unwrap_or(true);
            let tag_ok = filter
                .tags
                .as_ref()
                .map(|t| tags_match(server, &t.include, &t.exclude))
                .unwrap_or(true);
            name_ok && tag_ok
        })
        .cloned()
        .collect();

    Ok(Catalog {
        servers,
        hash: catalog.hash.clone(),
    })
}

/// Canonical hash of a filter config: SHA-256 over its JSON serialization.
///
/// Absent and empty filters hash identically, so adding `filter: {}` to a
/// config does not force a resync.
pub fn filter_hash(filter: Option<&FilterConfig>) -> String {
    let bytes = match filter {
        Some(f) if !f.is_empty() => {
            serde_json::to_vec(f).expect("filter config serialization cannot fail")
        }
        _ => Vec::new(),
    };
    hex::encode(Sha256::digest(&bytes))
}

struct NameRules {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl NameRules {
    fn compile(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |pats: &[String]| -> Result<Vec<Pattern>> {
            pats.iter()
                .map(|p| Pattern::new(p).with_context(|| format!("invalid name glob {p:?}")))
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    fn matches(&self, name: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| p.matches(name));
        let excluded = self.exclude.iter().any(|p| p.matches(name));
        included && !excluded
    }
}

fn tags_match(server: &ServerEntry, include: &[String], exclude: &[String]) -> bool {
    let included =
        include.is_empty() || server.tags.iter().any(|t| include.contains(t));
    let excluded = server.tags.iter().any(|t| exclude.contains(t));
    included && !excluded
}

#[cfg(test)]
mod tests {
    use super::*;
    use regmux_types::{NameFilter, ServerVersion, TagFilter};

    fn server(name: &str, tags: &[&str]) -> ServerEntry {
        let mut e = ServerEntry::new(name);
        e.tags = tags.iter().map(|t| t.to_string()).collect();
        e.versions = vec![ServerVersion::new("1.0.0")];
        e
    }

    fn catalog(names: &[(&str, &[&str])]) -> Catalog {
        Catalog::new(
            names.iter().map(|(n, tags)| server(n, tags)).collect(),
            "h1",
        )
    }

    fn names_filter(include: &[&str], exclude: &[&str]) -> FilterConfig {
        FilterConfig {
            names: Some(NameFilter {
                include: include.iter().map(|s| s.to_string()).collect(),
                exclude: exclude.iter().map(|s| s.to_string()).collect(),
            }),
            tags: None,
        }
    }

    #[test]
    fn no_filter_is_identity() {
        let c = catalog(&[("a", &[]), ("b", &[])]);
        let out = apply_filters(&c, None).expect("apply");
        assert_eq!(out, c);
    }

    #[test]
    fn empty_filter_is_identity() {
        let c = catalog(&[("a", &[]), ("b", &[])]);
        let out = apply_filters(&c, Some(&FilterConfig::default())).expect("apply");
        assert_eq!(out, c);
    }

    #[test]
    fn include_glob_narrows_catalog() {
        let c = catalog(&[("foo-db", &[]), ("foo-web", &[]), ("bar", &[])]);
        let f = names_filter(&["foo-*"], &[]);
        let out = apply_filters(&c, Some(&f)).expect("apply");
        let names: Vec<&str> = out.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["foo-db", "foo-web"]);
    }

    #[test]
    fn exclude_glob_wins_over_include() {
        let c = catalog(&[("foo-db", &[]), ("foo-test", &[])]);
        let f = names_filter(&["foo-*"], &["*-test"]);
        let out = apply_filters(&c, Some(&f)).expect("apply");
        let names: Vec<&str> = out.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["foo-db"]);
    }

    #[test]
    fn empty_include_list_admits_everything() {
        let c = catalog(&[("a", &[]), ("b-test", &[])]);
        let f = names_filter(&[], &["*-test"]);
        let out = apply_filters(&c, Some(&f)).expect("apply");
        let names: Vec<&str> = out.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn tag_include_requires_at_least_one_match() {
        let c = catalog(&[("a", &["db"]), ("b", &["web"]), ("c", &[])]);
        let f = FilterConfig {
            names: None,
            tags: Some(TagFilter {
                include: vec!["db".to_string()],
                exclude: vec![],
            }),
        };
        let out = apply_filters(&c, Some(&f)).expect("apply");
        let names: Vec<&str> = out.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn tag_exclude_removes_matching_servers() {
        let c = catalog(&[("a", &["db", "deprecated"]), ("b", &["db"])]);
        let f = FilterConfig {
            names: None,
            tags: Some(TagFilter {
                include: vec![],
                exclude: vec!["deprecated".to_string()],
            }),
        };
        let out = apply_filters(&c, Some(&f)).expect("apply");
        let names: Vec<&str> = out.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn name_and_tag_rules_are_conjunctive() {
        let c = catalog(&[("foo-a", &["db"]), ("foo-b", &["web"]), ("bar", &["db"])]);
        let f = FilterConfig {
            names: Some(NameFilter {
                include: vec!["foo-*".to_string()],
                exclude: vec![],
            }),
            tags: Some(TagFilter {
                include: vec!["db".to_string()],
                exclude: vec![],
            }),
        };
        let out = apply_filters(&c, Some(&f)).expect("apply");
        let names: Vec<&str> = out.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["foo-a"]);
    }

    #[test]
    fn filter_that_excludes_everything_yields_empty_catalog() {
        let c = catalog(&[("a", &[]), ("b", &[])]);
        let f = names_filter(&["nothing-matches-*"], &[]);
        let out = apply_filters(&c, Some(&f)).expect("apply");
        assert_eq!(out.server_count(), 0);
        assert_eq!(out.hash, "h1");
    }

    #[test]
    fn validate_filter_rejects_bad_glob() {
        let f = names_filter(&["[unclosed"], &[]);
        let err = validate_filter(&f).expect_err("must fail");
        assert!(err.to_string().contains("invalid name glob"));
    }

    #[test]
    fn apply_filters_surfaces_bad_glob() {
        let c = catalog(&[("a", &[])]);
        let f = names_filter(&["[unclosed"], &[]);
        assert!(apply_filters(&c, Some(&f)).is_err());
    }

    #[test]
    fn filter_hash_is_stable_and_distinguishes_filters() {
        let f1 = names_filter(&["foo-*"], &[]);
        let f2 = names_filter(&["bar-*"], &[]);
        assert_eq!(filter_hash(Some(&f1)), filter_hash(Some(&f1)));
        assert_ne!(filter_hash(Some(&f1)), filter_hash(Some(&f2)));
    }

    #[test]
    fn absent_and_empty_filters_hash_identically() {
        assert_eq!(filter_hash(None), filter_hash(Some(&FilterConfig::default())));
        // SHA-256 of the empty string.
        insta::assert_snapshot!(
            filter_hash(None),
            @"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const NO_TAGS: &[&str] = &[];

        fn arb_names() -> impl Strategy<Value = Vec<String>> {
            proptest::collection::vec("[a-z]{1,8}(-[a-z]{1,8})?", 0..12)
        }

        proptest! {
            #[test]
            fn output_is_an_ordered_subsequence_of_input(names in arb_names()) {
                let pairs: Vec<(&str, &[&str])> =
                    names.iter().map(|n| (n.as_str(), NO_TAGS)).collect();
                let c = catalog(&pairs);
                let f = names_filter(&["*a*"], &["*-z*"]);
                let out = apply_filters(&c, Some(&f)).expect("apply");

                let mut input = c.servers.iter().map(|s| &s.name);
                for kept in &out.servers {
                    prop_assert!(input.any(|n| n == &kept.name));
                }
            }

            #[test]
            fn filtering_twice_equals_filtering_once(names in arb_names()) {
                let pairs: Vec<(&str, &[&str])> =
                    names.iter().map(|n| (n.as_str(), NO_TAGS)).collect();
                let c = catalog(&pairs);
                let f = names_filter(&["*"], &["*-q*"]);
                let once = apply_filters(&c, Some(&f)).expect("apply");
                let twice = apply_filters(&once, Some(&f)).expect("apply");
                prop_assert_eq!(once, twice);
            }
        }
    }
}
