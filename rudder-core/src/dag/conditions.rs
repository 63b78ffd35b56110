// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Match-condition algebra: compiling CRD conditions into DAG match forms,
//! joining prefixes along include chains, and detecting combinations no
//! request can satisfy.

use rudder_k8s::MatchCondition;

use super::{HeaderMatch, HeaderMatchKind, PathMatch, QueryParamMatch, QueryParamMatchKind};

/// Conditions accumulated along an include chain. Only prefix, header and
/// query conditions may appear on an include edge; exact and regex matches
/// are leaf-route forms.
#[derive(Clone, Debug, Default)]
pub struct ConditionChain {
    pub prefix: String,
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
}

/// The compiled match set of a leaf route.
#[derive(Clone, Debug)]
pub struct MatchSpec {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
}

/// Extends `parent` with the conditions on an include edge.
pub fn include_chain(
    parent: &ConditionChain,
    conditions: &[MatchCondition],
) -> Result<ConditionChain, String> {
    let mut chain = parent.clone();
    for condition in conditions {
        if condition.exact.is_some() {
            return Err("exact conditions are not allowed on an include".to_string());
        }
        if condition.regex.is_some() {
            return Err("regex conditions are not allowed on an include".to_string());
        }
        if let Some(prefix) = &condition.prefix {
            validate_path(prefix)?;
            chain.prefix = join_prefix(&chain.prefix, prefix);
        }
        append_header(&mut chain.headers, condition)?;
        append_query(&mut chain.query_params, condition)?;
    }
    check_satisfiable(&chain.headers, &chain.query_params)?;
    Ok(chain)
}

/// Compiles the conditions on a leaf route, combined with its include chain.
pub fn route_match(
    chain: &ConditionChain,
    conditions: &[MatchCondition],
) -> Result<MatchSpec, String> {
    let mut prefix: Option<String> = None;
    let mut exact: Option<String> = None;
    let mut regex: Option<String> = None;
    let mut headers = chain.headers.clone();
    let mut query_params = chain.query_params.clone();

    for condition in conditions {
        if let Some(p) = &condition.prefix {
            validate_path(p)?;
            if prefix.is_some() {
                return Err("route: more than one prefix condition".to_string());
            }
            prefix = Some(p.clone());
        }
        if let Some(e) = &condition.exact {
            validate_path(e)?;
            if exact.is_some() {
                return Err("route: more than one exact condition".to_string());
            }
            exact = Some(e.clone());
        }
        if let Some(r) = &condition.regex {
            if regex.is_some() {
                return Err("route: more than one regex condition".to_string());
            }
            regex = Some(r.clone());
        }
        append_header(&mut headers, condition)?;
        append_query(&mut query_params, condition)?;
    }

    let path = match (exact, regex, prefix) {
        (Some(_), Some(_), _) => {
            return Err("route: exact and regex conditions cannot be combined".to_string())
        }
        (Some(e), None, p) => {
            // An exact path must still fall under the include chain's prefix.
            if !chain.prefix.is_empty() && !segment_prefixed(&e, &chain.prefix) {
                return Err(format!(
                    "route: exact path {e:?} is outside the inherited prefix {:?}",
                    chain.prefix
                ));
            }
            if p.is_some() {
                return Err("route: exact and prefix conditions cannot be combined".to_string());
            }
            PathMatch::Exact(e)
        }
        (None, Some(r), p) => {
            if p.is_some() {
                return Err("route: regex and prefix conditions cannot be combined".to_string());
            }
            PathMatch::Regex(r)
        }
        (None, None, p) => {
            let joined = join_prefix(&chain.prefix, p.as_deref().unwrap_or(""));
            PathMatch::Prefix(if joined.is_empty() { "/".to_string() } else { joined })
        }
    };

    check_satisfiable(&headers, &query_params)?;

    // Normalised ordering keeps textual output stable.
    headers.sort();
    headers.dedup();
    query_params.sort();
    query_params.dedup();

    Ok(MatchSpec {
        path,
        headers,
        query_params,
    })
}

fn append_header(headers: &mut Vec<HeaderMatch>, condition: &MatchCondition) -> Result<(), String> {
    let Some(h) = &condition.header else {
        return Ok(());
    };
    if h.name.is_empty() {
        return Err("header condition requires a name".to_string());
    }
    let kind = match (&h.exact, &h.notexact, &h.contains, &h.notcontains, h.present, h.notpresent) {
        (Some(v), None, None, None, false, false) => HeaderMatchKind::Exact(v.clone()),
        (None, Some(v), None, None, false, false) => HeaderMatchKind::NotExact(v.clone()),
        (None, None, Some(v), None, false, false) => HeaderMatchKind::Contains(v.clone()),
        (None, None, None, Some(v), false, false) => HeaderMatchKind::NotContains(v.clone()),
        (None, None, None, None, true, false) => HeaderMatchKind::Present,
        (None, None, None, None, false, true) => HeaderMatchKind::NotPresent,
        (None, None, None, None, false, false) => {
            return Err(format!("header condition on {:?} has no operator", h.name))
        }
        _ => {
            return Err(format!(
                "header condition on {:?} has more than one operator",
                h.name
            ))
        }
    };
    headers.push(HeaderMatch {
        name: h.name.to_ascii_lowercase(),
        kind,
    });
    Ok(())
}

fn append_query(
    query_params: &mut Vec<QueryParamMatch>,
    condition: &MatchCondition,
) -> Result<(), String> {
    let Some(q) = &condition.query_parameter else {
        return Ok(());
    };
    if q.name.is_empty() {
        return Err("query parameter condition requires a name".to_string());
    }
    let kind = match (&q.exact, &q.prefix, &q.contains, q.present) {
        (Some(v), None, None, false) => QueryParamMatchKind::Exact {
            value: v.clone(),
            ignore_case: q.ignore_case,
        },
        (None, Some(v), None, false) => QueryParamMatchKind::Prefix(v.clone()),
        (None, None, Some(v), false) => QueryParamMatchKind::Contains(v.clone()),
        (None, None, None, true) => QueryParamMatchKind::Present,
        (None, None, None, false) => {
            return Err(format!(
                "query parameter condition on {:?} has no operator",
                q.name
            ))
        }
        _ => {
            return Err(format!(
                "query parameter condition on {:?} has more than one operator",
                q.name
            ))
        }
    };
    query_params.push(QueryParamMatch {
        name: q.name.clone(),
        kind,
    });
    Ok(())
}

/// Rejects header/query sets no request can satisfy.
fn check_satisfiable(
    headers: &[HeaderMatch],
    query_params: &[QueryParamMatch],
) -> Result<(), String> {
    for (i, a) in headers.iter().enumerate() {
        for b in &headers[i + 1..] {
            if a.name != b.name {
                continue;
            }
            let conflict = match (&a.kind, &b.kind) {
                (HeaderMatchKind::Present, HeaderMatchKind::NotPresent)
                | (HeaderMatchKind::NotPresent, HeaderMatchKind::Present) => true,
                (HeaderMatchKind::NotPresent, k) | (k, HeaderMatchKind::NotPresent) => {
                    !matches!(k, HeaderMatchKind::NotPresent)
                }
                (HeaderMatchKind::Exact(x), HeaderMatchKind::Exact(y)) => x != y,
                (HeaderMatchKind::Exact(x), HeaderMatchKind::NotExact(y))
                | (HeaderMatchKind::NotExact(y), HeaderMatchKind::Exact(x)) => x == y,
                (HeaderMatchKind::Contains(x), HeaderMatchKind::NotContains(y))
                | (HeaderMatchKind::NotContains(y), HeaderMatchKind::Contains(x)) => x == y,
                _ => false,
            };
            if conflict {
                return Err(format!(
                    "header conditions on {:?} can never match together",
                    a.name
                ));
            }
        }
    }
    for (i, a) in query_params.iter().enumerate() {
        for b in &query_params[i + 1..] {
            if a.name != b.name {
                continue;
            }
            if let (
                QueryParamMatchKind::Exact { value: x, .. },
                QueryParamMatchKind::Exact { value: y, .. },
            ) = (&a.kind, &b.kind)
            {
                if x != y {
                    return Err(format!(
                        "query parameter conditions on {:?} can never match together",
                        a.name
                    ));
                }
            }
        }
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err(format!("path condition {path:?} must start with /"));
    }
    if path.contains("//") {
        return Err(format!("path condition {path:?} contains an empty segment"));
    }
    Ok(())
}

/// Joins two prefixes preserving segment boundaries and the child's trailing
/// slash: "/a" + "/b" = "/a/b", "/a/" + "/b/" = "/a/b/".
pub fn join_prefix(parent: &str, child: &str) -> String {
    if parent.is_empty() || parent == "/" {
        return child.to_string();
    }
    if child.is_empty() || child == "/" {
        return parent.to_string();
    }
    let parent = parent.strip_suffix('/').unwrap_or(parent);
    format!("{parent}{child}")
}

/// Whether `path` lies under segment-prefix `prefix`.
fn segment_prefixed(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_k8s::{HeaderMatchCondition, QueryParameterMatchCondition};

    fn prefix(p: &str) -> MatchCondition {
        MatchCondition {
            prefix: Some(p.to_string()),
            ..Default::default()
        }
    }

    fn header_exact(name: &str, value: &str) -> MatchCondition {
        MatchCondition {
            header: Some(HeaderMatchCondition {
                name: name.to_string(),
                exact: Some(value.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn prefixes_join_along_the_chain() {
        let root = ConditionChain::default();
        let chain = include_chain(&root, &[prefix("/api")]).unwrap();
        assert_eq!(chain.prefix, "/api");

        let chain = include_chain(&chain, &[prefix("/v1")]).unwrap();
        assert_eq!(chain.prefix, "/api/v1");

        let spec = route_match(&chain, &[prefix("/users/")]).unwrap();
        assert_eq!(spec.path, PathMatch::Prefix("/api/v1/users/".to_string()));
    }

    #[test]
    fn bare_route_defaults_to_root_prefix() {
        let spec = route_match(&ConditionChain::default(), &[]).unwrap();
        assert_eq!(spec.path, PathMatch::Prefix("/".to_string()));
    }

    #[test]
    fn exact_and_regex_are_rejected_on_includes() {
        let condition = MatchCondition {
            exact: Some("/x".to_string()),
            ..Default::default()
        };
        assert!(include_chain(&ConditionChain::default(), &[condition]).is_err());
    }

    #[test]
    fn exact_path_outside_inherited_prefix_is_unsatisfiable() {
        let chain = include_chain(&ConditionChain::default(), &[prefix("/api")]).unwrap();
        let exact = MatchCondition {
            exact: Some("/health".to_string()),
            ..Default::default()
        };
        assert!(route_match(&chain, &[exact]).is_err());

        let inside = MatchCondition {
            exact: Some("/api/health".to_string()),
            ..Default::default()
        };
        let spec = route_match(&chain, &[inside]).unwrap();
        assert_eq!(spec.path, PathMatch::Exact("/api/health".to_string()));
    }

    #[test]
    fn contradictory_headers_are_unsatisfiable() {
        let err = route_match(
            &ConditionChain::default(),
            &[header_exact("x-team", "a"), header_exact("x-team", "b")],
        )
        .unwrap_err();
        assert!(err.contains("never match"), "unexpected error: {err}");

        // Same value twice is fine (and deduplicated).
        let spec = route_match(
            &ConditionChain::default(),
            &[header_exact("x-team", "a"), header_exact("x-team", "a")],
        )
        .unwrap();
        assert_eq!(spec.headers.len(), 1);
    }

    #[test]
    fn present_and_notpresent_conflict() {
        let present = MatchCondition {
            header: Some(HeaderMatchCondition {
                name: "x-flag".to_string(),
                present: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let notpresent = MatchCondition {
            header: Some(HeaderMatchCondition {
                name: "x-flag".to_string(),
                notpresent: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(route_match(&ConditionChain::default(), &[present, notpresent]).is_err());
    }

    #[test]
    fn header_names_are_normalised_and_sorted() {
        let spec = route_match(
            &ConditionChain::default(),
            &[header_exact("X-Zeta", "1"), header_exact("x-alpha", "2")],
        )
        .unwrap();
        assert_eq!(spec.headers[0].name, "x-alpha");
        assert_eq!(spec.headers[1].name, "x-zeta");
    }

    #[test]
    fn query_parameter_operators() {
        let exact = MatchCondition {
            query_parameter: Some(QueryParameterMatchCondition {
                name: "version".to_string(),
                exact: Some("v2".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let spec = route_match(&ConditionChain::default(), &[exact]).unwrap();
        assert_eq!(
            spec.query_params[0].kind,
            QueryParamMatchKind::Exact {
                value: "v2".to_string(),
                ignore_case: false
            }
        );

        let both = MatchCondition {
            query_parameter: Some(QueryParameterMatchCondition {
                name: "version".to_string(),
                exact: Some("v2".to_string()),
                prefix: Some("v".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(route_match(&ConditionChain::default(), &[both]).is_err());
    }
}
