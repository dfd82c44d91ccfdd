//! Route matching and mode resolution.

use policy::PolicyRoute;

/// Hit id of the synthetic unmatched-route rule.
pub const RULE_ROUTE_UNMATCHED: &str = "route.unmatched";

/// First route whose match criteria equal (method, path), else the route
/// whose id equals the adapter-supplied `route_id`, else none. Exact
/// string comparison only in v0.1.
#[must_use]
pub fn match_route<'a>(
    routes: &'a [PolicyRoute],
    method: &str,
    path: &str,
    route_id: Option<&str>,
) -> Option<&'a PolicyRoute> {
    routes
        .iter()
        .find(|route| route.matcher.method == method && route.matcher.path == path)
        .or_else(|| route_id.and_then(|id| routes.iter().find(|route| route.id == id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::PolicySet;

    fn routes() -> Vec<PolicyRoute> {
        PolicySet::from_yaml_str(
            r#"
routes:
  - id: a
    match: { method: GET, path: /a }
  - id: a.duplicate-path
    match: { method: GET, path: /a }
  - id: b
    match: { method: POST, path: /b }
"#,
        )
        .unwrap()
        .routes
    }

    #[test]
    fn first_exact_match_wins() {
        let routes = routes();
        let hit = match_route(&routes, "GET", "/a", None).unwrap();
        assert_eq!(hit.id, "a");
    }

    #[test]
    fn route_id_fallback() {
        let routes = routes();
        let hit = match_route(&routes, "GET", "/unknown", Some("b")).unwrap();
        assert_eq!(hit.id, "b");
    }

    #[test]
    fn no_templating() {
        let routes = routes();
        assert!(match_route(&routes, "GET", "/a/", None).is_none());
        assert!(match_route(&routes, "get", "/a", None).is_none());
        assert!(match_route(&routes, "GET", "/a/x", None).is_none());
    }
}
