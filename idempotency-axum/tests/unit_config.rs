use axum::http::Method;
use idempotency_axum::{ExcludeRule, MiddlewareConfig};
use regex::Regex;

#[test]
fn default_methods_are_the_mutating_verbs() {
    let config = MiddlewareConfig::default();
    assert!(config.applies_to(&Method::POST, "/payments"));
    assert!(config.applies_to(&Method::PUT, "/payments/1"));
    assert!(config.applies_to(&Method::PATCH, "/payments/1"));
    assert!(!config.applies_to(&Method::GET, "/payments"));
    assert!(!config.applies_to(&Method::DELETE, "/payments/1"));
}

#[test]
fn exact_exclude_rule_matches_only_that_path() {
    let mut config = MiddlewareConfig::default();
    config.exclude_paths.push(ExcludeRule::Exact("/healthz".to_string()));
    assert!(!config.applies_to(&Method::POST, "/healthz"));
    assert!(config.applies_to(&Method::POST, "/healthz/extra"));
}

#[test]
fn prefix_exclude_rule_matches_subpaths() {
    let mut config = MiddlewareConfig::default();
    config.exclude_paths.push(ExcludeRule::Prefix("/admin".to_string()));
    assert!(!config.applies_to(&Method::POST, "/admin/reset"));
    assert!(config.applies_to(&Method::POST, "/administer"));
    // Prefix matching is textual, not path-segment-aware: callers should use
    // a `/`-terminated prefix to avoid this overlap if they care.
}

#[test]
fn regex_exclude_rule_matches_the_pattern() {
    let mut config = MiddlewareConfig::default();
    config.exclude_paths.push(ExcludeRule::Regex(Regex::new(r"^/internal/.*$").unwrap()));
    assert!(!config.applies_to(&Method::POST, "/internal/debug"));
    assert!(config.applies_to(&Method::POST, "/internal"));
}
