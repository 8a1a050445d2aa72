use std::collections::HashMap;

use http::Method;

use crate::config::DedupOptions;
use crate::request::OperationIdentity;

/// Outcome of classifying an operation: it is deduplicated with this TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eligibility {
    pub ttl_seconds: i64,
}

/// An explicit per-route or per-group idempotency declaration. Takes
/// precedence over the method-level defaults; `ttl_seconds` of None falls
/// back to the configured default.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteRule {
    pub ttl_seconds: Option<i64>,
}

impl RouteRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl_seconds(ttl_seconds: i64) -> Self {
        Self {
            ttl_seconds: Some(ttl_seconds),
        }
    }
}

/// Decides whether an operation is deduplicated and for how long.
///
/// The rule table is populated once at startup from the application's
/// routing topology and never mutated afterwards, so classification is a
/// pure lookup. Resolution order: exact route rule, then the longest
/// matching group prefix, then the per-method defaults.
#[derive(Debug, Clone)]
pub struct EligibilityDetector {
    routes: HashMap<(Method, String), RouteRule>,
    groups: Vec<(String, RouteRule)>,
    default_ttl_seconds: i64,
    posts_idempotent: bool,
    puts_idempotent: bool,
}

impl EligibilityDetector {
    pub fn new(options: &DedupOptions) -> Self {
        Self {
            routes: HashMap::new(),
            groups: Vec::new(),
            default_ttl_seconds: options.default_ttl_seconds,
            posts_idempotent: options.posts_idempotent,
            puts_idempotent: options.puts_idempotent,
        }
    }

    /// Declares a single route idempotent.
    pub fn declare_route(mut self, method: Method, path: impl Into<String>, rule: RouteRule) -> Self {
        self.routes.insert((method, path.into()), rule);
        self
    }

    /// Declares every route under a path prefix idempotent. A route-level
    /// declaration overrides a group-level one.
    pub fn declare_group(mut self, prefix: impl Into<String>, rule: RouteRule) -> Self {
        self.groups.push((prefix.into(), rule));
        // Longest prefix first so the most specific group wins.
        self.groups.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn classify(&self, identity: &OperationIdentity) -> Option<Eligibility> {
        if let Some(rule) = self
            .routes
            .get(&(identity.method.clone(), identity.path.clone()))
        {
            return Some(self.eligible(rule));
        }

        if let Some((_, rule)) = self
            .groups
            .iter()
            .find(|(prefix, _)| identity.path.starts_with(prefix.as_str()))
        {
            return Some(self.eligible(rule));
        }

        let by_method = match identity.method {
            Method::POST => self.posts_idempotent,
            Method::PUT => self.puts_idempotent,
            _ => false,
        };

        by_method.then(|| Eligibility {
            ttl_seconds: self.default_ttl_seconds,
        })
    }

    fn eligible(&self, rule: &RouteRule) -> Eligibility {
        Eligibility {
            ttl_seconds: rule.ttl_seconds.unwrap_or(self.default_ttl_seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupOptions;

    fn detector() -> EligibilityDetector {
        EligibilityDetector::new(&DedupOptions::default())
    }

    #[test]
    fn test_put_is_idempotent_by_default() {
        let identity = OperationIdentity::new(Method::PUT, "/widgets/1");
        let eligibility = detector().classify(&identity);
        assert_eq!(
            eligibility,
            Some(Eligibility { ttl_seconds: 86400 })
        );
    }

    #[test]
    fn test_post_is_not_idempotent_by_default() {
        let identity = OperationIdentity::new(Method::POST, "/orders");
        assert_eq!(detector().classify(&identity), None);
    }

    #[test]
    fn test_get_is_never_deduplicated_by_method_default() {
        let identity = OperationIdentity::new(Method::GET, "/orders");
        assert_eq!(detector().classify(&identity), None);
    }

    #[test]
    fn test_route_rule_overrides_method_default() {
        let detector =
            detector().declare_route(Method::POST, "/orders", RouteRule::with_ttl_seconds(3600));

        let identity = OperationIdentity::new(Method::POST, "/orders");
        assert_eq!(
            detector.classify(&identity),
            Some(Eligibility { ttl_seconds: 3600 })
        );
    }

    #[test]
    fn test_route_rule_without_ttl_uses_default() {
        let detector = detector().declare_route(Method::POST, "/orders", RouteRule::new());

        let identity = OperationIdentity::new(Method::POST, "/orders");
        assert_eq!(
            detector.classify(&identity),
            Some(Eligibility { ttl_seconds: 86400 })
        );
    }

    #[test]
    fn test_group_rule_applies_to_nested_routes() {
        let detector = detector().declare_group("/payments", RouteRule::with_ttl_seconds(600));

        let identity = OperationIdentity::new(Method::POST, "/payments/transfers");
        assert_eq!(
            detector.classify(&identity),
            Some(Eligibility { ttl_seconds: 600 })
        );
    }

    #[test]
    fn test_route_rule_beats_group_rule() {
        let detector = detector()
            .declare_group("/payments", RouteRule::with_ttl_seconds(600))
            .declare_route(
                Method::POST,
                "/payments/transfers",
                RouteRule::with_ttl_seconds(60),
            );

        let identity = OperationIdentity::new(Method::POST, "/payments/transfers");
        assert_eq!(
            detector.classify(&identity),
            Some(Eligibility { ttl_seconds: 60 })
        );
    }

    #[test]
    fn test_longest_group_prefix_wins() {
        let detector = detector()
            .declare_group("/payments", RouteRule::with_ttl_seconds(600))
            .declare_group("/payments/transfers", RouteRule::with_ttl_seconds(30));

        let identity = OperationIdentity::new(Method::POST, "/payments/transfers/instant");
        assert_eq!(
            detector.classify(&identity),
            Some(Eligibility { ttl_seconds: 30 })
        );
    }

    #[test]
    fn test_method_defaults_configurable() {
        let options = DedupOptions {
            posts_idempotent: true,
            puts_idempotent: false,
            ..DedupOptions::default()
        };
        let detector = EligibilityDetector::new(&options);

        assert!(detector
            .classify(&OperationIdentity::new(Method::POST, "/orders"))
            .is_some());
        assert!(detector
            .classify(&OperationIdentity::new(Method::PUT, "/widgets/1"))
            .is_none());
    }
}
