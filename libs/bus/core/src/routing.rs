//! # Route Table & Pattern Translation
//!
//! ## Purpose
//! Computes the minimal set of broker subscription patterns covering a
//! module's registered exact routes and prefixes, without double delivery.
//!
//! ## Subscription Patterns
//! - **Exact route**: `"orders.created"` subscribes as itself
//! - **Prefix**: `"orders"` becomes one wildcard pattern per broker syntax
//!   (`orders.>` for subject brokers, `orders.#` for topic exchanges)
//! - **Subsumption**: an exact route already covered by a registered prefix
//!   is excluded from the pattern set, otherwise the broker would deliver
//!   the same message twice to the same handler
//!
//! Overlapping prefixes (one a prefix of another) each keep their own
//! pattern. That redundancy is accepted, not an error.

/// Wildcard syntax of the target broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WildcardStyle {
    /// Hierarchical subjects, `>` matches the rest of the subject (NATS)
    Subject,
    /// Topic exchange routing keys, `#` matches zero or more words (AMQP)
    Topic,
}

impl WildcardStyle {
    /// Translate a prefix into the broker's wildcard pattern.
    ///
    /// Prefixes are stored without a trailing separator; a stray trailing
    /// `.` is trimmed before the wildcard suffix is appended.
    pub fn prefix_pattern(&self, prefix: &str) -> String {
        let prefix = prefix.trim_end_matches('.');
        match self {
            WildcardStyle::Subject => format!("{prefix}.>"),
            WildcardStyle::Topic => format!("{prefix}.#"),
        }
    }
}

/// Snapshot of the routes and prefixes a module listens on.
///
/// Built from the pipeline's handler registry when an adapter starts, then
/// translated into broker subscriptions or bindings.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<String>,
    prefixes: Vec<String>,
}

impl RouteTable {
    pub fn new(routes: Vec<String>, prefixes: Vec<String>) -> Self {
        Self { routes, prefixes }
    }

    pub fn routes(&self) -> &[String] {
        &self.routes
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.prefixes.is_empty()
    }

    /// True when some registered prefix is a string-prefix of `route`.
    pub fn prefix_covers(&self, route: &str) -> bool {
        self.prefixes.iter().any(|p| route.starts_with(p.as_str()))
    }

    /// True when a message published to `route` would reach this module,
    /// via either an exact subscription or a prefix wildcard.
    pub fn covers(&self, route: &str) -> bool {
        self.routes.iter().any(|r| r == route) || self.prefix_covers(route)
    }

    /// Compute the subscription patterns for the given broker syntax.
    ///
    /// One wildcard pattern per prefix, then every exact route not subsumed
    /// by a prefix. The exclusion is what guarantees single delivery when a
    /// route matches both its own subscription and a prefix wildcard.
    pub fn subscription_patterns(&self, style: WildcardStyle) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .prefixes
            .iter()
            .map(|p| style.prefix_pattern(p))
            .collect();

        patterns.extend(
            self.routes
                .iter()
                .filter(|r| !self.prefix_covers(r))
                .cloned(),
        );

        patterns
    }
}
