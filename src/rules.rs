//! Container rules
//!
//! Rules are fixed per container. [`crate::Container::with`] derives a
//! container with modified rules that shares registrations and
//! singletons but keeps its own plan cache.

use crate::registry::IfAlreadyRegistered;

/// How a single-instance request picks among several unconditional
/// registrations with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DefaultSelection {
    /// The most recently registered one wins
    #[default]
    LastRegisteredWins,
    /// Fail with [`crate::DiError::AmbiguousMatch`]
    RequireUnique,
}

/// How cached plans are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlanBackend {
    /// Lower hot plans into nested closures
    #[default]
    Compiled,
    /// Always walk the expression tree
    Interpreted,
}

/// Container-wide behavior switches.
///
/// # Example
///
/// ```rust
/// use ioc_engine::{Container, DefaultSelection, PlanBackend, Rules};
///
/// let rules = Rules::default()
///     .with_default_selection(DefaultSelection::RequireUnique)
///     .with_plan_backend(PlanBackend::Interpreted);
///
/// let container = Container::with_rules(rules);
/// assert_eq!(container.rules().plan_backend(), PlanBackend::Interpreted);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rules {
    if_already_registered: IfAlreadyRegistered,
    default_selection: DefaultSelection,
    captive_dependency_check: bool,
    plan_backend: PlanBackend,
    compilation_threshold: u32,
    track_disposable_transients: bool,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            if_already_registered: IfAlreadyRegistered::AppendNewKey,
            default_selection: DefaultSelection::LastRegisteredWins,
            captive_dependency_check: true,
            plan_backend: PlanBackend::Compiled,
            compilation_threshold: 1,
            track_disposable_transients: false,
        }
    }
}

impl Rules {
    /// Policy for registrations that do not set their own.
    pub fn if_already_registered(&self) -> IfAlreadyRegistered {
        self.if_already_registered
    }

    /// Tie-break among unconditional candidates.
    pub fn default_selection(&self) -> DefaultSelection {
        self.default_selection
    }

    /// Whether longer-lived services may not capture shorter-lived ones.
    pub fn captive_dependency_check(&self) -> bool {
        self.captive_dependency_check
    }

    /// Plan execution backend.
    pub fn plan_backend(&self) -> PlanBackend {
        self.plan_backend
    }

    /// Executions before a plan is compiled.
    pub fn compilation_threshold(&self) -> u32 {
        self.compilation_threshold
    }

    /// Whether every disposable transient is tracked by its scope.
    pub fn track_disposable_transients(&self) -> bool {
        self.track_disposable_transients
    }

    /// Set the default duplicate-registration policy.
    pub fn with_if_already_registered(mut self, policy: IfAlreadyRegistered) -> Self {
        self.if_already_registered = policy;
        self
    }

    /// Set how ties among unconditional defaults are broken.
    pub fn with_default_selection(mut self, selection: DefaultSelection) -> Self {
        self.default_selection = selection;
        self
    }

    /// Enable or disable the captive-dependency check.
    pub fn with_captive_dependency_check(mut self, enabled: bool) -> Self {
        self.captive_dependency_check = enabled;
        self
    }

    /// Choose the plan execution backend.
    pub fn with_plan_backend(mut self, backend: PlanBackend) -> Self {
        self.plan_backend = backend;
        self
    }

    /// Compile after `threshold` executions; 0 behaves like 1.
    pub fn with_compilation_threshold(mut self, threshold: u32) -> Self {
        self.compilation_threshold = threshold.max(1);
        self
    }

    /// Track disposable transients in the resolving scope.
    pub fn with_track_disposable_transients(mut self, enabled: bool) -> Self {
        self.track_disposable_transients = enabled;
        self
    }
}
