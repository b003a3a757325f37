//! Engine-wide constants
//!
//! Single source of truth for configuration defaults and pipeline step names.

/// Default values for tree configuration
pub mod defaults {
    /// Whether the root node is rendered (false makes it a transparent placeholder)
    pub const SHOW_ROOT: bool = true;
    /// Children are only built when their parent expands
    pub const LAZY: bool = true;
    /// Builds do not rebuild descendants unless asked to
    pub const RECURSIVE: bool = false;
}

/// Named pipeline steps
pub mod steps {
    pub const BUILDING: &str = "building";
    pub const BUILD: &str = "build";
    pub const BUILT: &str = "built";
    pub const EXPANDING: &str = "expanding";
    pub const EXPAND: &str = "expand";
    pub const EXPANDED: &str = "expanded";
    pub const COLLAPSING: &str = "collapsing";
    pub const COLLAPSE: &str = "collapse";
    pub const COLLAPSED: &str = "collapsed";
    /// Terminal step every canceled pipeline fast-forwards to
    pub const FINISH: &str = "finish";

    /// Key prefix distinguishing the tree-scope step of an event
    pub const GLOBAL_PREFIX: &str = "global:";
}
