//! Contextual path registry.
//!
//! A build that runs partly on the host, partly inside a container and partly
//! from a staging tree that later becomes an image needs to name "the same"
//! location in three different coordinate spaces. Instead of keeping three
//! variables per location, every location is registered once under a stable
//! label and resolved against a *context*.
//!
//! # Model
//!
//! - A **context** is a coordinate space with its own root node, `basedir`.
//! - A **node** is a labelled path fragment with an optional parent label.
//!   Resolving a label walks the parent chain up to a node without a parent
//!   and concatenates the fragments.
//! - Directory nodes always resolve with a trailing `/`; file nodes don't.
//! - Registration selectors are a concrete context, `all`, or a
//!   `;`-separated list of contexts. Re-registering a label overwrites it.
//!
//! # Example
//!
//! ```
//! use convenient_paths::PathGraph;
//!
//! let mut graph = PathGraph::new();
//! graph.add_context("host", "/work/project").unwrap();
//! graph.add_context("container", "/home/dev/base").unwrap();
//!
//! graph.register("all", "out", "out", Some("basedir")).unwrap();
//! graph.register_file("all", "log", "build.log", Some("out")).unwrap();
//!
//! assert_eq!(graph.resolve("host", "out").unwrap(), "/work/project/out/");
//! assert_eq!(graph.resolve("container", "log").unwrap(), "/home/dev/base/out/build.log");
//!
//! graph.set_current("host").unwrap();
//! let host = graph.into_view().unwrap();
//! let container = host.pinned(Some("container")).unwrap();
//! assert_eq!(container.resolve("out").unwrap(), "/home/dev/base/out/");
//! assert_eq!(host.resolve("out").unwrap(), "/work/project/out/");
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

/// Label of the root node every context is created with.
pub const BASEDIR: &str = "basedir";

/// Selector that broadcasts a registration into every known context.
pub const ALL: &str = "all";

/// Error types for path registration and resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// The context was never added
    #[error("Unknown context: '{0}'")]
    UnknownContext(String),

    /// The label is not registered in the context
    #[error("No such path '{label}' in context '{context}'")]
    UnknownLabel {
        /// Context the lookup ran in
        context: String,
        /// Missing label
        label: String,
    },

    /// A context with this name already exists
    #[error("Context '{0}' already exists")]
    DuplicateContext(String),

    /// No current context has been pinned yet
    #[error("No current context: none set yet")]
    NoCurrentContext,

    /// The name cannot be used as a concrete context
    #[error("Invalid context name: '{0}'")]
    InvalidContext(String),

    /// `basedir` is created with the context and cannot be registered again
    #[error("Label '{0}' is reserved")]
    ReservedLabel(String),

    /// The parent chain loops back on itself
    #[error("Parent chain of '{label}' in context '{context}' contains a cycle")]
    Cycle {
        /// Context the lookup ran in
        context: String,
        /// Label whose resolution looped
        label: String,
    },
}

/// Result type for path operations.
pub type PathResult<T> = Result<T, PathError>;

/// A labelled path fragment inside one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathNode {
    fragment: String,
    parent: Option<String>,
    is_file: bool,
    broadcast: bool,
}

impl PathNode {
    /// Raw fragment appended to the parent's resolved path.
    #[must_use]
    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    /// Label of the parent node, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Whether the node names a file.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.is_file
    }
}

/// A label that was registered twice in the same context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redefinition {
    /// Context that holds the label
    pub context: String,
    /// The redefined label
    pub label: String,
    /// Fragment that was overwritten
    pub previous: String,
    /// Fragment now in effect
    pub current: String,
}

impl fmt::Display for Redefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} '{}' -> '{}'",
            self.context, self.label, self.previous, self.current
        )
    }
}

/// Label table for all contexts plus the pinned current context.
#[derive(Debug, Clone, Default)]
pub struct PathGraph {
    contexts: BTreeMap<String, HashMap<String, PathNode>>,
    current: Option<String>,
    redefinitions: Vec<Redefinition>,
}

impl PathGraph {
    /// Create an empty graph without contexts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new context whose `basedir` is `basedir`.
    ///
    /// # Errors
    ///
    /// `PathError::DuplicateContext` if the context exists and
    /// `PathError::InvalidContext` for the reserved name `all`.
    pub fn add_context(&mut self, name: &str, basedir: impl Into<String>) -> PathResult<()> {
        if name == ALL || name.contains(';') {
            return Err(PathError::InvalidContext(name.to_string()));
        }
        if self.contexts.contains_key(name) {
            return Err(PathError::DuplicateContext(name.to_string()));
        }

        let mut nodes = HashMap::new();
        let _ = nodes.insert(
            BASEDIR.to_string(),
            PathNode {
                fragment: basedir.into(),
                parent: None,
                is_file: false,
                broadcast: false,
            },
        );
        let _ = self.contexts.insert(name.to_string(), nodes);
        Ok(())
    }

    /// Names of all registered contexts, sorted.
    pub fn contexts(&self) -> impl Iterator<Item = &str> {
        self.contexts.keys().map(String::as_str)
    }

    /// Pin the current context.
    ///
    /// # Errors
    ///
    /// Fails for `all` and for contexts that were never added.
    pub fn set_current(&mut self, name: &str) -> PathResult<()> {
        if name.is_empty() || name == ALL {
            return Err(PathError::InvalidContext(name.to_string()));
        }
        self.check_context(name)?;
        self.current = Some(name.to_string());
        Ok(())
    }

    /// The pinned current context.
    ///
    /// # Errors
    ///
    /// `PathError::NoCurrentContext` if none was set.
    pub fn current(&self) -> PathResult<&str> {
        self.current.as_deref().ok_or(PathError::NoCurrentContext)
    }

    /// Register a directory node.
    ///
    /// `selector` is a context name, `all`, or a `;`-separated list.
    ///
    /// # Errors
    ///
    /// Fails if a selected context is unknown or `label` is `basedir`.
    pub fn register(
        &mut self,
        selector: &str,
        label: &str,
        fragment: impl Into<String>,
        parent: Option<&str>,
    ) -> PathResult<()> {
        self.insert(selector, label, fragment.into(), parent, false)
    }

    /// Register a file node; its resolved path carries no trailing separator.
    ///
    /// # Errors
    ///
    /// Same as [`PathGraph::register`].
    pub fn register_file(
        &mut self,
        selector: &str,
        label: &str,
        fragment: impl Into<String>,
        parent: Option<&str>,
    ) -> PathResult<()> {
        self.insert(selector, label, fragment.into(), parent, true)
    }

    fn insert(
        &mut self,
        selector: &str,
        label: &str,
        fragment: String,
        parent: Option<&str>,
        is_file: bool,
    ) -> PathResult<()> {
        if label == BASEDIR {
            return Err(PathError::ReservedLabel(label.to_string()));
        }

        let targets = self.select(selector)?;
        let broadcast = targets.len() > 1 || selector == ALL;

        for context in targets {
            let node = PathNode {
                fragment: fragment.clone(),
                parent: parent.map(str::to_string),
                is_file,
                broadcast,
            };
            let Some(nodes) = self.contexts.get_mut(&context) else {
                return Err(PathError::UnknownContext(context));
            };

            if let Some(previous) = nodes.insert(label.to_string(), node) {
                if previous.broadcast && !broadcast {
                    debug!(context = %context, label, "specializing broadcast path");
                } else {
                    let redefinition = Redefinition {
                        context: context.clone(),
                        label: label.to_string(),
                        previous: previous.fragment,
                        current: fragment.clone(),
                    };
                    warn!("Path label redefined: {}", redefinition);
                    self.redefinitions.push(redefinition);
                }
            }
        }

        Ok(())
    }

    /// Expand a selector into the list of concrete contexts it names.
    fn select(&self, selector: &str) -> PathResult<Vec<String>> {
        if selector == ALL {
            return Ok(self.contexts.keys().cloned().collect());
        }

        let mut selected = Vec::new();
        for name in selector.split(';').map(str::trim) {
            if name == ALL {
                return Ok(self.contexts.keys().cloned().collect());
            }
            self.check_context(name)?;
            if !selected.iter().any(|s| s == name) {
                selected.push(name.to_string());
            }
        }
        Ok(selected)
    }

    fn check_context(&self, name: &str) -> PathResult<()> {
        if self.contexts.contains_key(name) {
            Ok(())
        } else {
            Err(PathError::UnknownContext(name.to_string()))
        }
    }

    /// Redefinitions that were not a concrete specialization of a broadcast.
    #[must_use]
    pub fn redefinitions(&self) -> &[Redefinition] {
        &self.redefinitions
    }

    /// The node registered for `label` in `context`, if any.
    #[must_use]
    pub fn node(&self, context: &str, label: &str) -> Option<&PathNode> {
        self.contexts.get(context).and_then(|nodes| nodes.get(label))
    }

    /// Resolve `label` to an absolute path in `context`.
    ///
    /// # Errors
    ///
    /// - `PathError::UnknownContext` if the context was never added
    /// - `PathError::UnknownLabel` if the label (or a parent) is missing
    /// - `PathError::Cycle` if the parent chain loops
    pub fn resolve(&self, context: &str, label: &str) -> PathResult<String> {
        let nodes = self
            .contexts
            .get(context)
            .ok_or_else(|| PathError::UnknownContext(context.to_string()))?;

        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(label);

        while let Some(current) = next {
            if !seen.insert(current) {
                return Err(PathError::Cycle {
                    context: context.to_string(),
                    label: label.to_string(),
                });
            }
            let node = nodes.get(current).ok_or_else(|| PathError::UnknownLabel {
                context: context.to_string(),
                label: current.to_string(),
            })?;
            chain.push(node);
            next = node.parent.as_deref();
        }

        let mut path = String::new();
        for node in chain.iter().rev() {
            path.push_str(&node.fragment);
            if !node.is_file && !path.ends_with('/') {
                path.push('/');
            }
        }
        Ok(path)
    }

    /// Resolve without failing; `None` stands in for every error.
    #[must_use]
    pub fn try_resolve(&self, context: &str, label: &str) -> Option<String> {
        self.resolve(context, label).ok()
    }

    /// Freeze the table and return a view pinned to the current context.
    ///
    /// # Errors
    ///
    /// `PathError::NoCurrentContext` if no current context was set.
    pub fn into_view(self) -> PathResult<PathView> {
        let context = self.current()?.to_string();
        Ok(PathView {
            graph: Arc::new(self),
            context,
        })
    }
}

/// A shared, read-only label table pinned to one context.
///
/// Views are cheap to clone; [`PathView::pinned`] produces a view of the same
/// table in a different context without touching the original.
#[derive(Debug, Clone)]
pub struct PathView {
    graph: Arc<PathGraph>,
    context: String,
}

impl PathView {
    /// Context this view resolves against.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// The underlying label table.
    #[must_use]
    pub fn graph(&self) -> &PathGraph {
        &self.graph
    }

    /// A view of the same table pinned to `context`, or to this view's
    /// context when `None`.
    ///
    /// # Errors
    ///
    /// Fails if `context` is unknown or `all`.
    pub fn pinned(&self, context: Option<&str>) -> PathResult<PathView> {
        let context = context.unwrap_or(&self.context);
        if context == ALL {
            return Err(PathError::InvalidContext(context.to_string()));
        }
        self.graph.check_context(context)?;
        Ok(PathView {
            graph: Arc::clone(&self.graph),
            context: context.to_string(),
        })
    }

    /// Resolve `label` in the pinned context.
    ///
    /// # Errors
    ///
    /// See [`PathGraph::resolve`].
    pub fn resolve(&self, label: &str) -> PathResult<String> {
        self.graph.resolve(&self.context, label)
    }

    /// Resolve `label` in the pinned context as a `PathBuf`.
    ///
    /// # Errors
    ///
    /// See [`PathGraph::resolve`].
    pub fn path(&self, label: &str) -> PathResult<PathBuf> {
        self.resolve(label).map(PathBuf::from)
    }

    /// Resolve `label` in the pinned context, `None` on any failure.
    #[must_use]
    pub fn try_resolve(&self, label: &str) -> Option<String> {
        self.graph.try_resolve(&self.context, label)
    }

    /// Resolve `label` in another context without re-pinning.
    ///
    /// # Errors
    ///
    /// See [`PathGraph::resolve`].
    pub fn resolve_in(&self, context: &str, label: &str) -> PathResult<String> {
        self.graph.resolve(context, label)
    }
}
