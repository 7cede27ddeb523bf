use super::{ErrorHandlerDefinition, ProcessorDefinition};

/// A complete route: one consuming endpoint and the steps every exchange
/// from it runs through.
#[derive(Debug, Clone)]
pub struct RouteDefinition {
    pub id: String,
    /// URI of the consuming endpoint. May contain placeholders.
    pub from: String,
    pub outputs: Vec<ProcessorDefinition>,
    /// Route-scoped error handler. Falls back to the engine default.
    pub error_handler: Option<ErrorHandlerDefinition>,
    pub description: Option<String>,
    /// Started by `EngineContext::start`. Routes with `false` are started
    /// explicitly with `EngineContext::start_route`.
    pub auto_startup: bool,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            outputs: Vec::new(),
            error_handler: None,
            description: None,
            auto_startup: true,
        }
    }

    /// Total number of nodes in the route, including nested ones.
    #[must_use]
    pub fn node_count(&self) -> usize {
        fn count(nodes: &[ProcessorDefinition]) -> usize {
            nodes
                .iter()
                .map(|node| {
                    let nested = match &node.node {
                        super::Node::Choice(choice) => {
                            choice
                                .whens
                                .iter()
                                .map(|when| 1 + count(&when.outputs))
                                .sum::<usize>()
                                + choice.otherwise.as_ref().map_or(0, |o| 1 + count(&o.outputs))
                        }
                        super::Node::Try(def) => {
                            count(&def.outputs)
                                + def.catches.iter().map(|c| 1 + count(&c.outputs)).sum::<usize>()
                                + def.finally.as_ref().map_or(0, |f| 1 + count(&f.outputs))
                        }
                        _ => count(node.outputs()),
                    };
                    1 + nested
                })
                .sum()
        }
        count(&self.outputs)
    }
}
