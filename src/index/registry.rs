//! Name-based construction of index nodes.

use super::flat::{BinaryFlatIndexNode, FlatIndexNode};
use super::ivf_gpu::{GpuIvfIndexNode, GpuIvfKind};
use super::node::{IndexContext, IndexNode};
use crate::error::{AnnexError, Result};
use std::collections::HashMap;

/// Constructor stored in the factory.
pub type IndexCreator = fn(&IndexContext) -> Result<Box<dyn IndexNode>>;

fn create_flat(ctx: &IndexContext) -> Result<Box<dyn IndexNode>> {
    Ok(Box::new(FlatIndexNode::new(ctx.clone())))
}

fn create_bin_flat(ctx: &IndexContext) -> Result<Box<dyn IndexNode>> {
    Ok(Box::new(BinaryFlatIndexNode::new(ctx.clone())))
}

fn create_gpu(ctx: &IndexContext, kind: GpuIvfKind) -> Result<Box<dyn IndexNode>> {
    ctx.require_devices()?;
    Ok(Box::new(GpuIvfIndexNode::new(ctx.clone(), kind)))
}

fn create_gpu_ivf_flat(ctx: &IndexContext) -> Result<Box<dyn IndexNode>> {
    create_gpu(ctx, GpuIvfKind::Flat)
}

fn create_gpu_ivf_pq(ctx: &IndexContext) -> Result<Box<dyn IndexNode>> {
    create_gpu(ctx, GpuIvfKind::Pq)
}

fn create_gpu_ivf_sq8(ctx: &IndexContext) -> Result<Box<dyn IndexNode>> {
    create_gpu(ctx, GpuIvfKind::Sq8)
}

/// Registry mapping index type names to constructors.
///
/// ```
/// use annex::{ExecutorConfig, IndexContext, IndexFactory, IndexState, QueryExecutor};
/// use std::sync::Arc;
///
/// let executor = Arc::new(QueryExecutor::new(ExecutorConfig::with_threads(2)).unwrap());
/// let factory = IndexFactory::new();
/// let node = factory.create("FLAT", &IndexContext::new(executor)).unwrap();
/// assert_eq!(node.state(), IndexState::Empty);
/// ```
#[derive(Debug, Clone)]
pub struct IndexFactory {
    creators: HashMap<String, IndexCreator>,
}

impl Default for IndexFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexFactory {
    /// Factory with every built-in variant registered.
    pub fn new() -> Self {
        let mut factory = Self::empty();
        factory.register("FLAT", create_flat);
        factory.register("BINFLAT", create_bin_flat);
        factory.register("BIN_FLAT", create_bin_flat);
        factory.register(GpuIvfKind::Flat.name(), create_gpu_ivf_flat);
        factory.register(GpuIvfKind::Pq.name(), create_gpu_ivf_pq);
        factory.register(GpuIvfKind::Sq8.name(), create_gpu_ivf_sq8);
        factory
    }

    /// Factory with nothing registered.
    pub fn empty() -> Self {
        Self {
            creators: HashMap::new(),
        }
    }

    /// Register (or replace) a constructor under `name`.
    pub fn register(&mut self, name: impl Into<String>, creator: IndexCreator) {
        self.creators.insert(name.into(), creator);
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.creators.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.creators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct an empty node of type `name`.
    pub fn create(&self, name: &str, ctx: &IndexContext) -> Result<Box<dyn IndexNode>> {
        let creator = self
            .creators
            .get(name)
            .ok_or_else(|| AnnexError::UnknownIndexType(name.to_string()))?;
        creator(ctx)
    }
}
