//! Host model collaborator interface.
//!
//! The host (text encoder or U-Net) is seen only as a tree of named modules
//! whose leaves are frozen layers. Each leaf lives in a [`LayerSlot`]; the
//! host's forward pass calls [`LayerSlot::forward`], which is where adapters
//! splice themselves in.

use std::sync::Arc;

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Linear};
use parking_lot::RwLock;

/// Closed classification of leaf layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    /// Dense / linear layer
    Dense,
    /// 2D convolution with a (square) kernel
    Conv2d {
        /// First spatial dimension of the kernel
        kernel_size: usize,
    },
    /// Anything else (norms, embeddings, ...)
    Other,
}

/// A frozen host layer.
pub enum HostLayer {
    /// Dense layer
    Linear(Linear),
    /// 2D convolution
    Conv2d(Conv2d),
    /// Any other layer, never adapted
    Other {
        /// Declared type name
        type_name: String,
        /// The layer itself
        module: Box<dyn Module + Send + Sync>,
    },
}

impl HostLayer {
    /// Wrap an arbitrary module that is not eligible for adaptation.
    pub fn other(type_name: impl Into<String>, module: impl Module + Send + Sync + 'static) -> Self {
        Self::Other {
            type_name: type_name.into(),
            module: Box::new(module),
        }
    }

    /// Declared type name, as the host framework reports it.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Linear(_) => "Linear",
            Self::Conv2d(_) => "Conv2d",
            Self::Other { type_name, .. } => type_name,
        }
    }

    /// Capability query used by discovery.
    #[must_use]
    pub fn kind(&self) -> LeafKind {
        match self {
            Self::Linear(_) => LeafKind::Dense,
            Self::Conv2d(conv) => LeafKind::Conv2d {
                kernel_size: conv.weight().dims().get(2).copied().unwrap_or(1),
            },
            Self::Other { .. } => LeafKind::Other,
        }
    }

    /// Weight tensor of dense and conv layers.
    #[must_use]
    pub fn weight(&self) -> Option<&Tensor> {
        match self {
            Self::Linear(linear) => Some(linear.weight()),
            Self::Conv2d(conv) => Some(conv.weight()),
            Self::Other { .. } => None,
        }
    }
}

impl Module for HostLayer {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Linear(linear) => linear.forward(xs),
            Self::Conv2d(conv) => conv.forward(xs),
            Self::Other { module, .. } => module.forward(xs),
        }
    }
}

impl std::fmt::Debug for HostLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLayer")
            .field("type_name", &self.type_name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Something spliced into a layer's call path.
pub trait LayerHook: Send + Sync {
    /// Receive the output of the call path so far and return the new output.
    ///
    /// # Errors
    ///
    /// Returns an error if the hook's computation fails.
    fn hook_forward(&self, input: &Tensor, output: Tensor) -> candle_core::Result<Tensor>;
}

/// A host leaf together with the chain of hooks attached to it.
pub struct LayerSlot {
    layer: HostLayer,
    hooks: RwLock<Vec<Arc<dyn LayerHook>>>,
}

impl LayerSlot {
    /// Create a new slot holding `layer`.
    #[must_use]
    pub fn new(layer: HostLayer) -> Arc<Self> {
        Arc::new(Self {
            layer,
            hooks: RwLock::new(Vec::new()),
        })
    }

    /// The frozen base layer.
    #[must_use]
    pub fn layer(&self) -> &HostLayer {
        &self.layer
    }

    /// Run the base layer only, bypassing every hook.
    ///
    /// # Errors
    ///
    /// Returns an error if the base layer fails.
    pub fn base_forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.layer.forward(xs)
    }

    /// Append a hook on top of the current call path.
    pub fn attach(&self, hook: Arc<dyn LayerHook>) {
        self.hooks.write().push(hook);
    }

    /// Remove a previously attached hook. Returns `false` if it was not attached.
    pub fn detach(&self, hook: &Arc<dyn LayerHook>) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| !Arc::ptr_eq(h, hook));
        hooks.len() != before
    }

    /// Number of hooks currently attached.
    #[must_use]
    pub fn num_hooks(&self) -> usize {
        self.hooks.read().len()
    }

    /// Whether any hook is attached.
    #[must_use]
    pub fn is_hooked(&self) -> bool {
        self.num_hooks() > 0
    }
}

impl Module for LayerSlot {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let hooks = self.hooks.read().clone();
        let mut out = self.layer.forward(xs)?;
        for hook in &hooks {
            out = hook.hook_forward(xs, out)?;
        }
        Ok(out)
    }
}

impl std::fmt::Debug for LayerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerSlot")
            .field("layer", &self.layer)
            .field("hooks", &self.num_hooks())
            .finish()
    }
}

/// Traversable host module tree.
pub trait HostModule {
    /// Declared type name of this node (e.g. `CLIPAttention`).
    fn type_name(&self) -> &str;

    /// Named children in declaration order.
    fn children(&self) -> Vec<(&str, &dyn HostModule)>;

    /// The leaf layer, if this node is one.
    fn layer(&self) -> Option<&Arc<LayerSlot>> {
        None
    }
}

/// All modules below `root` (root included, with an empty path), depth first
/// in declaration order, with dotted paths.
#[must_use]
pub fn named_modules(root: &dyn HostModule) -> Vec<(String, &dyn HostModule)> {
    let mut out = Vec::new();
    collect_modules(String::new(), root, &mut out);
    out
}

fn collect_modules<'a>(
    path: String,
    module: &'a dyn HostModule,
    out: &mut Vec<(String, &'a dyn HostModule)>,
) {
    let children = module.children();
    out.push((path.clone(), module));
    for (name, child) in children {
        let child_path = if path.is_empty() {
            name.to_string()
        } else {
            format!("{path}.{name}")
        };
        collect_modules(child_path, child, out);
    }
}

/// Generic host tree node: a typed container or a leaf holding a layer.
#[derive(Debug)]
pub struct ModuleNode {
    type_name: String,
    children: Vec<(String, ModuleNode)>,
    layer: Option<Arc<LayerSlot>>,
}

impl ModuleNode {
    /// Create an empty container.
    #[must_use]
    pub fn container(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            children: Vec::new(),
            layer: None,
        }
    }

    /// Create a leaf around `layer`.
    #[must_use]
    pub fn leaf(layer: HostLayer) -> Self {
        Self {
            type_name: layer.type_name().to_string(),
            children: Vec::new(),
            layer: Some(LayerSlot::new(layer)),
        }
    }

    /// Builder-style [`ModuleNode::push_child`].
    #[must_use]
    pub fn with_child(mut self, name: impl Into<String>, child: ModuleNode) -> Self {
        self.push_child(name, child);
        self
    }

    /// Append a named child.
    pub fn push_child(&mut self, name: impl Into<String>, child: ModuleNode) {
        self.children.push((name.into(), child));
    }

    /// Look up a descendant by dotted path (empty path is `self`).
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ModuleNode> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |node, part| {
            node.children
                .iter()
                .find(|(name, _)| name == part)
                .map(|(_, child)| child)
        })
    }

    /// Slot of the leaf at `path`.
    #[must_use]
    pub fn slot(&self, path: &str) -> Option<&Arc<LayerSlot>> {
        self.get(path).and_then(|node| node.layer.as_ref())
    }
}

impl HostModule for ModuleNode {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn children(&self) -> Vec<(&str, &dyn HostModule)> {
        self.children
            .iter()
            .map(|(name, child)| (name.as_str(), child as &dyn HostModule))
            .collect()
    }

    fn layer(&self) -> Option<&Arc<LayerSlot>> {
        self.layer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    struct AddOne;

    impl LayerHook for AddOne {
        fn hook_forward(&self, _input: &Tensor, output: Tensor) -> candle_core::Result<Tensor> {
            output.affine(1.0, 1.0)
        }
    }

    fn linear(device: &Device) -> HostLayer {
        let weight = Tensor::eye(3, DType::F32, device).unwrap();
        HostLayer::Linear(Linear::new(weight, None))
    }

    #[test]
    fn test_named_modules_order() {
        let device = Device::Cpu;
        let tree = ModuleNode::container("Root")
            .with_child(
                "a",
                ModuleNode::container("Block").with_child("fc", ModuleNode::leaf(linear(&device))),
            )
            .with_child("b", ModuleNode::leaf(linear(&device)));

        let paths: Vec<String> = named_modules(&tree).into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["", "a", "a.fc", "b"]);
    }

    #[test]
    fn test_leaf_kind() {
        let device = Device::Cpu;
        assert_eq!(linear(&device).kind(), LeafKind::Dense);

        let weight = Tensor::zeros((4, 2, 3, 3), DType::F32, &device).unwrap();
        let conv = HostLayer::Conv2d(Conv2d::new(weight, None, Default::default()));
        assert_eq!(conv.kind(), LeafKind::Conv2d { kernel_size: 3 });
        assert_eq!(conv.type_name(), "Conv2d");
    }

    #[test]
    fn test_get_by_path() {
        let device = Device::Cpu;
        let tree = ModuleNode::container("Root").with_child(
            "a",
            ModuleNode::container("Block").with_child("fc", ModuleNode::leaf(linear(&device))),
        );
        assert_eq!(tree.get("a").map(HostModule::type_name), Some("Block"));
        assert!(tree.slot("a.fc").is_some());
        assert!(tree.slot("a").is_none());
        assert!(tree.get("a.missing").is_none());
    }

    #[test]
    fn test_hook_chain_attach_detach() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let slot = LayerSlot::new(linear(&device));
        let input = Tensor::ones((1, 3), DType::F32, &device)?;

        let hook: Arc<dyn LayerHook> = Arc::new(AddOne);
        slot.attach(Arc::clone(&hook));
        slot.attach(Arc::new(AddOne));
        assert_eq!(slot.num_hooks(), 2);

        let out: Vec<f32> = slot.forward(&input)?.flatten_all()?.to_vec1()?;
        assert_eq!(out, vec![3.0, 3.0, 3.0]);

        assert!(slot.detach(&hook));
        assert!(!slot.detach(&hook));
        let out: Vec<f32> = slot.forward(&input)?.flatten_all()?.to_vec1()?;
        assert_eq!(out, vec![2.0, 2.0, 2.0]);

        let base: Vec<f32> = slot.base_forward(&input)?.flatten_all()?.to_vec1()?;
        assert_eq!(base, vec![1.0, 1.0, 1.0]);
        Ok(())
    }
}
