//! Arena-backed scene graph with cached world transforms

use std::collections::HashSet;
use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};
use thiserror::Error;

use crate::backend::GraphicsBackend;
use crate::pipeline::{LoadContext, ModelHandle, Pass};
use crate::scene::Transform;

/// Scene graph error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("Node {0:?} does not exist")]
    StaleNode(NodeId),
    #[error("Attaching {child:?} under {parent:?} would create a cycle")]
    WouldCreateCycle { parent: NodeId, child: NodeId },
}

pub type SceneResult<T> = Result<T, SceneError>;

/// Generational index of a node in a [`SceneGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// One transform node
#[derive(Clone)]
pub struct SceneNode {
    transform: Transform,
    local: Mat4,
    world: Mat4,
    local_dirty: bool,
    world_dirty: bool,
    model: Option<ModelHandle>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl SceneNode {
    fn new() -> Self {
        Self {
            transform: Transform::default(),
            local: Mat4::IDENTITY,
            world: Mat4::IDENTITY,
            local_dirty: true,
            world_dirty: true,
            model: None,
            parent: None,
            children: Vec::new(),
        }
    }
}

struct Slot {
    generation: u32,
    node: Option<SceneNode>,
}

/// Tree of transform nodes addressed by [`NodeId`]
#[derive(Default)]
pub struct SceneGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn create_node(&mut self) -> NodeId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(SceneNode::new());
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            node: Some(SceneNode::new()),
        });
        NodeId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Create a node with a transform, attached under `parent` when given
    pub fn spawn(&mut self, parent: Option<NodeId>, transform: Transform) -> SceneResult<NodeId> {
        if let Some(parent) = parent {
            self.node(parent)?;
        }
        let id = self.create_node();
        self.set_local_transform(id, transform)?;
        if let Some(parent) = parent {
            self.add_child(parent, id)?;
        }
        Ok(id)
    }

    /// Remove a node; its children become roots and its model is returned
    pub fn remove_node(&mut self, id: NodeId) -> SceneResult<Option<ModelHandle>> {
        let parent = self.node(id)?.parent;
        if let Some(parent) = parent {
            self.detach_child(parent, id)?;
        }

        let children = std::mem::take(&mut self.node_mut(id)?.children);
        for child in children {
            if let Ok(node) = self.node_mut(child) {
                node.parent = None;
            }
            self.mark_world_dirty(child);
        }

        let slot = &mut self.slots[id.index as usize];
        let node = slot.node.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Ok(node.and_then(|n| n.model))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    fn node(&self, id: NodeId) -> SceneResult<&SceneNode> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(SceneError::StaleNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> SceneResult<&mut SceneNode> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(SceneError::StaleNode(id))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).ok().and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> Option<&[NodeId]> {
        self.node(id).ok().map(|n| n.children.as_slice())
    }

    pub fn model(&self, id: NodeId) -> Option<&ModelHandle> {
        self.node(id).ok().and_then(|n| n.model.as_ref())
    }

    pub fn local_transform(&self, id: NodeId) -> Option<Transform> {
        self.node(id).ok().map(|n| n.transform)
    }

    pub fn local_scale(&self, id: NodeId) -> Option<Vec3> {
        self.node(id).ok().map(|n| n.transform.scale)
    }

    pub fn local_orientation(&self, id: NodeId) -> Option<Quat> {
        self.node(id).ok().map(|n| n.transform.orientation)
    }

    pub fn local_translation(&self, id: NodeId) -> Option<Vec3> {
        self.node(id).ok().map(|n| n.transform.translation)
    }

    pub fn is_world_dirty(&self, id: NodeId) -> Option<bool> {
        self.node(id).ok().map(|n| n.world_dirty)
    }

    pub fn is_local_dirty(&self, id: NodeId) -> Option<bool> {
        self.node(id).ok().map(|n| n.local_dirty)
    }

    pub fn set_local_scale(&mut self, id: NodeId, scale: Vec3) -> SceneResult<()> {
        self.node_mut(id)?.transform.scale = scale;
        self.invalidate_local(id);
        Ok(())
    }

    pub fn set_local_orientation(&mut self, id: NodeId, orientation: Quat) -> SceneResult<()> {
        self.node_mut(id)?.transform.orientation = orientation;
        self.invalidate_local(id);
        Ok(())
    }

    pub fn set_local_translation(&mut self, id: NodeId, translation: Vec3) -> SceneResult<()> {
        self.node_mut(id)?.transform.translation = translation;
        self.invalidate_local(id);
        Ok(())
    }

    pub fn set_local_transform(&mut self, id: NodeId, transform: Transform) -> SceneResult<()> {
        self.node_mut(id)?.transform = transform;
        self.invalidate_local(id);
        Ok(())
    }

    fn invalidate_local(&mut self, id: NodeId) {
        if let Ok(node) = self.node_mut(id) {
            node.local_dirty = true;
        }
        self.mark_world_dirty(id);
    }

    /// Mark `id` and its subtree world-dirty.
    ///
    /// Stops descending at nodes that are already dirty: a dirty node's
    /// descendants are always dirty too.
    fn mark_world_dirty(&mut self, id: NodeId) {
        let mut stack = vec![id];
        let mut first = true;
        while let Some(current) = stack.pop() {
            let Ok(node) = self.node_mut(current) else {
                continue;
            };
            if node.world_dirty && !first {
                continue;
            }
            first = false;
            node.world_dirty = true;
            stack.extend(node.children.iter().copied());
        }
    }

    /// Local matrix `T * R * S`, recomputed only after a local mutation
    pub fn calc_local_transform(&mut self, id: NodeId) -> SceneResult<Mat4> {
        let node = self.node_mut(id)?;
        if node.local_dirty {
            node.local = node.transform.matrix();
            node.local_dirty = false;
            node.world_dirty = true;
        }
        Ok(node.local)
    }

    /// World matrix `parent.world * local`, recomputed only when dirty
    pub fn calc_world_transform(&mut self, id: NodeId) -> SceneResult<Mat4> {
        // Collect the dirty chain up to the first clean ancestor
        let mut chain = Vec::new();
        let mut base = Mat4::IDENTITY;
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id)?;
            if !node.world_dirty {
                base = node.world;
                break;
            }
            chain.push(node_id);
            current = node.parent;
        }

        for node_id in chain.into_iter().rev() {
            let local = self.calc_local_transform(node_id)?;
            let node = self.node_mut(node_id)?;
            node.world = base * local;
            node.world_dirty = false;
            base = node.world;
        }
        Ok(base)
    }

    fn is_ancestor(&self, ancestor: NodeId, of: NodeId) -> bool {
        let mut current = Some(of);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Attach `child` under `parent`, detaching it from any previous parent.
    ///
    /// Attaching a node to its current parent changes nothing.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> SceneResult<()> {
        self.node(parent)?;
        let old_parent = self.node(child)?.parent;
        if old_parent == Some(parent) {
            return Ok(());
        }
        if self.is_ancestor(child, parent) {
            return Err(SceneError::WouldCreateCycle { parent, child });
        }

        if let Some(old_parent) = old_parent {
            self.detach_child(old_parent, child)?;
        }

        self.node_mut(parent)?.children.push(child);
        self.node_mut(child)?.parent = Some(parent);
        self.mark_world_dirty(child);
        Ok(())
    }

    /// Detach `child` from `parent`; returns false if it was not a child
    pub fn detach_child(&mut self, parent: NodeId, child: NodeId) -> SceneResult<bool> {
        let parent_node = self.node_mut(parent)?;
        let Some(position) = parent_node.children.iter().position(|c| *c == child) else {
            return Ok(false);
        };
        parent_node.children.remove(position);

        self.node_mut(child)?.parent = None;
        self.mark_world_dirty(child);
        Ok(true)
    }

    /// Attach a model, returning the one previously held
    pub fn grab_model(&mut self, id: NodeId, model: ModelHandle) -> SceneResult<Option<ModelHandle>> {
        Ok(self.node_mut(id)?.model.replace(model))
    }

    pub fn drop_model(&mut self, id: NodeId) -> SceneResult<Option<ModelHandle>> {
        Ok(self.node_mut(id)?.model.take())
    }

    /// Draw the subtree rooted at `root` for one pass.
    ///
    /// Visits nodes depth first in child insertion order; each model whose
    /// pass mask contains the pass type receives its node's world matrix.
    pub fn render(
        &mut self,
        root: NodeId,
        pass: &Pass,
        backend: &mut dyn GraphicsBackend,
    ) -> SceneResult<()> {
        self.node(root)?;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let world = self.calc_world_transform(id)?;
            let node = self.node(id)?;
            if let Some(model) = &node.model {
                if model.passes().contains(pass.pass_type) && model.is_loaded() {
                    model.render(pass, &world, backend);
                }
            }
            stack.extend(node.children.iter().rev().copied());
        }
        Ok(())
    }

    fn unique_models(&self) -> Vec<ModelHandle> {
        let mut seen = HashSet::new();
        self.slots
            .iter()
            .filter_map(|slot| slot.node.as_ref())
            .filter_map(|node| node.model.clone())
            .filter(|model| seen.insert(Arc::as_ptr(model) as *const () as usize))
            .collect()
    }

    /// Load every attached model once; failures are logged and skipped.
    ///
    /// Returns the number of models that loaded.
    pub fn load_models(&self, ctx: &mut LoadContext<'_>) -> usize {
        let mut loaded = 0;
        for model in self.unique_models() {
            if model.is_loaded() {
                loaded += 1;
                continue;
            }
            match model.load(ctx) {
                Ok(()) => loaded += 1,
                Err(e) => {
                    log::error!("Model '{}' failed to load: {}", model.name(), e);
                    model.unload(&mut *ctx.backend);
                }
            }
        }
        log::info!("Loaded {} scene models", loaded);
        loaded
    }

    pub fn unload_models(&self, backend: &mut dyn GraphicsBackend) {
        for model in self.unique_models() {
            model.unload(backend);
        }
    }
}
