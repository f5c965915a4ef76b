//! Render Graph
//!
//! Converts a user-recorded DAG of virtual passes and resources into an
//! executable plan: which passes survive culling, which physical memory
//! backs each virtual resource, which barriers precede each pass, how many
//! command lists record in parallel, and in what order they submit.
//!
//! # Frame Lifecycle
//!
//! 1. **Record**: user code declares resources and passes.
//! 2. **Compile**: dependency linking → culling → lifetime/usage inference →
//!    placement + transitions → event resolution → job grouping.
//! 3. **Execute**: command lists record (in parallel), submit in declaration
//!    order, exports are satisfied.
//!
//! Submission order equals declaration order; parallelism exists only in
//! command-list recording, so GPU-observable ordering is deterministic.

use std::ops::Range;

use crate::rhi::{
    AnyResource, Buffer, BufferDesc, BufferFlags, CommandContext, GraphicsDevice, Ref,
    RenderPassColorFlags, RenderPassDepthFlags, ResourceState, SyncPoint, Texture, TextureDesc,
    TextureFlags,
};

use super::allocator::RGResourceAllocator;
use super::blackboard::RGBlackboard;
use super::pass::{
    AliasBarrier, DepthStencilAccess, PassCallback, RGEvent, RGEventId, RGPass, RGPassFlags,
    RGResources, RenderTargetAccess, ResourceTransition, MAX_PASS_CALLBACK_SIZE,
};
use super::resources::{
    BufferSlot, RGBufferHandle, RGPassId, RGResource, RGResourceDesc, RGResourceId,
    RGResourceType, RGTextureHandle, TextureSlot,
};

/// Compile/execute options.
#[derive(Clone, Copy, Debug)]
pub struct RGGraphOptions {
    /// Place transient resources into aliased heap memory. When off, each
    /// transient gets its own pooled allocation.
    pub resource_aliasing: bool,
    /// Split execution into multiple command lists recorded as jobs.
    pub jobify: bool,
    /// Cull passes that feed no imported/exported/never-cull output.
    pub pass_culling: bool,
    /// Record state transitions (off only for debugging).
    pub state_tracking: bool,
    /// Record inline on the calling thread instead of the worker pool.
    pub single_thread: bool,
    /// Maximum passes per command list.
    pub commandlist_group_size: u32,
}

impl Default for RGGraphOptions {
    fn default() -> Self {
        Self {
            resource_aliasing: true,
            jobify: true,
            pass_culling: true,
            state_tracking: true,
            single_thread: false,
            commandlist_group_size: 10,
        }
    }
}

/// The render graph. Lives for one frame; `'g` ties exported-slot borrows to
/// the graph's lifetime.
pub struct RGGraph<'g> {
    /// Cross-pass data store for the systems recording into this graph.
    pub blackboard: RGBlackboard,

    passes: Vec<RGPass>,
    resources: Vec<RGResource>,
    events: Vec<RGEvent>,
    pending_events: Vec<RGEventId>,
    export_textures: Vec<(RGResourceId, &'g mut TextureSlot)>,
    export_buffers: Vec<(RGResourceId, &'g mut BufferSlot)>,
    execute_groups: Vec<Range<usize>>,
    options: RGGraphOptions,
    compiled: bool,
}

impl Default for RGGraph<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'g> RGGraph<'g> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blackboard: RGBlackboard::new(),
            passes: Vec::new(),
            resources: Vec::new(),
            events: Vec::new(),
            pending_events: Vec::new(),
            export_textures: Vec::new(),
            export_buffers: Vec::new(),
            execute_groups: Vec::new(),
            options: RGGraphOptions::default(),
            compiled: false,
        }
    }

    // ── Recording: resources ───────────────────────────────────────────────

    /// Declares a transient virtual texture.
    pub fn create_texture(&mut self, name: &str, desc: TextureDesc) -> RGTextureHandle {
        let id = RGResourceId::new(self.resources.len());
        self.resources
            .push(RGResource::new(name, id, RGResourceDesc::Texture(desc), None));
        RGTextureHandle::new(id)
    }

    /// Declares a transient virtual buffer.
    pub fn create_buffer(&mut self, name: &str, desc: BufferDesc) -> RGBufferHandle {
        let id = RGResourceId::new(self.resources.len());
        self.resources
            .push(RGResource::new(name, id, RGResourceDesc::Buffer(desc), None));
        RGBufferHandle::new(id)
    }

    /// Registers a pre-existing physical texture.
    pub fn import_texture(&mut self, texture: &Ref<Texture>) -> RGTextureHandle {
        let id = RGResourceId::new(self.resources.len());
        self.resources.push(RGResource::new(
            &texture.name(),
            id,
            RGResourceDesc::Texture(*texture.desc()),
            Some(AnyResource::Texture(texture.clone())),
        ));
        RGTextureHandle::new(id)
    }

    /// Imports `texture` if present, else `fallback`, else returns `None`.
    pub fn try_import_texture(
        &mut self,
        texture: Option<&Ref<Texture>>,
        fallback: Option<&Ref<Texture>>,
    ) -> Option<RGTextureHandle> {
        texture.or(fallback).map(|t| self.import_texture(t))
    }

    /// Registers a pre-existing physical buffer.
    pub fn import_buffer(&mut self, buffer: &Ref<Buffer>) -> RGBufferHandle {
        let id = RGResourceId::new(self.resources.len());
        self.resources.push(RGResource::new(
            &buffer.name(),
            id,
            RGResourceDesc::Buffer(*buffer.desc()),
            Some(AnyResource::Buffer(buffer.clone())),
        ));
        RGBufferHandle::new(id)
    }

    /// At execute time, writes the final physical texture into `slot`.
    ///
    /// The exclusive borrow makes exporting two resources into one slot
    /// unrepresentable; no runtime check is needed.
    pub fn export_texture(
        &mut self,
        handle: RGTextureHandle,
        slot: &'g mut TextureSlot,
        additional_flags: TextureFlags,
    ) {
        let resource = &mut self.resources[handle.id.index()];
        resource.exported = true;
        if let RGResourceDesc::Texture(desc) = &mut resource.desc {
            desc.flags |= additional_flags;
        }
        self.export_textures.push((handle.id, slot));
    }

    /// At execute time, writes the final physical buffer into `slot`.
    pub fn export_buffer(
        &mut self,
        handle: RGBufferHandle,
        slot: &'g mut BufferSlot,
        additional_flags: BufferFlags,
    ) {
        let resource = &mut self.resources[handle.id.index()];
        resource.exported = true;
        if let RGResourceDesc::Buffer(desc) = &mut resource.desc {
            desc.flags |= additional_flags;
        }
        self.export_buffers.push((handle.id, slot));
    }

    /// Finds a declared texture by name.
    #[must_use]
    pub fn find_texture(&self, name: &str) -> Option<RGTextureHandle> {
        self.resources
            .iter()
            .find(|r| r.resource_type() == RGResourceType::Texture && r.name == name)
            .map(|r| RGTextureHandle::new(r.id))
    }

    #[must_use]
    pub fn resource(&self, id: RGResourceId) -> &RGResource {
        &self.resources[id.index()]
    }

    #[must_use]
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    #[must_use]
    pub fn pass(&self, id: RGPassId) -> &RGPass {
        &self.passes[id.index()]
    }

    /// Command-list group ranges computed at compile.
    #[must_use]
    pub fn execute_groups(&self) -> &[Range<usize>] {
        &self.execute_groups
    }

    // ── Recording: passes ──────────────────────────────────────────────────

    /// Declares a new pass. Passes execute in declaration order.
    pub fn add_pass<'a>(&'a mut self, name: &str, flags: RGPassFlags) -> RGPassBuilder<'a, 'g> {
        let id = RGPassId::new(self.passes.len());
        let mut pass = RGPass::new(name, id, flags);
        pass.events_to_start = std::mem::take(&mut self.pending_events);
        self.passes.push(pass);
        RGPassBuilder {
            graph: self,
            pass_index: id.index(),
        }
    }

    // ── Recording: profile events ──────────────────────────────────────────

    /// Opens a nested profile scope attached to the next declared pass.
    pub fn push_event(&mut self, name: &str) {
        self.push_event_at(name, "", 0);
    }

    pub fn push_event_at(&mut self, name: &str, file: &'static str, line: u32) {
        let id = self.events.len() as RGEventId;
        self.events.push(RGEvent {
            name: name.to_string(),
            file,
            line,
        });
        self.pending_events.push(id);
    }

    /// Closes the innermost open profile scope.
    pub fn pop_event(&mut self) {
        if self.pending_events.pop().is_none() {
            let pass = self
                .passes
                .last_mut()
                .expect("PopEvent without a matching PushEvent or pass");
            pass.num_events_to_end += 1;
        }
    }

    /// RAII profile scope covering all passes declared while it is alive.
    pub fn scoped<'a>(&'a mut self, name: &str) -> RGGraphScope<'a, 'g> {
        self.push_event(name);
        RGGraphScope { graph: self }
    }

    // ── Compile ────────────────────────────────────────────────────────────

    /// Compiles the recorded graph into an execution plan. Idempotent in
    /// result: the same graph against the same allocator state yields the
    /// same pass ordering, transitions and placement.
    pub fn compile(
        &mut self,
        device: &GraphicsDevice,
        allocator: &mut RGResourceAllocator,
        options: RGGraphOptions,
    ) {
        assert!(!self.compiled, "Graph is already compiled");
        self.options = options;

        self.cull_passes();
        self.compute_resource_usage();
        allocator.allocate_resources(device, &mut self.resources, options.resource_aliasing);
        self.record_transitions();
        self.resolve_events();
        self.group_passes();

        log::debug!(
            "Graph compiled: {} passes ({} live), {} resources, {} groups",
            self.passes.len(),
            self.passes.iter().filter(|p| !p.culled).count(),
            self.resources.len(),
            self.execute_groups.len()
        );
        self.compiled = true;
    }

    /// Dependency linking + dead-pass culling.
    ///
    /// Walks passes in declaration order wiring each access to the last
    /// writer of its resource, then floods liveness from never-cull passes
    /// and the writers of imported/exported resources.
    fn cull_passes(&mut self) {
        if !self.options.pass_culling {
            for pass in &mut self.passes {
                pass.culled = false;
            }
            return;
        }

        let mut cull_stack: Vec<RGPassId> = Vec::with_capacity(self.passes.len());

        for pass in &mut self.passes {
            for access_index in 0..pass.accesses.len() {
                let access = pass.accesses[access_index];
                let resource = &mut self.resources[access.resource.index()];

                if resource.last_write.is_valid() && !pass.dependencies.contains(&resource.last_write)
                {
                    pass.dependencies.push(resource.last_write);
                }
                if access.state.has_write_state() {
                    resource.last_write = pass.id;
                }
            }
            if pass.flags.contains(RGPassFlags::NEVER_CULL) {
                cull_stack.push(pass.id);
            }
        }

        for resource in &self.resources {
            if resource.last_write.is_valid() && (resource.imported || resource.exported) {
                cull_stack.push(resource.last_write);
            }
        }

        while let Some(id) = cull_stack.pop() {
            let pass = &mut self.passes[id.index()];
            if pass.culled {
                pass.culled = false;
                cull_stack.extend_from_slice(&pass.dependencies);
            }
        }
    }

    /// Lifetime and usage inference for live passes. Descriptor usage flags
    /// are widened from observed states, so authors don't spell them out.
    fn compute_resource_usage(&mut self) {
        for pass in &self.passes {
            if pass.culled {
                continue;
            }
            for access in &pass.accesses {
                let resource = &mut self.resources[access.resource.index()];
                if !resource.first_access.is_valid() {
                    resource.first_access = pass.id;
                }
                resource.last_access = pass.id;

                match &mut resource.desc {
                    RGResourceDesc::Buffer(desc) => {
                        if access.state.intersects(ResourceState::UNORDERED_ACCESS) {
                            desc.flags |= BufferFlags::UNORDERED_ACCESS;
                        }
                        if access.state.intersects(ResourceState::ALL_SHADER_RESOURCE) {
                            desc.flags |= BufferFlags::SHADER_RESOURCE;
                        }
                    }
                    RGResourceDesc::Texture(desc) => {
                        if access.state.intersects(ResourceState::UNORDERED_ACCESS) {
                            desc.flags |= TextureFlags::UNORDERED_ACCESS;
                        }
                        if access.state.intersects(ResourceState::ALL_SHADER_RESOURCE) {
                            desc.flags |= TextureFlags::SHADER_RESOURCE;
                        }
                        if access
                            .state
                            .intersects(ResourceState::DEPTH_READ | ResourceState::DEPTH_WRITE)
                        {
                            desc.flags |= TextureFlags::DEPTH_STENCIL;
                        }
                        if access.state.intersects(ResourceState::RENDER_TARGET) {
                            desc.flags |= TextureFlags::RENDER_TARGET;
                        }
                    }
                }
            }
        }
    }

    /// Records transitions, aliasing barriers and first-use discards against
    /// the physical resources bound during placement.
    fn record_transitions(&mut self) {
        for pass in &mut self.passes {
            if pass.culled {
                continue;
            }
            for access_index in 0..pass.accesses.len() {
                let access = pass.accesses[access_index];
                let resource = &self.resources[access.resource.index()];
                let physical = resource
                    .physical
                    .as_ref()
                    .expect("Live resource was not allocated during compile");

                if self.options.state_tracking && physical.state().use_state_tracking() {
                    let subresource = crate::rhi::ALL_SUBRESOURCES;
                    let before = physical.state().get(subresource);
                    let mut after = access.state;
                    if crate::rhi::needs_transition(before, &mut after) {
                        pass.transitions.push(ResourceTransition {
                            resource: access.resource,
                            before,
                            after,
                            subresource,
                        });
                        physical.state().set(after, subresource);
                    }
                }

                // Transients need an aliasing barrier on first use; render
                // and depth targets additionally need a discard.
                if !resource.imported && resource.first_access == pass.id {
                    let mut barrier = AliasBarrier {
                        resource: access.resource,
                        needs_discard: false,
                        discard_source_state: access.state,
                    };
                    if let RGResourceDesc::Texture(desc) = &resource.desc {
                        if desc
                            .flags
                            .intersects(TextureFlags::RENDER_TARGET | TextureFlags::DEPTH_STENCIL)
                        {
                            barrier.needs_discard = true;
                        }
                    }
                    pass.alias_barriers.push(barrier);
                }
            }
        }
    }

    /// Moves profile events off culled passes onto the next live pass, and
    /// cancels push/pop pairs that became empty.
    fn resolve_events(&mut self) {
        let mut events_to_start: Vec<RGEventId> = Vec::new();
        let mut events_to_end = 0u32;
        let mut last_live_pass: Option<usize> = None;

        for (index, pass) in self.passes.iter_mut().enumerate() {
            if pass.culled {
                while pass.num_events_to_end > 0 && !pass.events_to_start.is_empty() {
                    pass.num_events_to_end -= 1;
                    pass.events_to_start.pop();
                }
                events_to_start.append(&mut pass.events_to_start);
                events_to_end += pass.num_events_to_end;
            } else {
                pass.events_to_start.splice(0..0, events_to_start.drain(..));
                pass.num_events_to_end += events_to_end;
                events_to_end = 0;
                last_live_pass = Some(index);
            }
        }
        if let Some(last) = last_live_pass {
            self.passes[last].num_events_to_end += events_to_end;
        }
        debug_assert!(events_to_start.is_empty(), "Unmatched PushEvent after the last live pass");
    }

    /// Partitions live passes into contiguous execute groups and duplicates
    /// open CPU profile scopes across group borders so each command list
    /// sees a consistent event stack.
    fn group_passes(&mut self) {
        self.execute_groups.clear();
        let max_passes_per_job = if self.options.jobify {
            self.options.commandlist_group_size as usize
        } else {
            usize::MAX
        };

        let mut first_pass: usize = 0;
        let mut current_group_size = 0usize;
        let mut active_events: Vec<RGEventId> = Vec::new();
        let mut last_pass: Option<usize> = None;

        for index in 0..self.passes.len() {
            if self.passes[index].culled {
                continue;
            }
            let pass = &mut self.passes[index];
            pass.cpu_events_to_start = pass.events_to_start.clone();
            pass.num_cpu_events_to_end = pass.num_events_to_end;

            active_events.extend_from_slice(&pass.cpu_events_to_start);

            if current_group_size == 0 {
                first_pass = index;
                pass.cpu_events_to_start = active_events.clone();
            }

            for _ in 0..pass.num_cpu_events_to_end {
                active_events.pop();
            }

            current_group_size += 1;
            if current_group_size >= max_passes_per_job {
                self.passes[index].num_cpu_events_to_end += active_events.len() as u32;
                self.execute_groups.push(first_pass..index + 1);
                current_group_size = 0;
            }
            last_pass = Some(index);
        }
        if current_group_size > 0 {
            self.execute_groups.push(first_pass..self.passes.len());
        }
        if let Some(last) = last_pass {
            self.passes[last].num_cpu_events_to_end += active_events.len() as u32;
        }
    }

    // ── Execute ────────────────────────────────────────────────────────────

    /// Records each execute group into its own command list (on the worker
    /// pool unless `single_thread`), submits them in declaration order, then
    /// satisfies the exports.
    pub fn execute(&mut self, device: &GraphicsDevice) -> SyncPoint {
        assert!(self.compiled, "Graph must be compiled before execution");

        let mut contexts: Vec<CommandContext<'_>> = (0..self.execute_groups.len())
            .map(|_| device.allocate_command_context())
            .collect();

        {
            let passes = &mut self.passes;
            let resources = &self.resources;
            let events = &self.events;
            let groups = &self.execute_groups;

            if groups.len() > 1 && !self.options.single_thread {
                // Parallel recording: each group gets a disjoint pass slice.
                rayon::scope(|scope| {
                    let mut rest: &mut [RGPass] = passes.as_mut_slice();
                    let mut consumed = 0usize;
                    for (group, context) in groups.iter().zip(contexts.iter_mut()) {
                        let (_, tail) = rest.split_at_mut(group.start - consumed);
                        let (group_passes, tail) = tail.split_at_mut(group.end - group.start);
                        rest = tail;
                        consumed = group.end;
                        scope.spawn(move |_| {
                            Self::record_group(group_passes, context, resources, events);
                        });
                    }
                });
            } else {
                for (group, context) in groups.iter().zip(contexts.iter_mut()) {
                    Self::record_group(
                        &mut passes[group.start..group.end],
                        context,
                        resources,
                        events,
                    );
                }
            }
        }

        let sync_point = device
            .graphics_queue()
            .execute_command_lists(device, contexts);

        for (id, slot) in self.export_textures.drain(..) {
            let resource = &self.resources[id.index()];
            let physical = resource
                .physical
                .as_ref()
                .and_then(AnyResource::as_texture)
                .expect("Exported texture has no physical resource assigned");
            physical.set_name(&resource.name);
            *slot = Some(physical.clone());
        }
        for (id, slot) in self.export_buffers.drain(..) {
            let resource = &self.resources[id.index()];
            let physical = resource
                .physical
                .as_ref()
                .and_then(AnyResource::as_buffer)
                .expect("Exported buffer has no physical resource assigned");
            physical.set_name(&resource.name);
            *slot = Some(physical.clone());
        }

        self.destroy_data();
        sync_point
    }

    fn record_group(
        passes: &mut [RGPass],
        context: &mut CommandContext<'_>,
        resources: &[RGResource],
        events: &[RGEvent],
    ) {
        for pass in passes.iter_mut() {
            if !pass.culled {
                Self::execute_pass(pass, context, resources, events);
            }
        }
    }

    fn execute_pass(
        pass: &mut RGPass,
        context: &mut CommandContext<'_>,
        resources: &[RGResource],
        events: &[RGEvent],
    ) {
        for event in &pass.events_to_start {
            context.begin_event(&events[usize::from(*event)].name);
        }
        for event in &pass.cpu_events_to_start {
            let event = &events[usize::from(*event)];
            log::trace!("cpu event begin: {} ({}:{})", event.name, event.file, event.line);
        }

        Self::prepare_resources(pass, context, resources);

        if let Some(callback) = pass.callback.take() {
            let pass_resources = RGResources::new(pass, resources);
            let use_render_pass = pass.flags.contains(RGPassFlags::RASTER);
            if use_render_pass {
                context.begin_render_pass(pass_resources.get_render_pass_info());
            }
            callback(context, &pass_resources);
            if use_render_pass {
                context.end_render_pass();
            }
        }

        for _ in 0..pass.num_events_to_end {
            context.end_event();
        }
        for _ in 0..pass.num_cpu_events_to_end {
            log::trace!("cpu event end");
        }
    }

    /// Emits the pass's aliasing barriers, transitions and first-use
    /// discards in one flushed batch.
    fn prepare_resources(pass: &RGPass, context: &mut CommandContext<'_>, resources: &[RGResource]) {
        for barrier in &pass.alias_barriers {
            let physical = resources[barrier.resource.index()].physical.as_ref().unwrap();
            context.insert_aliasing_barrier(physical);
        }

        for transition in &pass.transitions {
            let physical = resources[transition.resource.index()]
                .physical
                .as_ref()
                .expect("Resource was not allocated during the graph compile phase");
            context.insert_resource_barrier(
                physical,
                transition.before,
                transition.after,
                transition.subresource,
            );
        }
        context.flush_resource_barriers();

        for barrier in &pass.alias_barriers {
            if !barrier.needs_discard {
                continue;
            }
            let resource = &resources[barrier.resource.index()];
            let physical = resource.physical.as_ref().unwrap();
            let is_render_target = matches!(
                &resource.desc,
                RGResourceDesc::Texture(desc) if desc.flags.contains(TextureFlags::RENDER_TARGET)
            );
            let target_state = if is_render_target {
                ResourceState::RENDER_TARGET
            } else {
                ResourceState::DEPTH_WRITE
            };
            let state = barrier.discard_source_state;
            if state != target_state {
                context.insert_resource_barrier(
                    physical,
                    state,
                    target_state,
                    crate::rhi::ALL_SUBRESOURCES,
                );
            }
            context.discard_resource(physical);
            if state != target_state {
                context.insert_resource_barrier(
                    physical,
                    target_state,
                    state,
                    crate::rhi::ALL_SUBRESOURCES,
                );
            }
        }
    }

    fn destroy_data(&mut self) {
        self.passes.clear();
        self.resources.clear();
        self.export_textures.clear();
        self.export_buffers.clear();
        self.execute_groups.clear();
    }
}

// ─── Pass builder ─────────────────────────────────────────────────────────────

/// Builder-style pass declaration, returned by [`RGGraph::add_pass`].
pub struct RGPassBuilder<'a, 'g> {
    graph: &'a mut RGGraph<'g>,
    pass_index: usize,
}

impl RGPassBuilder<'_, '_> {
    #[must_use]
    pub fn id(&self) -> RGPassId {
        self.graph.passes[self.pass_index].id
    }

    /// Declares shader-resource reads. Copy passes read in copy-source
    /// state; indirect-argument buffers additionally take that state.
    #[must_use]
    pub fn read(self, resources: &[RGResourceId]) -> Self {
        let graph = &mut *self.graph;
        let pass = &mut graph.passes[self.pass_index];
        let base_state = if pass.flags.contains(RGPassFlags::COPY) {
            ResourceState::COPY_SOURCE
        } else {
            ResourceState::ALL_SHADER_RESOURCE
        };
        for &id in resources {
            let resource = &graph.resources[id.index()];
            let mut state = base_state;
            if let RGResourceDesc::Buffer(desc) = &resource.desc {
                if desc.flags.contains(BufferFlags::INDIRECT_ARGUMENTS) {
                    state |= ResourceState::INDIRECT_ARGUMENT;
                }
            }
            pass.add_access(resource, state);
        }
        self
    }

    /// Declares unordered-access writes (copy-dest for copy passes).
    #[must_use]
    pub fn write(self, resources: &[RGResourceId]) -> Self {
        let graph = &mut *self.graph;
        let pass = &mut graph.passes[self.pass_index];
        let state = if pass.flags.contains(RGPassFlags::COPY) {
            ResourceState::COPY_DEST
        } else {
            ResourceState::UNORDERED_ACCESS
        };
        for &id in resources {
            pass.add_access(&graph.resources[id.index()], state);
        }
        self
    }

    /// Binds a color attachment. Implies the render-target write state.
    #[must_use]
    pub fn render_target(self, texture: RGTextureHandle, flags: RenderPassColorFlags) -> Self {
        self.render_target_resolve(texture, flags, None)
    }

    #[must_use]
    pub fn render_target_resolve(
        self,
        texture: RGTextureHandle,
        flags: RenderPassColorFlags,
        resolve_target: Option<RGTextureHandle>,
    ) -> Self {
        let graph = &mut *self.graph;
        let pass = &mut graph.passes[self.pass_index];
        assert!(
            pass.flags.contains(RGPassFlags::RASTER),
            "RenderTarget on a non-raster pass"
        );
        pass.add_access(
            &graph.resources[texture.id.index()],
            ResourceState::RENDER_TARGET,
        );
        if let Some(resolve) = resolve_target {
            if resolve != texture {
                pass.add_access(
                    &graph.resources[resolve.id.index()],
                    ResourceState::RESOLVE_DEST,
                );
            }
        }
        pass.render_targets.push(RenderTargetAccess {
            resource: texture.id,
            flags,
            resolve_target: resolve_target.map(|t| t.id),
        });
        self
    }

    /// Binds the depth-stencil attachment. Implies depth write (or depth
    /// read when `READ_ONLY`).
    #[must_use]
    pub fn depth_stencil(self, texture: RGTextureHandle, flags: RenderPassDepthFlags) -> Self {
        let graph = &mut *self.graph;
        let pass = &mut graph.passes[self.pass_index];
        assert!(
            pass.flags.contains(RGPassFlags::RASTER),
            "DepthStencil on a non-raster pass"
        );
        assert!(pass.depth_stencil.is_none(), "Depth target already assigned");
        let state = if flags.contains(RenderPassDepthFlags::READ_ONLY) {
            ResourceState::DEPTH_READ
        } else {
            ResourceState::DEPTH_WRITE
        };
        pass.add_access(&graph.resources[texture.id.index()], state);
        pass.depth_stencil = Some(DepthStencilAccess {
            resource: texture.id,
            flags,
        });
        self
    }

    /// Stores the pass's execute callback. The captured state is bounded by
    /// [`MAX_PASS_CALLBACK_SIZE`]; capture handles, not data.
    #[must_use]
    pub fn bind<F>(self, callback: F) -> Self
    where
        F: FnOnce(&mut CommandContext<'_>, &RGResources<'_>) + Send + 'static,
    {
        debug_assert!(
            std::mem::size_of::<F>() <= MAX_PASS_CALLBACK_SIZE,
            "Pass '{}': execute callback captures {} bytes (max {})",
            self.graph.passes[self.pass_index].name,
            std::mem::size_of::<F>(),
            MAX_PASS_CALLBACK_SIZE
        );
        let pass = &mut self.graph.passes[self.pass_index];
        assert!(pass.callback.is_none(), "Pass '{}' is already bound", pass.name);
        pass.callback = Some(Box::new(callback) as PassCallback);
        self
    }
}

// ─── Graph scope ──────────────────────────────────────────────────────────────

/// RAII profile scope: pushes an event on creation, pops on drop.
pub struct RGGraphScope<'a, 'g> {
    graph: &'a mut RGGraph<'g>,
}

impl<'g> std::ops::Deref for RGGraphScope<'_, 'g> {
    type Target = RGGraph<'g>;
    fn deref(&self) -> &Self::Target {
        self.graph
    }
}

impl std::ops::DerefMut for RGGraphScope<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.graph
    }
}

impl Drop for RGGraphScope<'_, '_> {
    fn drop(&mut self) {
        self.graph.pop_event();
    }
}

// ─── Utilities ────────────────────────────────────────────────────────────────

/// Adds a copy pass from `src` to `dst`.
pub fn add_copy_pass(
    graph: &mut RGGraph<'_>,
    src: impl Into<RGResourceId>,
    dst: impl Into<RGResourceId>,
) {
    let src = src.into();
    let dst = dst.into();
    let name = format!(
        "Copy [{} -> {}]",
        graph.resource(src).name(),
        graph.resource(dst).name()
    );
    let _ = graph
        .add_pass(&name, RGPassFlags::COPY)
        .read(&[src])
        .write(&[dst])
        .bind(move |context, resources| {
            context.copy_resource(&resources.get(src), &resources.get(dst));
        });
}

/// Imports the texture held in `slot` when compatible with `desc`, creates
/// a fresh transient otherwise, and re-exports it into the same slot. The
/// idiom that keeps a resource (e.g. the HZB) alive across frames.
pub fn create_persistent_texture<'g>(
    graph: &mut RGGraph<'g>,
    name: &str,
    desc: &TextureDesc,
    slot: &'g mut TextureSlot,
    additional_flags: TextureFlags,
) -> RGTextureHandle {
    let existing = slot
        .as_ref()
        .filter(|texture| texture.desc().is_compatible(desc))
        .cloned();
    let handle = match &existing {
        Some(texture) => graph.import_texture(texture),
        None => graph.create_texture(name, *desc),
    };
    graph.export_texture(handle, slot, additional_flags);
    handle
}

/// Buffer variant of [`create_persistent_texture`].
pub fn create_persistent_buffer<'g>(
    graph: &mut RGGraph<'g>,
    name: &str,
    desc: &BufferDesc,
    slot: &'g mut BufferSlot,
    additional_flags: BufferFlags,
) -> RGBufferHandle {
    let existing = slot
        .as_ref()
        .filter(|buffer| buffer.desc().is_compatible(desc))
        .cloned();
    let handle = match &existing {
        Some(buffer) => graph.import_buffer(buffer),
        None => graph.create_buffer(name, *desc),
    };
    graph.export_buffer(handle, slot, additional_flags);
    handle
}

/// Uploads CPU data into a buffer through a scratch allocation and a copy
/// pass.
pub fn do_upload<T: bytemuck::Pod + Send + 'static>(
    graph: &mut RGGraph<'_>,
    target: RGBufferHandle,
    data: Vec<T>,
) {
    let _ = graph
        .add_pass("Upload", RGPassFlags::COPY)
        .write(&[target.into()])
        .bind(move |context, resources| {
            let size = std::mem::size_of_val(data.as_slice()) as u64;
            let alloc = context.allocate_scratch(size);
            alloc.write_slice(&data);
            context.copy_buffer(&alloc.backing, &resources.get_buffer(target), size, alloc.offset, 0);
        });
}
