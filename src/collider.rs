//! Broad-phase collision detection between spheres.
//!
//! One `get_collisions` call submits the whole pipeline to the device:
//! scene-bounds reduction, Morton encoding, radix sort of the codes, LBVH
//! construction over the sorted order, bottom-up AABB propagation, and a
//! stackless traversal that emits every overlapping unordered pair once.
//! The call returns the traversal's completion event without blocking.

use std::marker::PhantomData;

use log::{debug, trace};
use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use crate::dtype::{is_power_of_two, round_up, CoordScalar, VecWidth};
use crate::error::{Error, Result};
use crate::program::build_program;
use crate::radix::{RadixProgram, RadixSorter};
use crate::reduce::{ReduceOp, Reducer, ReductionProgram};
use crate::scan::PrefixScanProgram;

const SRC: &str = include_str!("kernels/collision.cl");

/// Primitive id as stored in leaves and reported in pairs.
pub type Id = u32;
/// Morton code of a primitive center.
pub type Code = u32;
/// The collision counter written next to the pair buffer.
pub type Counter = u32;

/// A node of the bounding volume hierarchy, as laid out on the device.
///
/// A buffer of `2n - 1` nodes holds the internal nodes at `[0, n-1)` and
/// the leaves at `[n-1, 2n-2]`; leaf `k` corresponds to the k-th smallest
/// Morton code and records the primitive id it represents in `data[0]`.
/// Internal nodes store their two child indices in `data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Node {
    pub parent: u32,
    pub right_edge: u32,
    pub data: [u32; 2],
}

unsafe impl ocl::OclPrm for Node {}
static_assertions::assert_eq_size!(Node, [u32; 4]);

impl Node {
    /// Parent marker of the root node.
    pub const ROOT_PARENT: u32 = !0;
}

/// One reported collision: the ids of two overlapping primitives.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CollisionPair(pub u32, pub u32);

unsafe impl ocl::OclPrm for CollisionPair {}
static_assertions::assert_eq_size!(CollisionPair, [u32; 2]);

/// Compiled pipeline kernels for one coordinate type, shareable between
/// colliders on one context.
#[derive(Clone)]
pub struct CollisionProgram<T: CoordScalar> {
    context: Context,
    pub(crate) program: Program,
    _marker: PhantomData<T>,
}

impl<T: CoordScalar> CollisionProgram<T> {
    pub fn new(context: &Context) -> Result<Self> {
        let mut options = vec![format!("-D DTYPE={}", T::DECL)];
        if T::NEEDS_FP64 {
            options.push("-D DTYPE_DOUBLE".into());
        }
        let program = build_program(context, SRC, &options)?;
        Ok(CollisionProgram {
            context: context.clone(),
            program,
            _marker: PhantomData,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// Detects AABB overlaps between `size` spheres given per-sphere centers
/// and radii in device memory.
///
/// Centers are packed four coordinates per sphere (lane 3 unused) so a
/// `coords` buffer holds `4 * size` scalars; `radii` holds `size`. The
/// pair counter is a single `u32`; the optional pair buffer holds up to
/// `max_collisions` `CollisionPair` records. All intermediate buffers are
/// owned here and recreated only when the size or shape parameters
/// change.
pub struct Collider<T: CoordScalar> {
    program: CollisionProgram<T>,
    sorter: RadixSorter<u32, u32>,
    reducer: Reducer<T>,
    size: usize,
    group_size: usize,
    ids_bufs: [Buffer<u32>; 2],
    codes_bufs: [Buffer<u32>; 2],
    nodes_buf: Buffer<Node>,
    bounds_buf: Buffer<T>,
    flags_buf: Buffer<u32>,
}

const DEFAULT_RADIX_BITS: u32 = 4;

impl<T: CoordScalar> Collider<T> {
    pub fn new(context: &Context, size: usize, ngroups: usize, group_size: usize) -> Result<Self> {
        let program = CollisionProgram::new(context)?;
        let sorter_program = RadixProgram::new(context)?;
        let scan_program = PrefixScanProgram::new(context)?;
        let reducer_program = ReductionProgram::new(context, ReduceOp::Bounds, VecWidth::Three)?;
        Self::with_programs(
            program,
            sorter_program,
            scan_program,
            reducer_program,
            size,
            ngroups,
            group_size,
        )
    }

    /// Build from pre-compiled programs; they must all come from the same
    /// context.
    pub fn with_programs(
        program: CollisionProgram<T>,
        sorter_program: RadixProgram<u32, u32>,
        scan_program: PrefixScanProgram,
        reducer_program: ReductionProgram<T>,
        size: usize,
        ngroups: usize,
        group_size: usize,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("primitive count must be positive".into()));
        }
        if reducer_program.op() != ReduceOp::Bounds || reducer_program.width() != VecWidth::Three {
            return Err(Error::Config(
                "reducer program must compute three-component bounds".into(),
            ));
        }

        let padded_size = round_up(size, 2 * group_size);
        let sorter = RadixSorter::with_programs(
            sorter_program,
            scan_program,
            padded_size,
            group_size,
            DEFAULT_RADIX_BITS,
        )?;
        let reducer = Reducer::with_program(reducer_program, ngroups, group_size)?;

        let context = program.context().clone();
        let n_nodes = 2 * size - 1;
        let ids_bufs = [
            alloc::<u32>(&context, padded_size)?,
            alloc::<u32>(&context, padded_size)?,
        ];
        let codes_bufs = [
            alloc::<u32>(&context, padded_size)?,
            alloc::<u32>(&context, padded_size)?,
        ];
        let nodes_buf = alloc::<Node>(&context, n_nodes)?;
        // Dual use: slot 0 carries the scene bounds between the reduction
        // and the Morton pass, then the per-node bounds overwrite it.
        let bounds_buf = alloc::<T>(&context, n_nodes * 2 * 4)?;
        let flags_buf = alloc::<u32>(&context, n_nodes)?;

        Ok(Collider {
            program,
            sorter,
            reducer,
            size,
            group_size,
            ids_bufs,
            codes_bufs,
            nodes_buf,
            bounds_buf,
            flags_buf,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Total node count of the hierarchy.
    pub fn n_nodes(&self) -> usize {
        2 * self.size - 1
    }

    /// The sort works on whole blocks, so codes and ids are padded up to a
    /// multiple of twice the group size.
    pub fn padded_size(&self) -> usize {
        round_up(self.size, 2 * self.group_size)
    }

    /// Change the primitive count or launch shape. Buffers are recreated
    /// only when their length changes; configuration errors leave the
    /// collider untouched.
    pub fn resize(
        &mut self,
        size: Option<usize>,
        ngroups: Option<usize>,
        group_size: Option<usize>,
        radix_bits: Option<u32>,
    ) -> Result<()> {
        let new_size = size.unwrap_or(self.size);
        let new_group_size = group_size.unwrap_or(self.group_size);
        if new_size == 0 {
            return Err(Error::Config("primitive count must be positive".into()));
        }
        if !is_power_of_two(new_group_size) {
            return Err(Error::Config(format!(
                "group size ({}) must be a power of two",
                new_group_size
            )));
        }
        if ngroups == Some(0) {
            return Err(Error::Config("group count must be positive".into()));
        }

        let new_padded = round_up(new_size, 2 * new_group_size);
        let new_n_nodes = 2 * new_size - 1;
        let context = self.program.context().clone();

        // Allocate replacements up front so a failure cannot leave the
        // collider with mismatched buffers.
        let new_pair_bufs = if new_padded != self.padded_size() {
            debug!("code and id buffers reallocated to {}", new_padded);
            Some((
                [
                    alloc::<u32>(&context, new_padded)?,
                    alloc::<u32>(&context, new_padded)?,
                ],
                [
                    alloc::<u32>(&context, new_padded)?,
                    alloc::<u32>(&context, new_padded)?,
                ],
            ))
        } else {
            None
        };
        let new_node_bufs = if new_n_nodes != self.n_nodes() {
            debug!("node buffers reallocated to {}", new_n_nodes);
            Some((
                alloc::<Node>(&context, new_n_nodes)?,
                alloc::<T>(&context, new_n_nodes * 2 * 4)?,
                alloc::<u32>(&context, new_n_nodes)?,
            ))
        } else {
            None
        };

        self.sorter
            .resize(Some(new_padded), group_size, radix_bits)?;
        self.reducer.resize(ngroups, group_size)?;

        if let Some((ids, codes)) = new_pair_bufs {
            self.ids_bufs = ids;
            self.codes_bufs = codes;
        }
        if let Some((nodes, bounds, flags)) = new_node_bufs {
            self.nodes_buf = nodes;
            self.bounds_buf = bounds;
            self.flags_buf = flags;
        }
        self.size = new_size;
        self.group_size = new_group_size;
        Ok(())
    }

    /// Submit the pipeline and return the completion event of the final
    /// traversal without blocking.
    ///
    /// The counter receives the true number of overlapping pairs, which
    /// may exceed `max_collisions`; in that case the pair buffer holds the
    /// first `max_collisions` pairs written, in race-determined order.
    /// With `max_collisions == 0` the pair buffer may be `None` for a
    /// count-only query.
    #[allow(clippy::too_many_arguments)]
    pub fn get_collisions(
        &mut self,
        queue: &Queue,
        coords: &Buffer<T>,
        radii: &Buffer<T>,
        n_collisions: &Buffer<u32>,
        collisions: Option<&Buffer<CollisionPair>>,
        max_collisions: u32,
        wait_for: Option<&EventList>,
    ) -> Result<Event> {
        if collisions.is_none() && max_collisions > 0 {
            return Err(Error::Argument(
                "a collision buffer is required when max_collisions > 0".into(),
            ));
        }
        if coords.len() < 4 * self.size {
            return Err(Error::Argument(format!(
                "coords must hold {} scalars (4 per primitive)",
                4 * self.size
            )));
        }
        if radii.len() < self.size {
            return Err(Error::Argument(format!(
                "radii must hold {} scalars",
                self.size
            )));
        }
        if let Some(buf) = collisions {
            if buf.len() < max_collisions as usize {
                return Err(Error::Argument(format!(
                    "collision buffer must hold {} pairs",
                    max_collisions
                )));
            }
        }

        let n = self.size;
        let padded = self.padded_size();
        trace!("submitting pipeline for {} primitives ({} padded)", n, padded);

        // Padded code slots sort to the tail and never become leaves.
        let mut fill_codes = EventList::new();
        if padded != n {
            let mut event = Event::empty();
            self.codes_bufs[0]
                .cmd()
                .queue(queue)
                .fill(!0u32, None)
                .enew(&mut event)
                .enq()?;
            fill_codes.push(event);
        }

        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("range")
            .queue(queue.clone())
            .global_work_size(padded)
            .arg(&self.ids_bufs[0])
            .build()?;
        let mut fill_ids = Event::empty();
        unsafe {
            kernel.cmd().enew(&mut fill_ids).enq()?;
        }

        let mut clear_flags = Event::empty();
        self.flags_buf
            .cmd()
            .queue(queue)
            .fill(0u32, None)
            .enew(&mut clear_flags)
            .enq()?;

        let mut clear_counter = Event::empty();
        n_collisions
            .cmd()
            .queue(queue)
            .fill(0u32, Some(1))
            .enew(&mut clear_counter)
            .enq()?;

        // First use of the caller's buffers waits on the caller's events.
        let scene_bounds =
            self.reducer
                .reduce(queue, n, coords, &self.bounds_buf, wait_for)?;

        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("calculateCodes")
            .queue(queue.clone())
            .global_work_size(round_up(n, self.group_size))
            .arg(&self.codes_bufs[0])
            .arg(coords)
            .arg(&self.bounds_buf)
            .arg(n as u32)
            .build()?;
        let mut wait = fill_codes;
        wait.push(scene_bounds);
        let mut calc_codes = Event::empty();
        unsafe {
            kernel.cmd().ewait(&wait).enew(&mut calc_codes).enq()?;
        }

        let mut wait = EventList::new();
        wait.push(calc_codes);
        wait.push(fill_ids);
        let sorted = self.sorter.sort_with_values(
            queue,
            &self.codes_bufs[0],
            &self.codes_bufs[1],
            &self.ids_bufs[0],
            &self.ids_bufs[1],
            Some(&wait),
        )?;

        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("fillInternal")
            .queue(queue.clone())
            .global_work_size(round_up(n, self.group_size))
            .arg(&self.nodes_buf)
            .arg(&self.ids_bufs[1])
            .arg(n as u32)
            .build()?;
        let mut fill_leaves = Event::empty();
        unsafe {
            kernel.cmd().ewait(&sorted).enew(&mut fill_leaves).enq()?;
        }

        let mut tree_built = EventList::new();
        tree_built.push(fill_leaves);
        if n > 1 {
            let kernel = Kernel::builder()
                .program(&self.program.program)
                .name("generateBVH")
                .queue(queue.clone())
                .global_work_size(round_up(n - 1, self.group_size))
                .arg(&self.codes_bufs[1])
                .arg(&self.nodes_buf)
                .arg(n as u32)
                .build()?;
            let mut built = Event::empty();
            unsafe {
                kernel.cmd().ewait(&sorted).enew(&mut built).enq()?;
            }
            tree_built.push(built);
        }

        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("leafBounds")
            .queue(queue.clone())
            .global_work_size(round_up(n, self.group_size))
            .arg(&self.bounds_buf)
            .arg(coords)
            .arg(radii)
            .arg(&self.nodes_buf)
            .arg(n as u32)
            .build()?;
        let mut leaf_bounds = Event::empty();
        unsafe {
            kernel.cmd().ewait(&tree_built).enew(&mut leaf_bounds).enq()?;
        }

        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("internalBounds")
            .queue(queue.clone())
            .global_work_size(round_up(n, self.group_size))
            .arg(&self.bounds_buf)
            .arg(&self.flags_buf)
            .arg(&self.nodes_buf)
            .arg(n as u32)
            .build()?;
        let mut wait = EventList::new();
        wait.push(clear_flags);
        wait.push(leaf_bounds);
        let mut node_bounds = Event::empty();
        unsafe {
            kernel.cmd().ewait(&wait).enew(&mut node_bounds).enq()?;
        }

        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("traverse")
            .queue(queue.clone())
            .global_work_size(n)
            .arg(collisions)
            .arg(n_collisions)
            .arg(max_collisions)
            .arg(&self.nodes_buf)
            .arg(&self.bounds_buf)
            .arg(n as u32)
            .build()?;
        let mut wait = EventList::new();
        wait.push(clear_counter);
        wait.push(node_bounds);
        let mut traversed = Event::empty();
        unsafe {
            kernel.cmd().ewait(&wait).enew(&mut traversed).enq()?;
        }

        Ok(traversed)
    }
}

fn alloc<T: ocl::OclPrm>(context: &Context, len: usize) -> Result<Buffer<T>> {
    let buf = Buffer::<T>::builder()
        .context(context)
        .len(len)
        .flags(ocl::flags::MemFlags::new().read_write().host_no_access())
        .build()?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::vector::{vec3, Vec3};
    use crate::aabb::Aabb;
    use rand::Rng;
    use std::collections::HashSet;

    /// Host mirror of the device Morton encoding.
    fn morton_code(center: Vec3<f32>, lo: Vec3<f32>, hi: Vec3<f32>) -> u32 {
        fn quantize(v: f32) -> u32 {
            (v * 1023.0).clamp(0.0, 1023.0) as u32
        }
        fn spread3(mut x: u32) -> u32 {
            x = (x | (x << 16)) & 0x030000FF;
            x = (x | (x << 8)) & 0x0300F00F;
            x = (x | (x << 4)) & 0x030C30C3;
            x = (x | (x << 2)) & 0x09249249;
            x
        }
        let q = |c: f32, lo: f32, hi: f32| quantize((c - lo) / (hi - lo));
        (spread3(q(center.0, lo.0, hi.0)) << 2)
            | (spread3(q(center.1, lo.1, hi.1)) << 1)
            | spread3(q(center.2, lo.2, hi.2))
    }

    fn pack_coords(centers: &[Vec3<f32>]) -> Vec<f32> {
        centers
            .iter()
            .flat_map(|c| [c.0, c.1, c.2, 0.0])
            .collect()
    }

    fn brute_force(centers: &[Vec3<f32>], radii: &[f32]) -> HashSet<(u32, u32)> {
        let boxes: Vec<Aabb<f32>> = centers
            .iter()
            .zip(radii)
            .map(|(&c, &r)| Aabb::from_sphere(c, r))
            .collect();
        let mut pairs = HashSet::new();
        for i in 0..boxes.len() {
            for j in i + 1..boxes.len() {
                if boxes[i].overlaps(&boxes[j]) {
                    pairs.insert((i as u32, j as u32));
                }
            }
        }
        pairs
    }

    fn normalize(pairs: &[CollisionPair]) -> HashSet<(u32, u32)> {
        pairs
            .iter()
            .map(|p| (p.0.min(p.1), p.0.max(p.1)))
            .collect()
    }

    /// Build leaves and internal nodes for pre-sorted codes and read the
    /// node buffer back.
    fn build_tree(codes: &[u32], ids: &[u32]) -> Vec<Node> {
        let (context, queue) = testing::context();
        let program = CollisionProgram::<f32>::new(&context).unwrap();
        let n = codes.len();

        let codes_buf = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(n)
            .copy_host_slice(codes)
            .build()
            .unwrap();
        let ids_buf = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(n)
            .copy_host_slice(ids)
            .build()
            .unwrap();
        let nodes_buf = Buffer::<Node>::builder()
            .queue(queue.clone())
            .len(2 * n - 1)
            .build()
            .unwrap();

        let kernel = Kernel::builder()
            .program(&program.program)
            .name("fillInternal")
            .queue(queue.clone())
            .global_work_size(n)
            .arg(&nodes_buf)
            .arg(&ids_buf)
            .arg(n as u32)
            .build()
            .unwrap();
        let mut filled = Event::empty();
        unsafe {
            kernel.cmd().enew(&mut filled).enq().unwrap();
        }

        let kernel = Kernel::builder()
            .program(&program.program)
            .name("generateBVH")
            .queue(queue.clone())
            .global_work_size(n - 1)
            .arg(&codes_buf)
            .arg(&nodes_buf)
            .arg(n as u32)
            .build()
            .unwrap();
        let mut built = Event::empty();
        unsafe {
            kernel.cmd().ewait(&filled).enew(&mut built).enq().unwrap();
        }
        built.wait_for().unwrap();

        let mut nodes = vec![Node::default(); 2 * n - 1];
        nodes_buf.read(&mut nodes).enq().unwrap();
        nodes
    }

    #[test]
    fn radix_tree_eight_leaves() {
        let codes: Vec<u32> = vec![
            0b00001, 0b00010, 0b00100, 0b00101, 0b10011, 0b11000, 0b11001, 0b11110,
        ];
        let ids: Vec<u32> = (0..8).collect();
        let nodes = build_tree(&codes, &ids);

        let leaf: u32 = 7;
        let expected = [
            (Node::ROOT_PARENT, 7, [3, 4]),
            (3, 1, [leaf, leaf + 1]),
            (3, 3, [leaf + 2, leaf + 3]),
            (0, 3, [1, 2]),
            (0, 7, [leaf + 4, 5]),
            (4, 7, [6, leaf + 7]),
            (5, 6, [leaf + 5, leaf + 6]),
        ];
        for (i, &(parent, right_edge, data)) in expected.iter().enumerate() {
            assert_eq!(nodes[i].parent, parent, "internal {} parent", i);
            assert_eq!(nodes[i].right_edge, right_edge, "internal {} right edge", i);
            assert_eq!(nodes[i].data, data, "internal {} children", i);
        }

        let leaf_parents = [1, 1, 2, 2, 4, 6, 6, 5];
        for k in 0..8 {
            assert_eq!(nodes[7 + k].parent, leaf_parents[k], "leaf {} parent", k);
            assert_eq!(nodes[7 + k].right_edge, k as u32);
            assert_eq!(nodes[7 + k].data[0], ids[k]);
        }
    }

    #[test]
    fn radix_tree_seven_leaves() {
        let codes: Vec<u32> = vec![
            0b00001, 0b00010, 0b00100, 0b00101, 0b10011, 0b11000, 0b11001,
        ];
        let ids: Vec<u32> = (0..7).collect();
        let nodes = build_tree(&codes, &ids);

        let leaf = 6;
        let leaf_parents = [1, 1, 2, 2, 4, 5, 5];
        for k in 0..7 {
            assert_eq!(nodes[leaf + k].parent, leaf_parents[k], "leaf {} parent", k);
        }
        assert_eq!(nodes[0].parent, Node::ROOT_PARENT);
        assert_eq!(nodes[0].right_edge, 6);
    }

    #[test]
    fn radix_tree_is_valid_on_random_codes() {
        let mut rng = testing::rng(4);
        let n = 300;
        let mut codes: Vec<u32> = (0..n).map(|_| rng.gen_range(0..1 << 30)).collect();
        codes.sort();
        let ids: Vec<u32> = (0..n as u32).collect();
        let nodes = build_tree(&codes, &ids);

        // Every node but the root has an internal parent; each internal
        // node is named as a parent exactly twice.
        assert_eq!(nodes[0].parent, Node::ROOT_PARENT);
        let mut child_counts = vec![0u32; n - 1];
        for v in 1..2 * n - 1 {
            let p = nodes[v].parent as usize;
            assert!(p < n - 1, "node {} has invalid parent {}", v, p);
            assert!(
                nodes[p].data[0] == v as u32 || nodes[p].data[1] == v as u32,
                "node {} not a child of its parent",
                v
            );
            child_counts[p] += 1;
        }
        assert!(child_counts.iter().all(|&c| c == 2));

        // Right edges: leaves carry their position, internal nodes the
        // right child's edge, never below the left child's.
        for i in 0..n - 1 {
            let [l, r] = nodes[i].data;
            assert_eq!(nodes[i].right_edge, nodes[r as usize].right_edge);
            assert!(nodes[l as usize].right_edge <= nodes[i].right_edge);
        }
        for k in 0..n {
            assert_eq!(nodes[n - 1 + k].right_edge, k as u32);
        }
    }

    #[test]
    fn bounds_propagate_to_root() {
        let (context, queue) = testing::context();
        let program = CollisionProgram::<f32>::new(&context).unwrap();

        let centers = [
            vec3(0.0f32, 1.0, 3.0),
            vec3(4.0, 1.0, 8.0),
            vec3(-4.0, -6.0, 3.0),
            vec3(-5.0, 0.0, -1.0),
        ];
        let radii = [1.0f32; 4];
        let n = centers.len();

        let mut scene = Aabb::empty();
        for &c in &centers {
            scene.include_point(c);
        }
        let mut order: Vec<u32> = (0..n as u32).collect();
        let codes: Vec<u32> = centers
            .iter()
            .map(|&c| morton_code(c, scene.min, scene.max))
            .collect();
        order.sort_by_key(|&i| codes[i as usize]);
        let sorted_codes: Vec<u32> = order.iter().map(|&i| codes[i as usize]).collect();

        let codes_buf = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(n)
            .copy_host_slice(&sorted_codes)
            .build()
            .unwrap();
        let ids_buf = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(n)
            .copy_host_slice(&order)
            .build()
            .unwrap();
        let nodes_buf = Buffer::<Node>::builder()
            .queue(queue.clone())
            .len(2 * n - 1)
            .build()
            .unwrap();
        let coords_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len(4 * n)
            .copy_host_slice(&pack_coords(&centers))
            .build()
            .unwrap();
        let radii_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len(n)
            .copy_host_slice(&radii)
            .build()
            .unwrap();
        let bounds_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len((2 * n - 1) * 2 * 4)
            .build()
            .unwrap();
        let flags = vec![0u32; 2 * n - 1];
        let flags_buf = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(2 * n - 1)
            .copy_host_slice(&flags)
            .build()
            .unwrap();

        let kernel = Kernel::builder()
            .program(&program.program)
            .name("fillInternal")
            .queue(queue.clone())
            .global_work_size(n)
            .arg(&nodes_buf)
            .arg(&ids_buf)
            .arg(n as u32)
            .build()
            .unwrap();
        let mut filled = Event::empty();
        unsafe {
            kernel.cmd().enew(&mut filled).enq().unwrap();
        }

        let kernel = Kernel::builder()
            .program(&program.program)
            .name("generateBVH")
            .queue(queue.clone())
            .global_work_size(n - 1)
            .arg(&codes_buf)
            .arg(&nodes_buf)
            .arg(n as u32)
            .build()
            .unwrap();
        let mut built = Event::empty();
        unsafe {
            kernel.cmd().ewait(&filled).enew(&mut built).enq().unwrap();
        }

        let kernel = Kernel::builder()
            .program(&program.program)
            .name("leafBounds")
            .queue(queue.clone())
            .global_work_size(n)
            .arg(&bounds_buf)
            .arg(&coords_buf)
            .arg(&radii_buf)
            .arg(&nodes_buf)
            .arg(n as u32)
            .build()
            .unwrap();
        let mut leaves = Event::empty();
        unsafe {
            kernel.cmd().ewait(&built).enew(&mut leaves).enq().unwrap();
        }

        let kernel = Kernel::builder()
            .program(&program.program)
            .name("internalBounds")
            .queue(queue.clone())
            .global_work_size(n)
            .arg(&bounds_buf)
            .arg(&flags_buf)
            .arg(&nodes_buf)
            .arg(n as u32)
            .build()
            .unwrap();
        let mut done = Event::empty();
        unsafe {
            kernel.cmd().ewait(&leaves).enew(&mut done).enq().unwrap();
        }
        done.wait_for().unwrap();

        let mut bounds = vec![0.0f32; (2 * n - 1) * 2 * 4];
        bounds_buf.read(&mut bounds).enq().unwrap();
        // Root bounds in slots 0 (min) and 1 (max).
        assert_eq!(&bounds[0..3], &[-6.0, -7.0, -2.0]);
        assert_eq!(&bounds[4..7], &[5.0, 2.0, 9.0]);

        // Every node's box is the union of the leaf boxes below it.
        let mut nodes = vec![Node::default(); 2 * n - 1];
        nodes_buf.read(&mut nodes).enq().unwrap();
        let node_box = |v: usize| Aabb::<f32> {
            min: vec3(bounds[8 * v], bounds[8 * v + 1], bounds[8 * v + 2]),
            max: vec3(bounds[8 * v + 4], bounds[8 * v + 5], bounds[8 * v + 6]),
        };
        for k in 0..n {
            let leaf = n - 1 + k;
            let id = nodes[leaf].data[0] as usize;
            assert_eq!(node_box(leaf), Aabb::from_sphere(centers[id], radii[id]));
        }
        for v in 0..n - 1 {
            let [l, r] = nodes[v].data;
            let mut expected = node_box(l as usize);
            expected.include(&node_box(r as usize));
            assert_eq!(node_box(v), expected, "internal node {}", v);
        }
    }

    #[test]
    fn morton_codes_match_reference() {
        let (context, queue) = testing::context();
        let program = CollisionProgram::<f32>::new(&context).unwrap();

        let centers = [
            vec3(0.0f32, 1.0, 3.0),
            vec3(0.0, 1.0, 3.0),
            vec3(4.0, 1.0, 8.0),
            vec3(-4.0, -6.0, 3.0),
            vec3(-5.0, 0.0, -1.0),
            vec3(-5.0, 0.5, -0.5),
        ];
        let expected: Vec<u32> = vec![
            862940378, 862940378, 1073741823, 20332620, 302580864, 306295426,
        ];
        let n = centers.len();

        let coords_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len(4 * n)
            .copy_host_slice(&pack_coords(&centers))
            .build()
            .unwrap();
        let codes_buf = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(n)
            .build()
            .unwrap();
        let bounds_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len(2 * 4)
            .build()
            .unwrap();

        let reducer = Reducer::<f32>::bounds(&context, 2, 4, VecWidth::Three).unwrap();
        let reduced = reducer
            .reduce(&queue, n, &coords_buf, &bounds_buf, None)
            .unwrap();

        let kernel = Kernel::builder()
            .program(&program.program)
            .name("calculateCodes")
            .queue(queue.clone())
            .global_work_size(n)
            .arg(&codes_buf)
            .arg(&coords_buf)
            .arg(&bounds_buf)
            .arg(n as u32)
            .build()
            .unwrap();
        let mut done = Event::empty();
        unsafe {
            kernel.cmd().ewait(&reduced).enew(&mut done).enq().unwrap();
        }
        done.wait_for().unwrap();

        let mut codes = vec![0u32; n];
        codes_buf.read(&mut codes).enq().unwrap();
        assert_eq!(codes, expected);

        // The host reference agrees.
        let lo = vec3(-5.0, -6.0, -1.0);
        let hi = vec3(4.0, 1.0, 8.0);
        for (c, &e) in centers.iter().zip(&expected) {
            assert_eq!(morton_code(*c, lo, hi), e);
        }
    }

    fn run_collider(
        centers: &[Vec3<f32>],
        radii: &[f32],
        ngroups: usize,
        group_size: usize,
        max_collisions: u32,
        with_buffer: bool,
    ) -> (u32, Vec<CollisionPair>) {
        let (context, queue) = testing::context();
        let n = centers.len();
        let mut collider = Collider::<f32>::new(&context, n, ngroups, group_size).unwrap();

        let coords_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len(4 * n)
            .copy_host_slice(&pack_coords(centers))
            .build()
            .unwrap();
        let radii_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len(n)
            .copy_host_slice(radii)
            .build()
            .unwrap();
        let count_buf = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(1)
            .build()
            .unwrap();
        let pairs_buf = if with_buffer {
            Some(
                Buffer::<CollisionPair>::builder()
                    .queue(queue.clone())
                    .len((max_collisions as usize).max(1))
                    .build()
                    .unwrap(),
            )
        } else {
            None
        };

        let event = collider
            .get_collisions(
                &queue,
                &coords_buf,
                &radii_buf,
                &count_buf,
                pairs_buf.as_ref(),
                max_collisions,
                None,
            )
            .unwrap();
        event.wait_for().unwrap();

        let mut count = vec![0u32; 1];
        count_buf.read(&mut count).enq().unwrap();
        let count = count[0];

        let mut pairs = Vec::new();
        if let Some(buf) = pairs_buf {
            let stored = (count as usize).min(max_collisions as usize);
            if stored > 0 {
                pairs = vec![CollisionPair::default(); stored];
                buf.read(&mut pairs).enq().unwrap();
            }
        }
        (count, pairs)
    }

    fn six_spheres() -> (Vec<Vec3<f32>>, Vec<f32>) {
        let centers = vec![
            vec3(0.0f32, 1.0, 3.0),
            vec3(0.0, 1.0, 3.0),
            vec3(4.0, 1.0, 8.0),
            vec3(-4.0, -6.0, 3.0),
            vec3(-5.0, 0.0, -1.0),
            vec3(-5.0, 0.5, -0.5),
        ];
        let radii = vec![1.0f32; 6];
        (centers, radii)
    }

    #[test]
    fn six_spheres_collide_as_expected() {
        let (centers, radii) = six_spheres();
        let expected: HashSet<(u32, u32)> = [(0, 1), (4, 5)].into_iter().collect();

        let (count, pairs) = run_collider(&centers, &radii, 2, 8, 2, true);
        assert_eq!(count, 2);
        assert_eq!(normalize(&pairs), expected);
    }

    #[test]
    fn six_spheres_f64() {
        let (context, queue) = testing::context();
        let centers = [
            (0.0f64, 1.0, 3.0),
            (0.0, 1.0, 3.0),
            (4.0, 1.0, 8.0),
            (-4.0, -6.0, 3.0),
            (-5.0, 0.0, -1.0),
            (-5.0, 0.5, -0.5),
        ];
        let coords: Vec<f64> = centers
            .iter()
            .flat_map(|&(x, y, z)| [x, y, z, 0.0])
            .collect();
        let radii = vec![1.0f64; 6];

        let mut collider = Collider::<f64>::new(&context, 6, 2, 8).unwrap();
        let coords_buf = Buffer::<f64>::builder()
            .queue(queue.clone())
            .len(coords.len())
            .copy_host_slice(&coords)
            .build()
            .unwrap();
        let radii_buf = Buffer::<f64>::builder()
            .queue(queue.clone())
            .len(radii.len())
            .copy_host_slice(&radii)
            .build()
            .unwrap();
        let count_buf = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(1)
            .build()
            .unwrap();
        let pairs_buf = Buffer::<CollisionPair>::builder()
            .queue(queue.clone())
            .len(2)
            .build()
            .unwrap();

        let event = collider
            .get_collisions(
                &queue,
                &coords_buf,
                &radii_buf,
                &count_buf,
                Some(&pairs_buf),
                2,
                None,
            )
            .unwrap();
        event.wait_for().unwrap();

        let mut count = vec![0u32; 1];
        count_buf.read(&mut count).enq().unwrap();
        assert_eq!(count[0], 2);

        let mut pairs = vec![CollisionPair::default(); 2];
        pairs_buf.read(&mut pairs).enq().unwrap();
        let expected: HashSet<(u32, u32)> = [(0, 1), (4, 5)].into_iter().collect();
        assert_eq!(normalize(&pairs), expected);
    }

    #[test]
    fn count_only_matches_brute_force() {
        let mut rng = testing::rng(4);
        let n = 100;
        let centers: Vec<Vec3<f32>> = (0..n)
            .map(|_| vec3(rng.gen::<f32>(), rng.gen::<f32>(), rng.gen::<f32>()))
            .collect();
        let radius_cap = 1.0 / (n as f32).sqrt();
        let radii: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..radius_cap)).collect();
        let expected = brute_force(&centers, &radii);

        // Count-only query with a null pair buffer.
        let (count, _) = run_collider(&centers, &radii, 4, 8, 0, false);
        assert_eq!(count as usize, expected.len());

        // Exact-capacity query returns the same count and the full set.
        let (count, pairs) =
            run_collider(&centers, &radii, 4, 8, expected.len() as u32, true);
        assert_eq!(count as usize, expected.len());
        assert_eq!(normalize(&pairs), expected);
    }

    #[test]
    fn overflow_keeps_counting() {
        let (centers, radii) = six_spheres();
        let (count, pairs) = run_collider(&centers, &radii, 2, 8, 1, true);
        assert_eq!(count, 2);
        assert_eq!(pairs.len(), 1);
        let expected: HashSet<(u32, u32)> = [(0, 1), (4, 5)].into_iter().collect();
        assert!(expected.contains(normalize(&pairs).iter().next().unwrap()));
    }

    #[test]
    fn missing_pair_buffer_is_rejected() {
        let (context, queue) = testing::context();
        let (centers, radii) = six_spheres();
        let mut collider = Collider::<f32>::new(&context, 6, 2, 8).unwrap();

        let coords_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len(24)
            .copy_host_slice(&pack_coords(&centers))
            .build()
            .unwrap();
        let radii_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len(6)
            .copy_host_slice(&radii)
            .build()
            .unwrap();
        let count_buf = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(1)
            .build()
            .unwrap();

        let result = collider.get_collisions(
            &queue,
            &coords_buf,
            &radii_buf,
            &count_buf,
            None,
            4,
            None,
        );
        assert!(matches!(result, Err(Error::Argument(_))));
    }

    #[test]
    fn resize_and_rerun() {
        let (context, queue) = testing::context();
        let mut rng = testing::rng(12);
        let mut collider = Collider::<f32>::new(&context, 6, 2, 8).unwrap();

        // An invalid resize leaves the old configuration in place.
        assert!(matches!(
            collider.resize(None, None, Some(6), None),
            Err(Error::Config(_))
        ));
        assert_eq!(collider.size(), 6);
        assert_eq!(collider.padded_size(), 16);

        let n = 40;
        collider.resize(Some(n), None, Some(16), None).unwrap();
        assert_eq!(collider.size(), n);
        assert_eq!(collider.padded_size(), 64);

        let centers: Vec<Vec3<f32>> = (0..n)
            .map(|_| vec3(rng.gen::<f32>(), rng.gen::<f32>(), rng.gen::<f32>()))
            .collect();
        let radii: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..0.2)).collect();
        let expected = brute_force(&centers, &radii);

        let coords_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len(4 * n)
            .copy_host_slice(&pack_coords(&centers))
            .build()
            .unwrap();
        let radii_buf = Buffer::<f32>::builder()
            .queue(queue.clone())
            .len(n)
            .copy_host_slice(&radii)
            .build()
            .unwrap();
        let count_buf = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(1)
            .build()
            .unwrap();
        let pairs_buf = Buffer::<CollisionPair>::builder()
            .queue(queue.clone())
            .len(expected.len().max(1))
            .build()
            .unwrap();

        let event = collider
            .get_collisions(
                &queue,
                &coords_buf,
                &radii_buf,
                &count_buf,
                Some(&pairs_buf),
                expected.len() as u32,
                None,
            )
            .unwrap();
        event.wait_for().unwrap();

        let mut count = vec![0u32; 1];
        count_buf.read(&mut count).enq().unwrap();
        assert_eq!(count[0] as usize, expected.len());

        if !expected.is_empty() {
            let mut pairs = vec![CollisionPair::default(); expected.len()];
            pairs_buf.read(&mut pairs).enq().unwrap();
            assert_eq!(normalize(&pairs), expected);
        }
    }
}
