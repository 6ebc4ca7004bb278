//! Two-stage parallel reduction: scene bounds (component-wise min/max
//! pair) and the plain parallel sum variant.

use std::marker::PhantomData;

use log::debug;
use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use crate::dtype::{is_power_of_two, ClScalar, CoordScalar, VecWidth};
use crate::error::{Error, Result};
use crate::program::build_program;

const SRC: &str = include_str!("kernels/reduce.cl");

/// The accumulator set a reduction program was compiled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// `(min, max)` pair with infinities as identities.
    Bounds,
    /// Single running sum with identity zero.
    Sum,
}

impl ReduceOp {
    fn accumulators(self) -> usize {
        match self {
            ReduceOp::Bounds => 2,
            ReduceOp::Sum => 1,
        }
    }

    fn options(self) -> Vec<String> {
        match self {
            ReduceOp::Bounds => vec![
                "-D N_ACC=2".into(),
                "-D ACC0_INIT=INFINITY".into(),
                "-D ACC0_OP=min".into(),
                "-D ACC1_INIT=(-INFINITY)".into(),
                "-D ACC1_OP=max".into(),
            ],
            ReduceOp::Sum => vec![
                "-D N_ACC=1".into(),
                "-D ACC0_INIT=0".into(),
                "-D ACC0_OP=ACC_ADD".into(),
            ],
        }
    }
}

/// Compiled reduction kernels for one element type, width and accumulator
/// set. Shareable between reducers on one context.
#[derive(Clone)]
pub struct ReductionProgram<T: ClScalar> {
    context: Context,
    program: Program,
    op: ReduceOp,
    width: VecWidth,
    _marker: PhantomData<T>,
}

impl<T: ClScalar> ReductionProgram<T> {
    pub fn new(context: &Context, op: ReduceOp, width: VecWidth) -> Result<Self> {
        let mut options = vec![format!("-D DTYPE={}", width.decl::<T>())];
        if T::NEEDS_FP64 {
            options.push("-D DTYPE_DOUBLE".into());
        }
        options.extend(op.options());
        let program = build_program(context, SRC, &options)?;

        Ok(ReductionProgram {
            context: context.clone(),
            program,
            op,
            width,
            _marker: PhantomData,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn op(&self) -> ReduceOp {
        self.op
    }

    pub fn width(&self) -> VecWidth {
        self.width
    }
}

/// Two-stage reducer: stage one strides `ngroups` work-groups over the
/// input and tree-reduces each group in local memory; stage two reduces
/// the per-group results in a single work-group.
pub struct Reducer<T: ClScalar> {
    program: ReductionProgram<T>,
    ngroups: usize,
    group_size: usize,
    group_buf: Buffer<T>,
}

impl<T: CoordScalar> Reducer<T> {
    /// A `(min, max)` reducer over float elements.
    pub fn bounds(
        context: &Context,
        ngroups: usize,
        group_size: usize,
        width: VecWidth,
    ) -> Result<Self> {
        let program = ReductionProgram::new(context, ReduceOp::Bounds, width)?;
        Self::with_program(program, ngroups, group_size)
    }
}

impl<T: ClScalar> Reducer<T> {
    /// A summing reducer, identity zero.
    pub fn sum(
        context: &Context,
        ngroups: usize,
        group_size: usize,
        width: VecWidth,
    ) -> Result<Self> {
        let program = ReductionProgram::new(context, ReduceOp::Sum, width)?;
        Self::with_program(program, ngroups, group_size)
    }

    pub fn with_program(
        program: ReductionProgram<T>,
        ngroups: usize,
        group_size: usize,
    ) -> Result<Self> {
        check_shape(ngroups, group_size)?;
        let group_buf = alloc_group_buf(&program, ngroups)?;

        Ok(Reducer {
            program,
            ngroups,
            group_size,
            group_buf,
        })
    }

    pub fn ngroups(&self) -> usize {
        self.ngroups
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn width(&self) -> VecWidth {
        self.program.width()
    }

    /// Change the launch shape; the reducer is untouched on error.
    pub fn resize(&mut self, ngroups: Option<usize>, group_size: Option<usize>) -> Result<()> {
        let ngroups = ngroups.unwrap_or(self.ngroups);
        let group_size = group_size.unwrap_or(self.group_size);
        check_shape(ngroups, group_size)?;

        if ngroups != self.ngroups {
            debug!("reducer group buffer reallocated for {} groups", ngroups);
            self.group_buf = alloc_group_buf(&self.program, ngroups)?;
        }
        self.ngroups = ngroups;
        self.group_size = group_size;
        Ok(())
    }

    /// Reduce `values[0..n]` (n elements of the configured width) into
    /// `out`: slot 0 receives the first accumulator, slot 1 the second.
    pub fn reduce(
        &self,
        queue: &Queue,
        n: usize,
        values: &Buffer<T>,
        out: &Buffer<T>,
        wait_for: Option<&EventList>,
    ) -> Result<Event> {
        let lanes = self.program.width().padded_lanes();
        let n_acc = self.program.op().accumulators();

        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("reduce1")
            .queue(queue.clone())
            .global_work_size(self.ngroups * self.group_size)
            .local_work_size(self.group_size)
            .arg(values)
            .arg(n as u64)
            .arg(&self.group_buf)
            .arg_local::<T>(self.group_size * n_acc * lanes)
            .build()?;
        let mut stage1 = Event::empty();
        let mut cmd = kernel.cmd().enew(&mut stage1);
        if let Some(wait) = wait_for {
            cmd = cmd.ewait(wait);
        }
        unsafe {
            cmd.enq()?;
        }

        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("reduce2")
            .queue(queue.clone())
            .global_work_size(self.ngroups)
            .local_work_size(self.ngroups)
            .arg(&self.group_buf)
            .arg(out)
            .arg_local::<T>(self.ngroups * n_acc * lanes)
            .build()?;
        let mut stage2 = Event::empty();
        unsafe {
            kernel.cmd().ewait(&stage1).enew(&mut stage2).enq()?;
        }
        Ok(stage2)
    }
}

fn check_shape(ngroups: usize, group_size: usize) -> Result<()> {
    if ngroups == 0 {
        return Err(Error::Config("group count must be positive".into()));
    }
    if !is_power_of_two(group_size) {
        return Err(Error::Config(format!(
            "group size ({}) must be a power of two",
            group_size
        )));
    }
    Ok(())
}

fn alloc_group_buf<T: ClScalar>(
    program: &ReductionProgram<T>,
    ngroups: usize,
) -> Result<Buffer<T>> {
    let len = ngroups * program.op().accumulators() * program.width().padded_lanes();
    let buf = Buffer::<T>::builder()
        .context(program.context())
        .len(len)
        .flags(ocl::flags::MemFlags::new().read_write().host_no_access())
        .build()?;
    Ok(buf)
}
